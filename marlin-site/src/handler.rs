//! Filter and handler capability surface.
//!
//! A filter is an ordered pre-handler hook that can short-circuit the
//! request. A handler is the terminal producer of a response for one HTTP
//! verb on a site, and may instead opt the connection into one of the
//! streaming engines through its outcome.

use async_trait::async_trait;
use http::Method;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use std::collections::HashMap;
use std::sync::Arc;

/// What a filter decided about the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Continue to the next filter / the handler.
    Continue,
    /// Processing stops; the filter has produced the response.
    Stop,
}

/// Ordered pre-handler hook. Filters of a site run in strictly ascending
/// priority; priorities are unique within a site.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> u32;
    fn handle(&self, message: &mut HttpMessage) -> Result<FilterAction, MarlinError>;
}

/// What the handler produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The message was mutated into the response; emit it.
    Reply,
    /// Detach the connection into the SSE engine.
    UpgradeSse,
    /// Detach the connection into the WebSocket engine.
    UpgradeWebSocket,
}

/// Terminal producer of a response for one verb on a site.
#[async_trait]
pub trait SiteHandler: Send + Sync {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError>;
}

// ── Closure adapters ─────────────────────────────────────────

/// Closure-backed filter, for application wiring and tests.
pub struct FnFilter<F> {
    name: String,
    priority: u32,
    func: F,
}

impl<F> FnFilter<F>
where
    F: Fn(&mut HttpMessage) -> Result<FilterAction, MarlinError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, priority: u32, func: F) -> Self {
        Self { name: name.into(), priority, func }
    }
}

impl<F> Filter for FnFilter<F>
where
    F: Fn(&mut HttpMessage) -> Result<FilterAction, MarlinError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn handle(&self, message: &mut HttpMessage) -> Result<FilterAction, MarlinError> {
        (self.func)(message)
    }
}

/// Closure-backed synchronous handler.
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut HttpMessage) -> Result<HandlerOutcome, MarlinError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> SiteHandler for FnHandler<F>
where
    F: Fn(&mut HttpMessage) -> Result<HandlerOutcome, MarlinError> + Send + Sync,
{
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        (self.func)(message)
    }
}

// ── Filter chain ─────────────────────────────────────────────

/// The ordered filter list of one site. Immutable once the site starts.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    /// Insert keeping ascending priority order. Duplicate priorities within
    /// a site are a configuration error.
    pub fn add(&mut self, filter: Arc<dyn Filter>) -> Result<(), MarlinError> {
        let priority = filter.priority();
        if self.filters.iter().any(|f| f.priority() == priority) {
            return Err(MarlinError::ConfigInvalid(format!(
                "duplicate filter priority {priority} ({})",
                filter.name()
            )));
        }
        let pos = self.filters.partition_point(|f| f.priority() < priority);
        self.filters.insert(pos, filter);
        Ok(())
    }

    /// Run the chain in ascending priority. `Stop` short-circuits; the
    /// stopping filter owns the response.
    pub fn run(&self, message: &mut HttpMessage) -> Result<FilterAction, MarlinError> {
        for filter in &self.filters {
            tracing::debug!(filter = %filter.name(), priority = filter.priority(), "Running filter");
            match filter.handle(message)? {
                FilterAction::Continue => {}
                FilterAction::Stop => {
                    tracing::debug!(filter = %filter.name(), "Filter stopped the request");
                    return Ok(FilterAction::Stop);
                }
            }
        }
        Ok(FilterAction::Continue)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Filter>> {
        self.filters.iter()
    }
}

impl Clone for FilterChain {
    fn clone(&self) -> Self {
        Self { filters: self.filters.clone() }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.filters.iter().map(|filter| filter.name())).finish()
    }
}

// ── Verb → handler map ───────────────────────────────────────

/// One handler per verb on a site.
#[derive(Default, Clone)]
pub struct HandlerMap {
    handlers: HashMap<Method, Arc<dyn SiteHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Register the handler for a verb, replacing any previous one.
    pub fn set(&mut self, verb: Method, handler: Arc<dyn SiteHandler>) {
        self.handlers.insert(verb, handler);
    }

    pub fn get(&self, verb: &Method) -> Option<&Arc<dyn SiteHandler>> {
        self.handlers.get(verb)
    }

    /// Supported verbs, sorted for a stable `Allow` header.
    pub fn allowed(&self) -> Vec<Method> {
        let mut verbs: Vec<Method> = self.handlers.keys().cloned().collect();
        verbs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        verbs
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}
