//! The site model: one listening registration bound to a URL prefix and
//! port, with its dispatch policy, filter chain and verb handlers.

use crate::handler::{Filter, FilterChain, HandlerMap, SiteHandler};
use arc_swap::ArcSwapOption;
use http::Method;
use marlin_core::config::ClientSettings;
use marlin_core::cookie::CookieDefaults;
use marlin_core::error::MarlinError;
use marlin_core::headers::SecurityHeaders;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

// ── Prefix kinds ─────────────────────────────────────────────

/// How the site binds its listening prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// `+` binding: every host name on the port.
    Strong,
    /// Fully-qualified host plus domain.
    Full,
    /// DNS-style host name.
    Named,
    /// Explicit IP address.
    Address,
    /// `*` wildcard: whatever nothing else matched.
    Weak,
}

impl SiteKind {
    /// Tie-break rank: Strong > Full > Named > Address > Weak.
    pub fn rank(&self) -> u8 {
        match self {
            SiteKind::Strong => 0,
            SiteKind::Full => 1,
            SiteKind::Named => 2,
            SiteKind::Address => 3,
            SiteKind::Weak => 4,
        }
    }

    /// Parse the `ChannelType` configuration value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "strong" => Some(SiteKind::Strong),
            "full" => Some(SiteKind::Full),
            "named" => Some(SiteKind::Named),
            "address" => Some(SiteKind::Address),
            "weak" => Some(SiteKind::Weak),
            _ => None,
        }
    }

    /// The host part of the listening prefix URL for this kind.
    fn host_placeholder(&self) -> &'static str {
        match self {
            SiteKind::Strong => "+",
            SiteKind::Weak => "*",
            _ => "",
        }
    }
}

// ── Authentication ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Anonymous,
    Basic,
    Ntlm,
    Negotiate,
    Digest,
    Kerberos,
}

impl AuthScheme {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "anonymous" => Some(AuthScheme::Anonymous),
            "basic" => Some(AuthScheme::Basic),
            "ntlm" => Some(AuthScheme::Ntlm),
            "negotiate" => Some(AuthScheme::Negotiate),
            "digest" => Some(AuthScheme::Digest),
            "kerberos" => Some(AuthScheme::Kerberos),
            _ => None,
        }
    }

    /// The `WWW-Authenticate` challenge values for a 401 answer.
    pub fn challenge(&self, realm: &str, domain: Option<&str>) -> Vec<String> {
        match self {
            AuthScheme::Anonymous => Vec::new(),
            AuthScheme::Basic => vec![format!(r#"Basic realm="{realm}""#)],
            AuthScheme::Ntlm => vec!["NTLM".to_string()],
            AuthScheme::Negotiate | AuthScheme::Kerberos => vec!["Negotiate".to_string()],
            AuthScheme::Digest => {
                let domain = domain.unwrap_or("/");
                vec![format!(r#"Digest realm="{realm}", domain="{domain}", qop="auth""#)]
            }
        }
    }
}

/// Message-level encryption demanded by the site. The primitives live
/// behind an external seam; the level gates which requests are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionLevel {
    #[default]
    None,
    Signing,
    Body,
    Message,
}

// ── Site policy ──────────────────────────────────────────────

/// Per-site timeouts. `receive` bounds the inbound body read and `send`
/// the response write; exceeding either resets the connection and emits a
/// timing record. `resolve` and `connect` govern the outbound forwarding
/// leg (an accepted connection has no resolve/connect phase of its own)
/// and feed the forwarder's dial timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTimeouts {
    pub resolve: Duration,
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for SiteTimeouts {
    fn default() -> Self {
        Self {
            resolve: Duration::from_secs(5),
            connect: Duration::from_secs(10),
            send: Duration::from_secs(30),
            receive: Duration::from_secs(30),
        }
    }
}

impl SiteTimeouts {
    /// Build from the `client` section's four timeout keys; the same
    /// values serve the site's inbound bounds and its outbound leg.
    pub fn from_client_settings(settings: &ClientSettings) -> Self {
        Self {
            resolve: Duration::from_millis(settings.timeout_resolve_ms),
            connect: Duration::from_millis(settings.timeout_connect_ms),
            send: Duration::from_millis(settings.timeout_send_ms),
            receive: Duration::from_millis(settings.timeout_receive_ms),
        }
    }
}

/// Everything a site knows besides its filters and handlers.
#[derive(Debug, Clone)]
pub struct SitePolicy {
    pub auth_scheme: AuthScheme,
    pub auth_realm: String,
    pub auth_domain: Option<String>,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
    pub ntlm_cache: bool,

    /// Accepted request content types; empty accepts everything.
    pub content_types: Vec<String>,

    pub headers: SecurityHeaders,
    pub cookie_defaults: CookieDefaults,

    pub compression: bool,
    pub compress_limit: usize,

    /// Handlers run without holding the accept slot.
    pub is_async: bool,
    /// GET handlers on this site may upgrade to SSE.
    pub is_event_stream: bool,

    pub encryption: EncryptionLevel,
    pub encryption_password: Option<String>,

    pub timeouts: SiteTimeouts,

    // WebSocket surface
    pub socket_keepalive_ms: u64,
    pub socket_buffer_size: usize,
    /// Testing escape hatch; RFC-6455 requires client masking.
    pub disable_client_masking: bool,
    pub disable_utf8_verify: bool,
}

impl Default for SitePolicy {
    fn default() -> Self {
        Self {
            auth_scheme: AuthScheme::Anonymous,
            auth_realm: "Marlin".to_string(),
            auth_domain: None,
            auth_user: None,
            auth_password: None,
            ntlm_cache: false,
            content_types: Vec::new(),
            headers: SecurityHeaders::default(),
            cookie_defaults: CookieDefaults::default(),
            compression: false,
            compress_limit: 4096,
            is_async: false,
            is_event_stream: false,
            encryption: EncryptionLevel::None,
            encryption_password: None,
            timeouts: SiteTimeouts::default(),
            socket_keepalive_ms: 30_000,
            socket_buffer_size: 32 * 1024,
            disable_client_masking: false,
            disable_utf8_verify: false,
        }
    }
}

impl SitePolicy {
    /// Accept the request's content type? An empty set accepts everything.
    pub fn accepts_content_type(&self, content_type: Option<&str>) -> bool {
        if self.content_types.is_empty() {
            return true;
        }
        match content_type {
            Some(ct) => self.content_types.iter().any(|a| a.eq_ignore_ascii_case(ct)),
            None => false,
        }
    }
}

// ── Site key and state ───────────────────────────────────────

/// Identity of a site inside the registry. The prefix is stored normalized
/// (leading and trailing slash); comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteKey {
    pub port: u16,
    pub prefix: String,
}

impl SiteKey {
    pub fn new(port: u16, prefix: &str) -> Result<Self, MarlinError> {
        Ok(Self { port, prefix: normalize_prefix(prefix)? })
    }

    /// Registry map key: port plus case-folded prefix.
    pub fn map_key(&self) -> String {
        format!("{}|{}", self.port, self.prefix.to_ascii_lowercase())
    }
}

/// Normalize a site prefix: absolute, trailing slash, no dot segments.
pub fn normalize_prefix(prefix: &str) -> Result<String, MarlinError> {
    if !prefix.starts_with('/') {
        return Err(MarlinError::InvalidPrefix(format!("prefix must be absolute: {prefix}")));
    }
    if prefix.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(MarlinError::InvalidPrefix(format!("prefix may not contain dot segments: {prefix}")));
    }
    let mut normalized = prefix.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SiteState {
    Configured = 0,
    Started = 1,
    Stopped = 2,
}

impl SiteState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SiteState::Started,
            2 => SiteState::Stopped,
            _ => SiteState::Configured,
        }
    }
}

// ── Site ─────────────────────────────────────────────────────

/// A registered site. Mutable while `Configured`; `start` freezes the
/// policy, filters and handlers into an immutable [`StartedSite`] snapshot
/// that the dispatch path reads lock-free.
#[derive(Debug)]
pub struct Site {
    key: SiteKey,
    kind: SiteKind,
    secure: bool,
    host: std::sync::OnceLock<String>,
    parent: Option<SiteKey>,
    order: u64,
    state: AtomicU8,
    setup: Mutex<SiteSetup>,
    started: ArcSwapOption<StartedSite>,
}

#[derive(Debug)]
struct SiteSetup {
    policy: SitePolicy,
    filters: FilterChain,
    handlers: HandlerMap,
}

/// Immutable dispatch snapshot of a started site.
#[derive(Debug)]
pub struct StartedSite {
    pub key: SiteKey,
    pub kind: SiteKind,
    pub secure: bool,
    pub order: u64,
    pub policy: SitePolicy,
    pub filters: FilterChain,
    pub handlers: HandlerMap,
}

impl Site {
    pub(crate) fn new(
        key: SiteKey,
        kind: SiteKind,
        secure: bool,
        parent: Option<SiteKey>,
        order: u64,
        inherited: Option<SitePolicy>,
    ) -> Self {
        Self {
            key,
            kind,
            secure,
            host: std::sync::OnceLock::new(),
            parent,
            order,
            state: AtomicU8::new(SiteState::Configured as u8),
            setup: Mutex::new(SiteSetup {
                policy: inherited.unwrap_or_default(),
                filters: FilterChain::new(),
                handlers: HandlerMap::new(),
            }),
            started: ArcSwapOption::empty(),
        }
    }

    pub fn key(&self) -> &SiteKey {
        &self.key
    }

    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn parent(&self) -> Option<&SiteKey> {
        self.parent.as_ref()
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn state(&self) -> SiteState {
        SiteState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bind the concrete host name for `Named` / `Address` / `Full` kinds.
    /// Only the first call takes effect.
    pub fn set_host(&self, host: impl Into<String>) {
        let _ = self.host.set(host.into());
    }

    /// The listening prefix URL, e.g. `http://+:1200/MarlinTest/`.
    pub fn prefix_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let host = match self.host.get() {
            Some(host) => host.as_str(),
            None => self.kind.host_placeholder(),
        };
        format!("{scheme}://{host}:{}{}", self.key.port, self.key.prefix)
    }

    /// Mutate the policy while the site is still configurable.
    pub fn update_policy(&self, update: impl FnOnce(&mut SitePolicy)) -> Result<(), MarlinError> {
        self.ensure_configurable()?;
        let mut setup = self.setup.lock().expect("site setup lock");
        update(&mut setup.policy);
        Ok(())
    }

    /// Snapshot of the current policy (configuration phase).
    pub fn policy(&self) -> SitePolicy {
        self.setup.lock().expect("site setup lock").policy.clone()
    }

    pub fn add_filter(&self, filter: Arc<dyn Filter>) -> Result<(), MarlinError> {
        self.ensure_configurable()?;
        self.setup.lock().expect("site setup lock").filters.add(filter)
    }

    pub fn set_handler(&self, verb: Method, handler: Arc<dyn SiteHandler>) -> Result<(), MarlinError> {
        self.ensure_configurable()?;
        self.setup.lock().expect("site setup lock").handlers.set(verb, handler);
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<(), MarlinError> {
        match self.state() {
            SiteState::Configured => Ok(()),
            _ => Err(MarlinError::ConfigInvalid(format!(
                "site {} is no longer configurable",
                self.prefix_url()
            ))),
        }
    }

    /// Validate and freeze. `Configured → Started`.
    pub(crate) fn start(&self) -> Result<Arc<StartedSite>, MarlinError> {
        if self.state() != SiteState::Configured {
            return Err(MarlinError::NotConfigured(self.prefix_url()));
        }
        let setup = self.setup.lock().expect("site setup lock");
        setup.policy.headers.validate()?;

        let snapshot = Arc::new(StartedSite {
            key: self.key.clone(),
            kind: self.kind,
            secure: self.secure,
            order: self.order,
            policy: setup.policy.clone(),
            filters: setup.filters.clone(),
            handlers: setup.handlers.clone(),
        });
        self.started.store(Some(Arc::clone(&snapshot)));
        self.state.store(SiteState::Started as u8, Ordering::Release);
        Ok(snapshot)
    }

    /// `Started → Stopped`. The site no longer dispatches.
    pub(crate) fn stop(&self) {
        self.started.store(None);
        self.state.store(SiteState::Stopped as u8, Ordering::Release);
    }

    pub fn started_snapshot(&self) -> Option<Arc<StartedSite>> {
        self.started.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_rank_order() {
        assert!(SiteKind::Strong.rank() < SiteKind::Full.rank());
        assert!(SiteKind::Full.rank() < SiteKind::Named.rank());
        assert!(SiteKind::Named.rank() < SiteKind::Address.rank());
        assert!(SiteKind::Address.rank() < SiteKind::Weak.rank());
    }

    #[test]
    fn kind_parses_channel_type() {
        assert_eq!(SiteKind::parse("Strong"), Some(SiteKind::Strong));
        assert_eq!(SiteKind::parse("weak"), Some(SiteKind::Weak));
        assert_eq!(SiteKind::parse("bogus"), None);
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/Marlin").unwrap(), "/Marlin/");
        assert_eq!(normalize_prefix("/Marlin/").unwrap(), "/Marlin/");
        assert!(normalize_prefix("Marlin/").is_err());
        assert!(normalize_prefix("/a/../b/").is_err());
    }

    #[test]
    fn site_key_map_key_is_case_folded() {
        let a = SiteKey::new(80, "/Marlin/").unwrap();
        let b = SiteKey::new(80, "/marlin/").unwrap();
        assert_eq!(a.map_key(), b.map_key());
    }

    #[test]
    fn prefix_url_by_kind() {
        let key = SiteKey::new(1200, "/MarlinTest/").unwrap();
        let strong = Site::new(key.clone(), SiteKind::Strong, false, None, 0, None);
        assert_eq!(strong.prefix_url(), "http://+:1200/MarlinTest/");
        let weak = Site::new(key.clone(), SiteKind::Weak, true, None, 0, None);
        assert_eq!(weak.prefix_url(), "https://*:1200/MarlinTest/");
    }

    #[test]
    fn start_freezes_configuration() {
        let key = SiteKey::new(80, "/App/").unwrap();
        let site = Site::new(key, SiteKind::Strong, false, None, 0, None);
        site.update_policy(|p| p.compression = true).unwrap();
        let snapshot = site.start().unwrap();
        assert!(snapshot.policy.compression);
        assert_eq!(site.state(), SiteState::Started);
        // configuration after start is refused
        assert!(site.update_policy(|p| p.compression = false).is_err());
        // double start is NotConfigured
        assert!(matches!(site.start(), Err(MarlinError::NotConfigured(_))));
    }

    #[test]
    fn start_validates_cors() {
        use marlin_core::headers::CorsPolicy;
        let key = SiteKey::new(80, "/Cors/").unwrap();
        let site = Site::new(key, SiteKind::Strong, false, None, 0, None);
        site.update_policy(|p| {
            p.headers.cors = Some(CorsPolicy {
                allow_origin: "*".into(),
                allow_credentials: true,
                ..Default::default()
            });
        })
        .unwrap();
        match site.start() {
            Err(MarlinError::ConfigInvalid(msg)) => {
                assert!(msg.contains("credentials require explicit origin"))
            }
            other => panic!("expected ConfigInvalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn auth_challenges() {
        assert_eq!(
            AuthScheme::Basic.challenge("Marlin", None),
            vec![r#"Basic realm="Marlin""#.to_string()]
        );
        assert_eq!(AuthScheme::Ntlm.challenge("x", None), vec!["NTLM".to_string()]);
        assert!(AuthScheme::Anonymous.challenge("x", None).is_empty());
        assert!(AuthScheme::Digest.challenge("r", Some("/app"))[0].contains(r#"domain="/app""#));
    }

    #[test]
    fn timeouts_come_from_the_client_section() {
        let settings = ClientSettings {
            timeout_resolve_ms: 1_000,
            timeout_connect_ms: 2_000,
            timeout_send_ms: 3_000,
            timeout_receive_ms: 4_000,
            ..Default::default()
        };
        let timeouts = SiteTimeouts::from_client_settings(&settings);
        assert_eq!(timeouts.resolve, Duration::from_secs(1));
        assert_eq!(timeouts.connect, Duration::from_secs(2));
        assert_eq!(timeouts.send, Duration::from_secs(3));
        assert_eq!(timeouts.receive, Duration::from_secs(4));
    }

    #[test]
    fn content_type_acceptance() {
        let mut policy = SitePolicy::default();
        assert!(policy.accepts_content_type(Some("application/json")));
        assert!(policy.accepts_content_type(None));
        policy.content_types = vec!["application/json".into(), "text/xml".into()];
        assert!(policy.accepts_content_type(Some("application/JSON")));
        assert!(!policy.accepts_content_type(Some("text/plain")));
        assert!(!policy.accepts_content_type(None));
    }
}
