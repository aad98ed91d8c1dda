//! Site registry: ordered map of `(port, prefix) → Site` with
//! longest-prefix matching and sub-site parenting.
//!
//! The DashMap holds the source of truth; matching reads an immutable
//! compiled snapshot swapped on every start/stop/delete. The dispatch path
//! never touches the DashMap.

use crate::site::{Site, SiteKey, SiteKind, SitePolicy, SiteState, StartedSite};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use marlin_core::error::MarlinError;
use marlin_core::message::Routing;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// One matchable entry in the compiled snapshot.
struct CompiledEntry {
    prefix_lower: String,
    kind_rank: u8,
    order: u64,
    site: Arc<StartedSite>,
}

/// Immutable matching snapshot: per-port entry lists pre-sorted for the
/// longest-prefix tie-break.
#[derive(Default)]
struct CompiledRegistry {
    by_port: std::collections::HashMap<u16, Vec<CompiledEntry>>,
}

/// The server's site registry.
pub struct SiteRegistry {
    sites: DashMap<String, Arc<Site>>,
    compiled: ArcSwap<CompiledRegistry>,
    next_order: AtomicU64,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self {
            sites: DashMap::new(),
            compiled: ArcSwap::new(Arc::new(CompiledRegistry::default())),
            next_order: AtomicU64::new(0),
        }
    }

    /// Register a new site. A sub-site requires a parent whose prefix is a
    /// proper path-prefix of `prefix` on the same port, and inherits the
    /// parent's policy defaults.
    pub fn create_site(
        &self,
        kind: SiteKind,
        secure: bool,
        port: u16,
        prefix: &str,
        subsite: bool,
    ) -> Result<Arc<Site>, MarlinError> {
        let key = SiteKey::new(port, prefix)?;
        let map_key = key.map_key();
        if self.sites.contains_key(&map_key) {
            return Err(MarlinError::AlreadyRegistered(format!("{port} {prefix}")));
        }

        let (parent, inherited) = if subsite {
            let parent = self
                .parent_of(&key)
                .ok_or_else(|| MarlinError::NoParentSite(format!("{port} {prefix}")))?;
            let policy = parent.policy();
            (Some(parent.key().clone()), Some(inherit_policy(&policy)))
        } else {
            (None, None)
        };

        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let site = Arc::new(Site::new(key, kind, secure, parent, order, inherited));
        info!(prefix = %site.prefix_url(), subsite, "Site registered");
        self.sites.insert(map_key, Arc::clone(&site));
        Ok(site)
    }

    /// Start a registered site: validate, freeze, make matchable.
    pub fn start_site(&self, site: &Arc<Site>) -> Result<(), MarlinError> {
        site.start()?;
        self.rebuild();
        info!(prefix = %site.prefix_url(), "Site started");
        Ok(())
    }

    /// Stop a started site. It stays registered but no longer dispatches.
    pub fn stop_site(&self, site: &Arc<Site>) {
        site.stop();
        self.rebuild();
        info!(prefix = %site.prefix_url(), "Site stopped");
    }

    /// Remove a site. Fails with `HasSubsites` while children are
    /// registered, leaving the tree untouched.
    pub fn delete_site(&self, port: u16, prefix: &str) -> Result<(), MarlinError> {
        let key = SiteKey::new(port, prefix)?;
        let map_key = key.map_key();
        let site = self
            .sites
            .get(&map_key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MarlinError::NotFound(format!("{port} {prefix}")))?;

        if self.has_subsites(&key) {
            return Err(MarlinError::HasSubsites(format!("{port} {prefix}")));
        }

        site.stop();
        self.sites.remove(&map_key);
        self.rebuild();
        info!(prefix = %site.prefix_url(), "Site deleted");
        Ok(())
    }

    /// Look up a registered site by its identity.
    pub fn get_site(&self, port: u16, prefix: &str) -> Option<Arc<Site>> {
        let key = SiteKey::new(port, prefix).ok()?;
        self.sites.get(&key.map_key()).map(|entry| Arc::clone(entry.value()))
    }

    /// Longest-prefix match of a request path on a port.
    ///
    /// Prefix comparison is case-insensitive; the remainder keeps its case
    /// and becomes the routing segment list. Among matches of equal literal
    /// length the kind rank decides, then the earliest registration.
    pub fn find_site(&self, port: u16, path: &str) -> Option<(Arc<StartedSite>, Routing)> {
        let compiled = self.compiled.load();
        let entries = compiled.by_port.get(&port)?;
        let path_lower = path.to_ascii_lowercase();

        for entry in entries {
            let matched = if path_lower.starts_with(&entry.prefix_lower) {
                true
            } else {
                // Allow the prefix itself without the trailing slash
                entry.prefix_lower.strip_suffix('/') == Some(path_lower.as_str())
            };
            if matched {
                let remainder = if path.len() >= entry.prefix_lower.len() {
                    &path[entry.prefix_lower.len()..]
                } else {
                    ""
                };
                let routing: Routing = remainder
                    .split('/')
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string)
                    .collect();
                debug!(port, path, prefix = %entry.site.key.prefix, "Site matched");
                return Some((Arc::clone(&entry.site), routing));
            }
        }
        None
    }

    /// Does this key still have registered sub-sites?
    pub fn has_subsites(&self, key: &SiteKey) -> bool {
        self.sites
            .iter()
            .any(|entry| entry.value().parent() == Some(key))
    }

    /// All registered sites, in registration order.
    pub fn all_sites(&self) -> Vec<Arc<Site>> {
        let mut sites: Vec<Arc<Site>> = self.sites.iter().map(|e| Arc::clone(e.value())).collect();
        sites.sort_by_key(|s| s.order());
        sites
    }

    /// Ports that carry at least one started site.
    pub fn active_ports(&self) -> Vec<u16> {
        let compiled = self.compiled.load();
        let mut ports: Vec<u16> = compiled.by_port.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Stop every site; used by the server drain path.
    pub fn stop_all(&self) {
        for entry in self.sites.iter() {
            entry.value().stop();
        }
        self.rebuild();
    }

    /// The longest registered proper path-prefix of `key` on the same port.
    fn parent_of(&self, key: &SiteKey) -> Option<Arc<Site>> {
        let prefix_lower = key.prefix.to_ascii_lowercase();
        let mut best: Option<Arc<Site>> = None;
        for entry in self.sites.iter() {
            let site = entry.value();
            if site.key().port != key.port {
                continue;
            }
            let candidate = site.key().prefix.to_ascii_lowercase();
            if candidate.len() < prefix_lower.len() && prefix_lower.starts_with(&candidate) {
                match &best {
                    Some(current) if current.key().prefix.len() >= candidate.len() => {}
                    _ => best = Some(Arc::clone(site)),
                }
            }
        }
        best
    }

    /// Rebuild the compiled matching snapshot from the started sites.
    fn rebuild(&self) {
        let mut by_port: std::collections::HashMap<u16, Vec<CompiledEntry>> =
            std::collections::HashMap::new();

        for entry in self.sites.iter() {
            let site = entry.value();
            if site.state() != SiteState::Started {
                continue;
            }
            let Some(snapshot) = site.started_snapshot() else {
                continue;
            };
            by_port.entry(site.key().port).or_default().push(CompiledEntry {
                prefix_lower: site.key().prefix.to_ascii_lowercase(),
                kind_rank: site.kind().rank(),
                order: site.order(),
                site: snapshot,
            });
        }

        for entries in by_port.values_mut() {
            entries.sort_by(|a, b| {
                b.prefix_lower
                    .len()
                    .cmp(&a.prefix_lower.len())
                    .then(a.kind_rank.cmp(&b.kind_rank))
                    .then(a.order.cmp(&b.order))
            });
        }

        self.compiled.store(Arc::new(CompiledRegistry { by_port }));
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The defaults a sub-site takes over from its parent at creation.
fn inherit_policy(parent: &SitePolicy) -> SitePolicy {
    SitePolicy {
        auth_scheme: parent.auth_scheme,
        auth_realm: parent.auth_realm.clone(),
        auth_domain: parent.auth_domain.clone(),
        auth_user: parent.auth_user.clone(),
        auth_password: parent.auth_password.clone(),
        ntlm_cache: parent.ntlm_cache,
        content_types: parent.content_types.clone(),
        headers: parent.headers.clone(),
        cookie_defaults: parent.cookie_defaults.clone(),
        ..SitePolicy::default()
    }
}
