//! Declarative URL rewriting.
//!
//! A rewriter holds one mapping per kind (protocol, server, port, path,
//! extension, route segments, route deletion, from-route) and applies them
//! in a fixed order, counting substitutions. Rewriters chain; the first
//! one that mutates the URL wins.

use marlin_core::config::RewriterSettings;
use marlin_core::message::Routing;
use marlin_core::url::CrackedUrl;
use std::collections::HashMap;

#[derive(Default)]
pub struct UrlRewriter {
    protocol_map: HashMap<String, String>,
    server_map: HashMap<String, String>,
    port_map: HashMap<u16, u16>,
    path_map: HashMap<String, String>,
    extension_map: HashMap<String, String>,
    route_map: HashMap<usize, HashMap<String, String>>,
    del_routes: Vec<usize>,
    from_route: Option<usize>,
    next: Option<Box<UrlRewriter>>,
}

impl UrlRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from one `Rewriter` configuration section. A section declares
    /// at most one mapping per kind; more rules need chained rewriters.
    pub fn from_settings(settings: &RewriterSettings) -> Self {
        let mut rewriter = Self::new();
        if let (Some(from), Some(to)) = (&settings.protocol, &settings.target_protocol) {
            rewriter.add_protocol_mapping(from, to);
        }
        if let (Some(from), Some(to)) = (&settings.server, &settings.target_server) {
            rewriter.add_server_mapping(from, to);
        }
        if let (Some(from), Some(to)) = (settings.port, settings.target_port) {
            rewriter.add_port_mapping(from, to);
        }
        if let (Some(from), Some(to)) = (&settings.path, &settings.target_path) {
            rewriter.add_path_mapping(from, to);
        }
        if let (Some(from), Some(to)) = (&settings.extension, &settings.target_extension) {
            rewriter.add_extension_mapping(from, to);
        }
        let routes = [
            (&settings.route0, &settings.target_route0),
            (&settings.route1, &settings.target_route1),
            (&settings.route2, &settings.target_route2),
            (&settings.route3, &settings.target_route3),
            (&settings.route4, &settings.target_route4),
        ];
        for (index, (from, to)) in routes.iter().enumerate() {
            if let (Some(from), Some(to)) = (from.as_ref(), to.as_ref()) {
                rewriter.add_route_mapping(index, from, to);
            }
        }
        if let Some(remove) = &settings.remove_route {
            for part in remove.split(',') {
                if let Ok(index) = part.trim().parse() {
                    rewriter.add_del_route(index);
                }
            }
        }
        if let Some(start) = settings.start_route {
            rewriter.add_from_route(start);
        }
        rewriter
    }

    // ── Mapping registration ─────────────────────────────────

    pub fn add_protocol_mapping(&mut self, from: &str, to: &str) {
        self.protocol_map.insert(from.to_ascii_lowercase(), to.to_ascii_lowercase());
    }

    pub fn add_server_mapping(&mut self, from: &str, to: &str) {
        self.server_map.insert(from.to_ascii_lowercase(), to.to_ascii_lowercase());
    }

    pub fn add_port_mapping(&mut self, from: u16, to: u16) {
        self.port_map.insert(from, to);
    }

    pub fn add_path_mapping(&mut self, from: &str, to: &str) {
        self.path_map.insert(from.to_string(), to.to_string());
    }

    pub fn add_extension_mapping(&mut self, from: &str, to: &str) {
        self.extension_map.insert(from.to_string(), to.to_string());
    }

    pub fn add_route_mapping(&mut self, index: usize, from: &str, to: &str) {
        self.route_map.entry(index).or_default().insert(from.to_string(), to.to_string());
    }

    pub fn add_del_route(&mut self, index: usize) {
        self.del_routes.push(index);
    }

    pub fn add_from_route(&mut self, index: usize) {
        self.from_route = Some(index);
    }

    /// Append a rewriter at the tail of the chain.
    pub fn add_rewriter(&mut self, rewriter: UrlRewriter) {
        match &mut self.next {
            Some(next) => next.add_rewriter(rewriter),
            None => self.next = Some(Box::new(rewriter)),
        }
    }

    pub fn chain_len(&self) -> usize {
        1 + self.next.as_ref().map(|n| n.chain_len()).unwrap_or(0)
    }

    // ── Rewriting ────────────────────────────────────────────

    /// Apply this rewriter's mappings to the URL and routing. Returns the
    /// number of substitutions made; `0` leaves both untouched.
    pub fn rewrite(&self, url: &mut CrackedUrl, routing: &mut Routing) -> usize {
        let mut changes = 0;
        changes += self.rewrite_protocol(url);
        changes += self.rewrite_server(url);
        changes += self.rewrite_port(url);
        changes += self.rewrite_path(url);
        changes += self.rewrite_extension(url);
        changes += self.rewrite_from_route(url, routing);
        changes += self.rewrite_route(url, routing);
        changes += self.rewrite_del_route(url, routing);
        changes
    }

    /// Walk the chain: the first rewriter that mutates wins. Returns its
    /// change count, or 0 when no rewriter matched.
    pub fn rewrite_chained(&self, url: &mut CrackedUrl, routing: &mut Routing) -> usize {
        let changes = self.rewrite(url, routing);
        if changes > 0 {
            return changes;
        }
        match &self.next {
            Some(next) => next.rewrite_chained(url, routing),
            None => 0,
        }
    }

    fn rewrite_protocol(&self, url: &mut CrackedUrl) -> usize {
        match self.protocol_map.get(&url.scheme) {
            Some(to) => {
                url.scheme = to.clone();
                1
            }
            None => 0,
        }
    }

    fn rewrite_server(&self, url: &mut CrackedUrl) -> usize {
        match self.server_map.get(&url.host) {
            Some(to) => {
                url.host = to.clone();
                1
            }
            None => 0,
        }
    }

    fn rewrite_port(&self, url: &mut CrackedUrl) -> usize {
        match self.port_map.get(&url.port) {
            Some(to) => {
                url.port = *to;
                1
            }
            None => 0,
        }
    }

    fn rewrite_path(&self, url: &mut CrackedUrl) -> usize {
        match self.path_map.get(&url.path) {
            Some(to) => {
                url.path = to.clone();
                1
            }
            None => 0,
        }
    }

    fn rewrite_extension(&self, url: &mut CrackedUrl) -> usize {
        let Some(extension) = url.extension() else {
            return 0;
        };
        match self.extension_map.get(extension) {
            Some(to) => {
                let to = to.clone();
                url.set_extension(&to);
                1
            }
            None => 0,
        }
    }

    /// Keep only the routing tail from the configured index on.
    fn rewrite_from_route(&self, url: &mut CrackedUrl, routing: &Routing) -> usize {
        let Some(from) = self.from_route else {
            return 0;
        };
        if routing.len() <= from {
            return 0;
        }
        url.path = rebuild_path(&routing[from..]);
        1
    }

    /// Substitute individual routing segments by index.
    fn rewrite_route(&self, url: &mut CrackedUrl, routing: &mut Routing) -> usize {
        let mut changes = 0;
        for (index, segment) in routing.iter_mut().enumerate() {
            if let Some(map) = self.route_map.get(&index)
                && let Some(to) = map.get(segment.as_str())
            {
                *segment = to.clone();
                changes += 1;
            }
        }
        if changes > 0 {
            url.path = rebuild_path(routing);
        }
        changes
    }

    /// Delete routing segments by index, in registration order.
    fn rewrite_del_route(&self, url: &mut CrackedUrl, routing: &mut Routing) -> usize {
        let mut changes = 0;
        for index in &self.del_routes {
            if *index < routing.len() {
                routing.remove(*index);
                changes += 1;
            }
        }
        if changes > 0 {
            url.path = rebuild_path(routing);
        }
        changes
    }
}

fn rebuild_path(segments: &[String]) -> String {
    let mut path = String::from("/");
    for segment in segments {
        path.push_str(segment);
        path.push('/');
    }
    path
}
