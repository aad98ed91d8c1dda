//! The HTTP message value object.
//!
//! One `HttpMessage` carries a request through the filter chain and the
//! handler; the handler mutates it in place into the response (status,
//! headers, body) and the router emits it. Streaming upgrades leave the
//! message untouched and detach the connection instead.

use crate::cookie::Cookie;
use crate::error::MarlinError;
use crate::url::CrackedUrl;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use http::Method;
use std::io::{Read, Write};
use std::net::SocketAddr;

/// Path segments past the matched site prefix, in order.
pub type Routing = Vec<String>;

// ── Header multimap ──────────────────────────────────────────

/// Ordered header multimap with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// First value for the name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values for the name with one value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Append a value, keeping existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Set only when the name is absent. Returns whether the value was set.
    pub fn set_if_absent(&mut self, name: &str, value: impl Into<String>) -> bool {
        if self.contains(name) {
            return false;
        }
        self.entries.push((name.to_string(), value.into()));
        true
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── File buffer ──────────────────────────────────────────────

/// Message body buffer. In-memory today; the interface keeps the original
/// file-backed contract (reset, length, whole-buffer replacement) so a
/// spill-to-disk variant can slot in behind it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileBuffer {
    data: Bytes,
    gzipped: bool,
}

impl FileBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), gzipped: false }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_gzipped(&self) -> bool {
        self.gzipped
    }

    pub fn set(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
        self.gzipped = false;
    }

    pub fn reset(&mut self) {
        self.data = Bytes::new();
        self.gzipped = false;
    }

    /// Gzip the buffer in place. No-op when already compressed or empty.
    pub fn compress(&mut self) -> Result<(), MarlinError> {
        if self.gzipped || self.data.is_empty() {
            return Ok(());
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(self.data.len() / 2), Compression::default());
        encoder.write_all(&self.data)?;
        self.data = Bytes::from(encoder.finish()?);
        self.gzipped = true;
        Ok(())
    }

    /// Gunzip the buffer in place. No-op when not compressed.
    pub fn decompress(&mut self) -> Result<(), MarlinError> {
        if !self.gzipped {
            return Ok(());
        }
        let mut decoder = GzDecoder::new(self.data.as_ref());
        let mut out = Vec::with_capacity(self.data.len() * 2);
        decoder.read_to_end(&mut out)?;
        self.data = Bytes::from(out);
        self.gzipped = false;
        Ok(())
    }

    /// Mark externally-gzipped content (request bodies arriving with
    /// `Content-Encoding: gzip`).
    pub fn mark_gzipped(&mut self) {
        self.gzipped = true;
    }
}

// ── HTTP message ─────────────────────────────────────────────

/// Request/response value object flowing through sites, filters and
/// handlers.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    pub method: Method,
    pub url: CrackedUrl,
    pub status: u16,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie>,
    pub response_cookies: Vec<Cookie>,
    pub body: FileBuffer,
    pub sender: Option<SocketAddr>,
    pub access_token: Option<String>,
    pub routing: Routing,
    /// Server-internal id of the connection the request arrived on; routes
    /// chunked sends back to the right socket.
    pub connection: Option<u64>,
}

impl HttpMessage {
    pub fn new(method: Method, url: CrackedUrl) -> Self {
        Self {
            method,
            url,
            status: 200,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            response_cookies: Vec::new(),
            body: FileBuffer::default(),
            sender: None,
            access_token: None,
            routing: Routing::new(),
            connection: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookie(name).map(|c| c.value.as_str())
    }

    /// Queue a cookie for the response. Site defaults are applied at
    /// emission time.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.response_cookies.push(cookie);
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set the response body and content type in one go.
    pub fn set_body(&mut self, data: impl Into<Bytes>, content_type: &str) {
        self.body.set(data);
        self.headers.set("Content-Type", content_type);
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(self.body.as_slice()).into_owned()
    }

    /// Clear response-side state for reuse, keeping the request identity
    /// (method, URL, sender, routing).
    pub fn reset(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.response_cookies.clear();
        self.body.reset();
    }

    /// True when the client advertised gzip in `Accept-Encoding`.
    pub fn accepts_gzip(&self) -> bool {
        self.headers
            .get("accept-encoding")
            .map(|v| v.split(',').any(|e| e.trim().split(';').next().unwrap_or("") == "gzip"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> HttpMessage {
        HttpMessage::new(Method::GET, CrackedUrl::parse("http://server/api/x").unwrap())
    }

    #[test]
    fn header_map_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        headers.remove("CONTENT-type");
        assert!(headers.is_empty());
    }

    #[test]
    fn header_map_multivalue_preserves_order() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        let all: Vec<&str> = headers.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
        headers.set("Set-Cookie", "c=3");
        let all: Vec<&str> = headers.get_all("set-cookie").collect();
        assert_eq!(all, vec!["c=3"]);
    }

    #[test]
    fn set_if_absent_does_not_override() {
        let mut headers = HeaderMap::new();
        assert!(headers.set_if_absent("X-Frame-Options", "DENY"));
        assert!(!headers.set_if_absent("x-frame-options", "SAMEORIGIN"));
        assert_eq!(headers.get("X-Frame-Options"), Some("DENY"));
    }

    #[test]
    fn file_buffer_gzip_round_trip() {
        let mut buffer = FileBuffer::new(&b"A body that is long enough to shrink when gzipped. \
            A body that is long enough to shrink when gzipped."[..]);
        let original = buffer.bytes();
        buffer.compress().unwrap();
        assert!(buffer.is_gzipped());
        assert!(buffer.len() < original.len());
        buffer.decompress().unwrap();
        assert_eq!(buffer.bytes(), original);
    }

    #[test]
    fn file_buffer_compress_is_idempotent() {
        let mut buffer = FileBuffer::new(&b"payload"[..]);
        buffer.compress().unwrap();
        let once = buffer.bytes();
        buffer.compress().unwrap();
        assert_eq!(buffer.bytes(), once);
    }

    #[test]
    fn message_cookie_lookup() {
        let mut m = msg();
        m.cookies = Cookie::parse_request_header("GUID=1-2-3; BEAST=Monkey");
        assert_eq!(m.cookie_value("GUID"), Some("1-2-3"));
        assert_eq!(m.cookie_value("BEAST"), Some("Monkey"));
        assert_eq!(m.cookie_value("NONE"), None);
    }

    #[test]
    fn reset_keeps_request_identity() {
        let mut m = msg();
        m.set_status(500);
        m.set_body(&b"oops"[..], "text/plain");
        m.routing = vec!["a".into(), "b".into()];
        m.reset();
        assert_eq!(m.status, 200);
        assert!(m.body.is_empty());
        assert!(m.headers.is_empty());
        assert_eq!(m.method, Method::GET);
        assert_eq!(m.routing, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn accepts_gzip_parses_encoding_lists() {
        let mut m = msg();
        assert!(!m.accepts_gzip());
        m.headers.set("Accept-Encoding", "br;q=1.0, gzip;q=0.8, *;q=0.1");
        assert!(m.accepts_gzip());
        m.headers.set("Accept-Encoding", "identity");
        assert!(!m.accepts_gzip());
    }

    #[test]
    fn content_type_strips_parameters() {
        let mut m = msg();
        m.headers.set("Content-Type", "application/json; charset=utf-8");
        assert_eq!(m.content_type(), Some("application/json"));
    }
}
