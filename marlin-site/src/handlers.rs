//! Built-in handlers: static file serving under the web root, OPTIONS
//! enumeration and TRACE echo.

use crate::handler::{HandlerOutcome, SiteHandler};
use async_trait::async_trait;
use http::Method;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use std::path::{Component, Path, PathBuf};

// ── File handler ─────────────────────────────────────────────

/// Serves GET requests from files under the configured web root. The
/// routing segments past the site prefix select the file.
pub struct FileHandler {
    web_root: PathBuf,
    index_file: String,
}

impl FileHandler {
    pub fn new(web_root: impl Into<PathBuf>) -> Self {
        Self {
            web_root: web_root.into(),
            index_file: "index.html".to_string(),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index_file = index.into();
        self
    }

    /// Resolve routing segments to a path inside the web root. Dot
    /// segments and absolute components are rejected.
    fn resolve(&self, routing: &[String]) -> Option<PathBuf> {
        let mut path = self.web_root.clone();
        if routing.is_empty() {
            path.push(&self.index_file);
            return Some(path);
        }
        for segment in routing {
            let part = Path::new(segment);
            let mut components = part.components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(segment),
                _ => return None,
            }
        }
        Some(path)
    }
}

#[async_trait]
impl SiteHandler for FileHandler {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        if message.method != Method::GET {
            message.set_status(405);
            return Ok(HandlerOutcome::Reply);
        }
        let Some(path) = self.resolve(&message.routing) else {
            message.set_status(404);
            return Ok(HandlerOutcome::Reply);
        };
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let content_type = content_type_for(&path);
                message.set_status(200);
                message.set_body(data, content_type);
            }
            Err(_) => {
                tracing::debug!(path = %path.display(), "File not found");
                message.set_status(404);
            }
        }
        Ok(HandlerOutcome::Reply)
    }
}

/// MIME type from the file extension; octet-stream when unknown.
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "text/xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

// ── OPTIONS handler ──────────────────────────────────────────

/// Replies `200` with the `Allow` header listing the supported verbs.
pub struct OptionsHandler {
    allow: String,
}

impl OptionsHandler {
    pub fn new(verbs: &[Method]) -> Self {
        let allow = verbs
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self { allow }
    }
}

#[async_trait]
impl SiteHandler for OptionsHandler {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        message.set_status(200);
        message.headers.set("Allow", self.allow.clone());
        message.headers.set("Content-Length", "0");
        Ok(HandlerOutcome::Reply)
    }
}

// ── TRACE handler ────────────────────────────────────────────

/// Echoes the request back as `message/http`.
pub struct TraceHandler;

#[async_trait]
impl SiteHandler for TraceHandler {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        let mut echo = format!(
            "{} {} HTTP/1.1\r\n",
            message.method,
            message.url.encoded_path_and_query()
        );
        for (name, value) in message.headers.iter() {
            echo.push_str(name);
            echo.push_str(": ");
            echo.push_str(value);
            echo.push_str("\r\n");
        }
        echo.push_str("\r\n");
        message.set_status(200);
        message.set_body(echo.into_bytes(), "message/http");
        Ok(HandlerOutcome::Reply)
    }
}
