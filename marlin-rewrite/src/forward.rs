//! Reverse-proxy forwarding: issue the rewritten request outbound and copy
//! the answer back into the original message.

use crate::rewriter::UrlRewriter;
use async_trait::async_trait;
use marlin_core::config::ClientSettings;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use marlin_site::handler::{HandlerOutcome, SiteHandler};
use marlin_site::site::SiteTimeouts;
use std::sync::Arc;
use tracing::{debug, warn};

/// Headers that never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// The outbound HTTP client, configured from the `client` section.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(settings: &ClientSettings) -> Result<Self, MarlinError> {
        // The dial window covers name resolution plus connect; the total
        // request window spans send plus receive.
        let timeouts = SiteTimeouts::from_client_settings(settings);
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.agent.clone())
            .connect_timeout(timeouts.resolve + timeouts.connect)
            .timeout(timeouts.send + timeouts.receive)
            .gzip(settings.http_compression);
        if settings.use_proxy
            && let Some(proxy) = &settings.proxy
        {
            let mut proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| MarlinError::ConfigInvalid(format!("bad proxy: {e}")))?;
            if let (Some(user), Some(password)) = (&settings.proxy_user, &settings.proxy_password) {
                proxy = proxy.basic_auth(user, password);
            }
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| MarlinError::Internal(format!("client build failed: {e}")))?;
        Ok(Self { client })
    }

    /// Send the message outbound to its (rewritten) URL, preserving method,
    /// hop-safe headers and body. The answer's status, headers and body are
    /// copied back into the message.
    pub async fn forward(&self, message: &mut HttpMessage, retry_count: u32) -> Result<(), MarlinError> {
        let target = message.url.url();
        let mut attempt = 0;
        loop {
            match self.try_forward(message, &target).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry_count => {
                    attempt += 1;
                    debug!(target = %target, attempt, error = %e, "Forward retry");
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "Forward failed");
                    return Err(MarlinError::BackendUnavailable(target));
                }
            }
        }
    }

    async fn try_forward(&self, message: &mut HttpMessage, target: &str) -> Result<(), reqwest::Error> {
        let mut request = self.client.request(message.method.clone(), target);
        for (name, value) in message.headers.iter() {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            request = request.header(name, value);
        }
        if !message.body.is_empty() {
            request = request.body(message.body.bytes());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
            })
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        message.reset();
        message.set_status(status);
        for (name, value) in headers {
            message.headers.append(name, value);
        }
        message.body.set(body);
        Ok(())
    }
}

// ── The proxy pipeline ───────────────────────────────────────

/// A rewriter chain plus the outbound client: the reverse-proxy stage.
pub struct RewriteProxy {
    rewriter: UrlRewriter,
    forwarder: Forwarder,
    retry_count: u32,
}

impl RewriteProxy {
    pub fn new(rewriter: UrlRewriter, settings: &ClientSettings) -> Result<Self, MarlinError> {
        Ok(Self {
            rewriter,
            forwarder: Forwarder::new(settings)?,
            retry_count: settings.retry_count,
        })
    }

    pub fn rewriter(&self) -> &UrlRewriter {
        &self.rewriter
    }

    /// Rewrite and forward. `Ok(false)` means no rewriter in the chain
    /// matched and the message is untouched ("not handled"). On backend
    /// failure the message becomes a `502 Bad Gateway` response.
    pub async fn process_message(&self, message: &mut HttpMessage) -> Result<bool, MarlinError> {
        let mut url = message.url.clone();
        let mut routing = message.routing.clone();
        if self.rewriter.rewrite_chained(&mut url, &mut routing) == 0 {
            return Ok(false);
        }
        message.url = url;
        message.routing = routing;

        match self.forwarder.forward(message, self.retry_count).await {
            Ok(()) => Ok(true),
            Err(_) => {
                message.reset();
                message.set_status(502);
                message.set_body(&b"{\"error\":\"Bad Gateway\",\"status\":502}"[..], "application/json");
                Ok(true)
            }
        }
    }
}

/// Site handler wrapping the proxy: unmatched requests answer 404.
pub struct ProxyHandler {
    proxy: Arc<RewriteProxy>,
}

impl ProxyHandler {
    pub fn new(proxy: Arc<RewriteProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl SiteHandler for ProxyHandler {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        if !self.proxy.process_message(message).await? {
            message.reset();
            message.set_status(404);
        }
        Ok(HandlerOutcome::Reply)
    }
}
