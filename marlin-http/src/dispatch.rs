//! Request dispatch: site match, authentication, filter chain, handler and
//! response emission, including the SSE/WebSocket upgrade paths.

use crate::auth::{self, AuthOutcome};
use crate::compress::maybe_compress_response;
use crate::connection::{RequestHead, RequestReader};
use crate::listener::ServerState;
use crate::response::{self, RESP_404, RESP_500};
use crate::sse::SharedWriter;
use crate::ws::handshake;
use crate::ws::session::{SessionSettings, WebSocketSession, run_session};
use http::Method;
use marlin_core::cookie::Cookie;
use marlin_core::error::MarlinError;
use marlin_core::message::{HeaderMap, HttpMessage};
use marlin_core::url::CrackedUrl;
use marlin_observability::logfile::LogLevel;
use marlin_observability::reporting;
use marlin_site::handler::{FilterAction, HandlerOutcome};
use marlin_site::site::StartedSite;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// What the connection loop does next.
pub enum DispatchOutcome {
    /// Keep the connection; the reader comes back for the next request.
    Continue { reader: RequestReader, keep_alive: bool },
    /// Close the connection.
    Close,
    /// The connection was handed to a streaming engine.
    Detached,
}

#[allow(clippy::too_many_arguments)]
pub async fn dispatch_request(
    state: &Arc<ServerState>,
    head: RequestHead,
    mut reader: RequestReader,
    writer: SharedWriter,
    connection_id: u64,
    peer: SocketAddr,
    port: u16,
) -> DispatchOutcome {
    let started_at = Instant::now();
    let keep_alive = head.keep_alive;

    // ── Crack the request target ──
    let host = head.headers.get("host").unwrap_or("localhost").to_string();
    let url = match CrackedUrl::parse_request_target(&head.target, &host, port, false) {
        Ok(url) => url,
        Err(_) => return write_static(&writer, response::RESP_400, DispatchOutcome::Close).await,
    };

    // ── Site match first: its policy owns the receive timeout ──
    let site_match = state.registry.find_site(port, &url.path);

    // ── Materialize the body even when no site matched, so keep-alive
    //    connections stay framed on error answers ──
    let receive_timeout = site_match
        .as_ref()
        .map(|(site, _)| site.policy.timeouts.receive)
        .unwrap_or_else(|| {
            std::time::Duration::from_millis(state.config.client.timeout_receive_ms.max(1_000))
        });
    let body = match tokio::time::timeout(receive_timeout, reader.read_body(&head)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Body read failed");
            return write_static(&writer, response::RESP_400, DispatchOutcome::Close).await;
        }
        Err(_) => {
            reporting::report_error("dispatch_request", 0, "receive timeout reading body");
            if let Some(logfile) = state.logfile() {
                logfile.write_timing("dispatch_request", started_at.elapsed());
            }
            return DispatchOutcome::Close;
        }
    };

    let Some((site, routing)) = site_match else {
        debug!(port, path = %url.path, "No site matched");
        return write_static(&writer, RESP_404, DispatchOutcome::Continue { reader, keep_alive })
            .await;
    };
    let policy = &site.policy;

    // ── Build the message ──
    let mut method = head.method.clone();
    if state.config.server.verb_tunneling
        && method == Method::POST
        && let Some(tunneled) = head.headers.get("x-http-method-override")
        && let Ok(parsed) = Method::from_bytes(tunneled.as_bytes())
    {
        method = parsed;
    }

    let mut message = HttpMessage::new(method, url);
    message.headers = head.headers;
    message.sender = Some(peer);
    message.routing = routing;
    message.connection = Some(connection_id);
    for cookie_header in message
        .headers
        .get_all("cookie")
        .map(str::to_string)
        .collect::<Vec<_>>()
    {
        message.cookies.extend(Cookie::parse_request_header(&cookie_header));
    }
    message.body.set(body);
    if message
        .headers
        .get("content-encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
    {
        message.body.mark_gzipped();
        if message.body.decompress().is_err() {
            return write_static(&writer, response::RESP_400, DispatchOutcome::Close).await;
        }
    }

    // Request facts the emission path needs after the handler mutated the
    // message into a response.
    let request_headers = message.headers.clone();
    let accepts_gzip = message.accepts_gzip();
    let head_only = message.method == Method::HEAD;

    // ── Authentication ──
    let validator = state.auth_validator();
    match auth::check_auth(policy, &message.headers, validator.as_ref()) {
        Ok(AuthOutcome::Anonymous) => {}
        Ok(AuthOutcome::Authenticated(principal)) => {
            message.access_token = Some(principal);
        }
        Err(MarlinError::AuthRequired(_)) => {
            let challenge = auth::challenge_headers(policy);
            let mut buf = Vec::with_capacity(256);
            response::build_response(&mut buf, 401, &challenge, b"", keep_alive);
            return write_raw(&writer, buf, DispatchOutcome::Continue { reader, keep_alive }).await;
        }
        Err(MarlinError::AuthFailed(user)) => {
            warn!(peer = %peer, user = %user, "Authentication failed");
            let mut buf = Vec::with_capacity(128);
            response::build_response(&mut buf, 403, &[], b"", keep_alive);
            return write_raw(&writer, buf, DispatchOutcome::Continue { reader, keep_alive }).await;
        }
        Err(_) => {
            return write_static(&writer, response::RESP_400, DispatchOutcome::Close).await;
        }
    }

    // ── Content type gate ──
    let has_body_or_type = !message.body.is_empty() || message.headers.contains("content-type");
    if has_body_or_type && !policy.accepts_content_type(message.content_type()) {
        let mut buf = Vec::with_capacity(128);
        response::build_response(&mut buf, 415, &[], b"", keep_alive);
        return write_raw(&writer, buf, DispatchOutcome::Continue { reader, keep_alive }).await;
    }

    // ── Worker pool ──
    let mut permit = state.workers.clone().acquire_owned().await.ok();
    if policy.is_async {
        // Async sites give the accept slot back before the handler runs
        permit = None;
    }
    let _permit = permit;

    // ── Filter chain ──
    match site.filters.run(&mut message) {
        Ok(FilterAction::Continue) => {}
        Ok(FilterAction::Stop) => {
            return emit_message(
                state, &site, &mut message, &request_headers, &writer, reader, keep_alive,
                accepts_gzip, head_only, started_at,
            )
            .await;
        }
        Err(e) => {
            reporting::report_error("FilterChain::run", 0, &e.to_string());
            return write_static(&writer, RESP_500, DispatchOutcome::Continue { reader, keep_alive })
                .await;
        }
    }

    // ── Handler ──
    let Some(handler) = site.handlers.get(&message.method).map(Arc::clone) else {
        let allow = site
            .handlers
            .allowed()
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let headers = vec![("Allow".to_string(), allow)];
        let mut buf = Vec::with_capacity(160);
        response::build_response(&mut buf, 405, &headers, b"", keep_alive);
        return write_raw(&writer, buf, DispatchOutcome::Continue { reader, keep_alive }).await;
    };

    let outcome = handler.handle(&mut message).await;

    match outcome {
        Err(e) => {
            reporting::report_error("SiteHandler::handle", 0, &e.to_string());
            write_static(&writer, RESP_500, DispatchOutcome::Continue { reader, keep_alive }).await
        }
        Ok(HandlerOutcome::Reply) => {
            emit_message(
                state, &site, &mut message, &request_headers, &writer, reader, keep_alive,
                accepts_gzip, head_only, started_at,
            )
            .await
        }
        Ok(HandlerOutcome::UpgradeSse) => {
            if message.method != Method::GET || !policy.is_event_stream {
                reporting::report_error(
                    "dispatch_request",
                    0,
                    "SSE upgrade outside an event-stream GET site",
                );
                return write_static(
                    &writer,
                    RESP_500,
                    DispatchOutcome::Continue { reader, keep_alive },
                )
                .await;
            }
            {
                let mut guard = writer.lock().await;
                if guard.write_all(crate::sse::SseEngine::preamble()).await.is_err() {
                    return DispatchOutcome::Close;
                }
            }
            let (read_half, _leftover) = reader.detach();
            let stream = state.sse.attach(site.key.clone(), Arc::clone(&writer), read_half);
            if let Some(hook) = state.stream_hook(&site.key) {
                hook(&stream, &message);
            }
            log_request(state, &message, 200, started_at);
            DispatchOutcome::Detached
        }
        Ok(HandlerOutcome::UpgradeWebSocket) => {
            match handshake::validate(&message.method, &request_headers, &[]) {
                Err((status, reason)) => {
                    debug!(peer = %peer, reason = %reason, "WebSocket handshake rejected");
                    let mut buf = Vec::with_capacity(256);
                    response::build_response(&mut buf, status, &[], reason.as_bytes(), false);
                    write_raw(&writer, buf, DispatchOutcome::Close).await
                }
                Ok(reply) => {
                    {
                        let mut guard = writer.lock().await;
                        if guard.write_all(&handshake::response_bytes(&reply)).await.is_err() {
                            return DispatchOutcome::Close;
                        }
                    }
                    let settings = SessionSettings {
                        keepalive_ms: policy.socket_keepalive_ms,
                        recv_buffer_size: policy.socket_buffer_size,
                        disable_client_masking: policy.disable_client_masking,
                        disable_utf8_verify: policy.disable_utf8_verify,
                    };
                    let key = format!(
                        "{}{}",
                        site.key.prefix,
                        message
                            .routing
                            .last()
                            .cloned()
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
                    );
                    let session = WebSocketSession::new(key, Arc::clone(&writer), settings);
                    state.ws.register(Arc::clone(&session));
                    if let Some(hook) = state.socket_hook(&site.key) {
                        hook(&session, &message);
                    }
                    let (read_half, leftover) = reader.detach();
                    tokio::spawn(run_session(session, read_half, leftover, Arc::clone(&state.ws)));
                    log_request(state, &message, 101, started_at);
                    DispatchOutcome::Detached
                }
            }
        }
    }
}

/// Emit the response the message describes: automatic site headers, cookie
/// defaults, compression, then the wire bytes.
#[allow(clippy::too_many_arguments)]
async fn emit_message(
    state: &Arc<ServerState>,
    site: &Arc<StartedSite>,
    message: &mut HttpMessage,
    request_headers: &HeaderMap,
    writer: &SharedWriter,
    reader: RequestReader,
    keep_alive: bool,
    accepts_gzip: bool,
    head_only: bool,
    started_at: Instant,
) -> DispatchOutcome {
    // A handler that streamed chunks already owns the wire format; finish
    // the terminator if it forgot and skip normal emission.
    if let Some(entry) = message.connection.and_then(|id| state.connection(id)) {
        if entry.chunk_started.load(Ordering::SeqCst) {
            if !entry.chunk_done.load(Ordering::SeqCst) {
                let mut guard = writer.lock().await;
                if guard.write_all(b"0\r\n\r\n").await.is_err() {
                    return DispatchOutcome::Close;
                }
            }
            entry.chunk_started.store(false, Ordering::SeqCst);
            entry.chunk_done.store(false, Ordering::SeqCst);
            log_request(state, message, message.status, started_at);
            return DispatchOutcome::Continue { reader, keep_alive };
        }
    }

    // Response headers are the handler's delta over the request headers
    let mut headers = response_header_delta(request_headers, &message.headers);
    site.policy.headers.apply(&mut headers);

    // Compression works on the message body, then mirrors into the delta
    message.headers = headers;
    maybe_compress_response(
        message,
        site.policy.compression,
        accepts_gzip,
        site.policy.compress_limit,
    );

    // Large bodies go out as a chunked stream instead of one buffer
    let streaming_limit = state.config.server.streaming_limit;
    if !head_only && streaming_limit > 0 && message.body.len() > streaming_limit {
        return stream_chunked(site, message, writer, reader, keep_alive, started_at, state).await;
    }

    let mut buf = Vec::with_capacity(message.body.len() + 512);
    response::build_full_response(
        &mut buf,
        message.status,
        &message.headers,
        &message.response_cookies,
        &site.policy.cookie_defaults,
        message.body.as_slice(),
        keep_alive,
        !head_only,
    );

    let send_timeout = site.policy.timeouts.send;
    let write = async {
        let mut guard = writer.lock().await;
        guard.write_all(&buf).await
    };
    match tokio::time::timeout(send_timeout, write).await {
        Ok(Ok(())) => {
            log_request(state, message, message.status, started_at);
            DispatchOutcome::Continue { reader, keep_alive }
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Response write failed");
            DispatchOutcome::Close
        }
        Err(_) => {
            reporting::report_error("emit_message", 0, "send timeout writing response");
            if let Some(logfile) = state.logfile() {
                logfile.write_timing("emit_message", started_at.elapsed());
            }
            DispatchOutcome::Close
        }
    }
}

/// Emit a response whose body exceeds the streaming limit as
/// `Transfer-Encoding: chunked`, one bounded fragment at a time.
async fn stream_chunked(
    site: &Arc<StartedSite>,
    message: &HttpMessage,
    writer: &SharedWriter,
    reader: RequestReader,
    keep_alive: bool,
    started_at: Instant,
    state: &Arc<ServerState>,
) -> DispatchOutcome {
    let mut head = Vec::with_capacity(512);
    response::reason_head(&mut head, message.status);
    head.extend_from_slice(b"Server: Marlin\r\nTransfer-Encoding: chunked\r\n");
    head.extend_from_slice(if keep_alive {
        b"Connection: keep-alive\r\n" as &[u8]
    } else {
        b"Connection: close\r\n" as &[u8]
    });
    for (name, value) in message.headers.iter() {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for cookie in &message.response_cookies {
        head.extend_from_slice(b"Set-Cookie: ");
        head.extend_from_slice(cookie.to_set_cookie(&site.policy.cookie_defaults).as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    let send_timeout = site.policy.timeouts.send;
    let write = async {
        let mut guard = writer.lock().await;
        guard.write_all(&head).await?;
        let mut fragment = Vec::with_capacity(64 * 1024 + 16);
        for chunk in message.body.as_slice().chunks(64 * 1024) {
            fragment.clear();
            crate::chunked::encode_chunk(&mut fragment, chunk, false);
            guard.write_all(&fragment).await?;
        }
        guard.write_all(b"0\r\n\r\n").await
    };
    match tokio::time::timeout(send_timeout, write).await {
        Ok(Ok(())) => {
            log_request(state, message, message.status, started_at);
            DispatchOutcome::Continue { reader, keep_alive }
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Chunked stream write failed");
            DispatchOutcome::Close
        }
        Err(_) => {
            reporting::report_error("stream_chunked", 0, "send timeout streaming response");
            DispatchOutcome::Close
        }
    }
}

/// Headers present now but not carried over unchanged from the request.
fn response_header_delta(request: &HeaderMap, current: &HeaderMap) -> HeaderMap {
    let mut delta = HeaderMap::new();
    for (name, value) in current.iter() {
        let unchanged_from_request = request.get_all(name).any(|v| v == value);
        if !unchanged_from_request {
            delta.append(name, value);
        }
    }
    delta
}

async fn write_static(
    writer: &SharedWriter,
    bytes: &'static [u8],
    outcome: DispatchOutcome,
) -> DispatchOutcome {
    let mut guard = writer.lock().await;
    if guard.write_all(bytes).await.is_err() {
        return DispatchOutcome::Close;
    }
    drop(guard);
    outcome
}

async fn write_raw(writer: &SharedWriter, bytes: Vec<u8>, outcome: DispatchOutcome) -> DispatchOutcome {
    let mut guard = writer.lock().await;
    if guard.write_all(&bytes).await.is_err() {
        return DispatchOutcome::Close;
    }
    drop(guard);
    outcome
}

fn log_request(state: &Arc<ServerState>, message: &HttpMessage, status: u16, started_at: Instant) {
    if let Some(logfile) = state.logfile() {
        logfile.write(
            "dispatch_request",
            LogLevel::Logging,
            &format!("{} {} -> {}", message.method, message.url.path, status),
        );
        logfile.write_timing("dispatch_request", started_at.elapsed());
    }
}
