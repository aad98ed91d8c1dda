//! The HTTP server: shared state, accept loops, worker pool and lifecycle.
//!
//! Lifecycle: `Init → Configured → Running → Draining → Stopped`. Draining
//! stops the accept loops, lets in-flight requests and streams finish up to
//! a grace deadline, then force-closes the streaming engines.

use crate::auth::AuthValidator;
use crate::chunked::encode_chunk;
use crate::connection;
use crate::response::reason_head;
use crate::sse::{EventStream, SharedWriter, SseEngine};
use crate::ws::WsEngine;
use crate::ws::session::WebSocketSession;
use dashmap::DashMap;
use marlin_core::config::MarlinConfig;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use marlin_observability::Logfile;
use marlin_site::registry::SiteRegistry;
use marlin_site::site::SiteKey;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tracing::{error, info, warn};

// ── Lifecycle ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPhase {
    Init = 0,
    Configured = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

impl ServerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerPhase::Configured,
            2 => ServerPhase::Running,
            3 => ServerPhase::Draining,
            4 => ServerPhase::Stopped,
            _ => ServerPhase::Init,
        }
    }
}

// ── Per-connection bookkeeping ───────────────────────────────

/// Connection entry: shared writer plus chunked-response progress for the
/// request currently being handled on it.
pub struct ConnectionEntry {
    pub writer: SharedWriter,
    pub chunk_started: AtomicBool,
    pub chunk_done: AtomicBool,
}

// ── Upgrade hooks ────────────────────────────────────────────

/// Called when a handler upgraded the connection to a WebSocket, before
/// the session task starts. Gives the application (or the event driver)
/// the session and the upgrade request to wire callbacks.
pub type SocketHook = Arc<dyn Fn(&Arc<WebSocketSession>, &HttpMessage) + Send + Sync>;

/// Same for SSE upgrades.
pub type StreamHook = Arc<dyn Fn(&Arc<EventStream>, &HttpMessage) + Send + Sync>;

#[derive(Default, Clone)]
struct UpgradeHooks {
    socket: Option<SocketHook>,
    stream: Option<StreamHook>,
}

// ── Shared state ─────────────────────────────────────────────

/// Everything the dispatch path reads. One per server.
pub struct ServerState {
    pub registry: Arc<SiteRegistry>,
    pub config: Arc<MarlinConfig>,
    pub sse: Arc<SseEngine>,
    pub ws: Arc<WsEngine>,
    /// Bounded worker pool; one permit per in-flight synchronous request.
    pub workers: Arc<Semaphore>,
    auth_validator: std::sync::RwLock<Option<AuthValidator>>,
    logfile: std::sync::RwLock<Option<Arc<Logfile>>>,
    hooks: DashMap<String, UpgradeHooks>,
    connections: DashMap<u64, Arc<ConnectionEntry>>,
    next_connection_id: AtomicU64,
    active_connections: AtomicUsize,
    phase: AtomicU8,
}

impl ServerState {
    pub fn register_connection(&self, writer: SharedWriter) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            id,
            Arc::new(ConnectionEntry {
                writer,
                chunk_started: AtomicBool::new(false),
                chunk_done: AtomicBool::new(false),
            }),
        );
        id
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn connection(&self, id: u64) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn auth_validator(&self) -> Option<AuthValidator> {
        self.auth_validator.read().expect("auth validator lock").clone()
    }

    pub fn logfile(&self) -> Option<Arc<Logfile>> {
        self.logfile.read().expect("logfile lock").clone()
    }

    pub fn socket_hook(&self, site: &SiteKey) -> Option<SocketHook> {
        self.hooks.get(&site.map_key()).and_then(|h| h.socket.clone())
    }

    pub fn stream_hook(&self, site: &SiteKey) -> Option<StreamHook> {
        self.hooks.get(&site.map_key()).and_then(|h| h.stream.clone())
    }

    pub fn phase(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ServerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

// ── The server ───────────────────────────────────────────────

pub struct HttpServer {
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    listeners: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HttpServer {
    pub fn new(registry: Arc<SiteRegistry>, config: Arc<MarlinConfig>) -> Self {
        let max_workers = config.server.max_threads.max(1);
        let state = Arc::new(ServerState {
            registry,
            config,
            sse: Arc::new(SseEngine::new()),
            ws: Arc::new(WsEngine::new()),
            workers: Arc::new(Semaphore::new(max_workers)),
            auth_validator: std::sync::RwLock::new(None),
            logfile: std::sync::RwLock::new(None),
            hooks: DashMap::new(),
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            phase: AtomicU8::new(ServerPhase::Configured as u8),
        });
        let (shutdown, _) = watch::channel(false);
        Self { state, shutdown, listeners: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn sse(&self) -> &Arc<SseEngine> {
        &self.state.sse
    }

    pub fn ws(&self) -> &Arc<WsEngine> {
        &self.state.ws
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.state.registry
    }

    pub fn set_logfile(&self, logfile: Arc<Logfile>) {
        *self.state.logfile.write().expect("logfile lock") = Some(logfile);
    }

    pub fn set_auth_validator(&self, validator: AuthValidator) {
        *self.state.auth_validator.write().expect("auth validator lock") = Some(validator);
    }

    /// Wire the event driver (or the application) into WebSocket upgrades
    /// on one site.
    pub fn on_socket_upgrade(&self, site: &SiteKey, hook: SocketHook) {
        self.state.hooks.entry(site.map_key()).or_default().socket = Some(hook);
    }

    /// Wire SSE upgrades on one site.
    pub fn on_stream_upgrade(&self, site: &SiteKey, hook: StreamHook) {
        self.state.hooks.entry(site.map_key()).or_default().stream = Some(hook);
    }

    /// Bind a listener and start accepting. Returns the bound port, so
    /// `port 0` can be used for an ephemeral one.
    pub async fn listen(&self, addr: &str) -> std::io::Result<u16> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let state = Arc::clone(&self.state);
        let shutdown_rx = self.shutdown.subscribe();

        state.set_phase(ServerPhase::Running);
        info!(addr, port, "Listener started");

        let handle = tokio::spawn(accept_loop(state, listener, shutdown_rx));
        self.listeners.lock().expect("listeners lock").push(handle);
        Ok(port)
    }

    /// Emit one `Transfer-Encoding: chunked` fragment of the response the
    /// message describes. The first call sends the response head; the call
    /// with `last = true` sends the zero-size terminator.
    pub async fn send_as_chunk(&self, message: &HttpMessage, last: bool) -> Result<(), MarlinError> {
        let Some(entry) = message.connection.and_then(|id| self.state.connection(id)) else {
            return Err(MarlinError::StreamGone);
        };

        let mut wire = Vec::with_capacity(message.body.len() + 256);
        if !entry.chunk_started.swap(true, Ordering::SeqCst) {
            reason_head(&mut wire, message.status);
            wire.extend_from_slice(b"Server: Marlin\r\nTransfer-Encoding: chunked\r\n");
            for (name, value) in message.headers.iter() {
                if name.eq_ignore_ascii_case("content-length")
                    || name.eq_ignore_ascii_case("transfer-encoding")
                {
                    continue;
                }
                wire.extend_from_slice(name.as_bytes());
                wire.extend_from_slice(b": ");
                wire.extend_from_slice(value.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(b"\r\n");
        }
        encode_chunk(&mut wire, message.body.as_slice(), last);
        if last {
            entry.chunk_done.store(true, Ordering::SeqCst);
        }

        let mut writer = entry.writer.lock().await;
        writer.write_all(&wire).await.map_err(|_| MarlinError::StreamGone)
    }

    /// Drain and stop: no new connections, in-flight work gets the grace
    /// period, then streams are force-closed.
    pub async fn stop(&self, grace: Duration) {
        self.state.set_phase(ServerPhase::Draining);
        let _ = self.shutdown.send(true);
        info!("Server draining");

        let deadline = tokio::time::Instant::now() + grace;
        while self.state.active_connections.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.state.active_connections.load(Ordering::Acquire),
                    "Drain deadline reached, force-closing"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.state.sse.close_all().await;
        self.state.ws.close_all(1001, "server shutting down").await;

        for handle in self.listeners.lock().expect("listeners lock").drain(..) {
            handle.abort();
        }
        self.state.set_phase(ServerPhase::Stopped);
        info!("Server stopped");
    }
}

async fn accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if state.phase() != ServerPhase::Running {
                            continue;
                        }
                        let state = Arc::clone(&state);
                        state.active_connections.fetch_add(1, Ordering::AcqRel);
                        tokio::spawn(async move {
                            if let Err(e) =
                                connection::handle_connection(stream, peer, port, Arc::clone(&state)).await
                            {
                                tracing::debug!(error = %e, "Connection ended with error");
                            }
                            state.active_connections.fetch_sub(1, Ordering::AcqRel);
                        });
                    }
                    Err(e) => {
                        error!(port, error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(port, "Listener shutting down");
                return;
            }
        }
    }
}
