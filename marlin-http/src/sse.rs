//! Server-Sent Events engine.
//!
//! Holds the open `text/event-stream` responses, serializes events into
//! the SSE text grammar and pushes them down the detached connections.
//! Stream ids are handed out by the engine; `last_id` on each stream is
//! the monotonic source for the `id:` field.

use dashmap::DashMap;
use marlin_core::error::MarlinError;
use marlin_site::site::SiteKey;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

/// Write half of a detached connection, shared with the chunked sender.
pub type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// One event to push to a client.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// The `event:` field; `message`, `other` and `error` are ordinary
    /// names with no special semantics.
    pub event: String,
    /// Explicit id; `None` takes the stream's next monotonic id.
    pub id: Option<u64>,
    pub data: String,
    pub retry: Option<u64>,
}

impl ServerEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self { event: "message".into(), id: None, data: data.into(), retry: None }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), id: None, data: data.into(), retry: None }
    }

    /// Serialize to the SSE wire grammar. Multi-line data becomes multiple
    /// `data:` lines; a blank line terminates the record.
    pub fn serialize(&self, id: u64) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if !self.event.is_empty() {
            out.push_str("event: ");
            out.push_str(&self.event);
            out.push('\n');
        }
        out.push_str("id: ");
        out.push_str(&id.to_string());
        out.push('\n');
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// An open SSE stream: the detached write half of one connection.
pub struct EventStream {
    id: u64,
    site: SiteKey,
    writer: SharedWriter,
    last_id: AtomicU64,
    open: AtomicBool,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn site(&self) -> &SiteKey {
        &self.site
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

type CloseListener = Box<dyn Fn(u64) + Send + Sync>;

/// The engine: registry of open streams plus close-listener fan-out.
pub struct SseEngine {
    streams: DashMap<u64, Arc<EventStream>>,
    /// Registration order, for `broadcast`.
    order: Mutex<Vec<u64>>,
    next_stream_id: AtomicU64,
    close_listeners: Mutex<Vec<CloseListener>>,
    keepalive: Duration,
}

impl SseEngine {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            order: Mutex::new(Vec::new()),
            next_stream_id: AtomicU64::new(1),
            close_listeners: Mutex::new(Vec::new()),
            keepalive: Duration::from_secs(30),
        }
    }

    /// The preamble written when a handler upgrades to SSE.
    pub fn preamble() -> &'static [u8] {
        b"HTTP/1.1 200 OK\r\nServer: Marlin\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n"
    }

    /// Register a new stream over a detached connection. The preamble must
    /// already be on the wire. The read half feeds the disconnect watcher.
    pub fn attach(
        self: &Arc<Self>,
        site: SiteKey,
        writer: SharedWriter,
        reader: OwnedReadHalf,
    ) -> Arc<EventStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(EventStream {
            id,
            site,
            writer,
            last_id: AtomicU64::new(0),
            open: AtomicBool::new(true),
        });
        self.streams.insert(id, Arc::clone(&stream));
        self.order.lock().expect("sse order lock").push(id);
        info!(stream = id, site = %stream.site.prefix, "SSE stream opened");

        // Disconnect watcher: an EventSource client never sends bytes, so
        // any read completion means the peer went away.
        let engine = Arc::clone(self);
        let watched = Arc::clone(&stream);
        tokio::spawn(async move {
            let mut reader = reader;
            let mut scratch = [0u8; 512];
            loop {
                match reader.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if watched.is_open() {
                debug!(stream = watched.id, "SSE peer disconnected");
                engine.drop_stream(&watched).await;
            }
        });

        // Keepalive comments hold intermediaries open on quiet streams.
        let engine = Arc::clone(self);
        let kept = Arc::clone(&stream);
        let interval = self.keepalive;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !kept.is_open() {
                    return;
                }
                let mut writer = kept.writer.lock().await;
                if writer.write_all(b":keepalive\n\n").await.is_err() {
                    drop(writer);
                    engine.drop_stream(&kept).await;
                    return;
                }
            }
        });

        stream
    }

    /// Push one event. Blocks the caller on connection back-pressure;
    /// returns the id it was sent with. A dead connection yields
    /// `StreamGone` and evicts the stream.
    pub async fn send_event(
        &self,
        stream: &Arc<EventStream>,
        event: &ServerEvent,
    ) -> Result<u64, MarlinError> {
        if !stream.is_open() {
            return Err(MarlinError::StreamGone);
        }
        let id = match event.id {
            Some(explicit) => {
                stream.last_id.fetch_max(explicit, Ordering::SeqCst);
                explicit
            }
            None => stream.last_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let record = event.serialize(id);

        let mut writer = stream.writer.lock().await;
        if let Err(e) = writer.write_all(record.as_bytes()).await {
            drop(writer);
            warn!(stream = stream.id, error = %e, "SSE write failed");
            self.drop_stream(stream).await;
            return Err(MarlinError::StreamGone);
        }
        Ok(id)
    }

    /// Send to every stream of a site, in registration order. Returns how
    /// many streams accepted the event.
    pub async fn broadcast(&self, site: &SiteKey, event: &ServerEvent) -> usize {
        let ids: Vec<u64> = self.order.lock().expect("sse order lock").clone();
        let mut delivered = 0;
        for id in ids {
            let Some(stream) = self.streams.get(&id).map(|s| Arc::clone(s.value())) else {
                continue;
            };
            if stream.site != *site {
                continue;
            }
            if self.send_event(&stream, event).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close a stream: final empty record, connection shutdown, eviction,
    /// close listeners.
    pub async fn close_stream(&self, stream: &Arc<EventStream>) {
        if !stream.is_open() {
            return;
        }
        {
            let mut writer = stream.writer.lock().await;
            let _ = writer.write_all(b"\n").await;
            let _ = writer.shutdown().await;
        }
        self.drop_stream(stream).await;
    }

    /// Close every stream; used by the server drain path.
    pub async fn close_all(&self) {
        let streams: Vec<Arc<EventStream>> =
            self.streams.iter().map(|s| Arc::clone(s.value())).collect();
        for stream in streams {
            self.close_stream(&stream).await;
        }
    }

    pub fn has_stream(&self, stream: &Arc<EventStream>) -> bool {
        stream.is_open() && self.streams.contains_key(&stream.id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Register an out-of-band close listener; it receives the stream id.
    pub fn on_close(&self, listener: impl Fn(u64) + Send + Sync + 'static) {
        self.close_listeners.lock().expect("sse listeners lock").push(Box::new(listener));
    }

    async fn drop_stream(&self, stream: &Arc<EventStream>) {
        if !stream.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.streams.remove(&stream.id);
        self.order.lock().expect("sse order lock").retain(|id| *id != stream.id);
        info!(stream = stream.id, "SSE stream closed");
        let listeners = self.close_listeners.lock().expect("sse listeners lock");
        for listener in listeners.iter() {
            listener(stream.id);
        }
    }
}

impl Default for SseEngine {
    fn default() -> Self {
        Self::new()
    }
}
