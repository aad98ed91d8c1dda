//! Server-side WebSocket sessions.
//!
//! Each session is one task driving a read loop over the detached
//! connection (the readiness-driven replacement for a completion-callback
//! state machine). Callbacks are invoked from that task only, so they are
//! serialized per session; sends go through the session's own write mutex
//! and may come from any task.

use crate::sse::SharedWriter;
use crate::ws::frame::{
    Frame, OpCode, encode_close_payload, encode_frame, parse_close_payload, parse_frame,
};
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use marlin_core::error::MarlinError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, warn};

/// Keepalive never drops under 15 seconds.
pub const MIN_KEEPALIVE_MS: u64 = 15_000;
/// Largest header: 2 + 8 length + 4 mask.
pub const FRAME_OVERHEAD: usize = 14;
/// Receive buffers always hold at least 256 useful bytes plus framing.
pub const MIN_BUFFER_SIZE: usize = 256 + FRAME_OVERHEAD;

/// One (possibly partial) application message delivered to `on_message`.
/// Messages larger than the receive buffer arrive as several records with
/// `final_fragment = false` until the last.
#[derive(Debug, Clone, PartialEq)]
pub struct WsFrame {
    pub text: bool,
    pub data: Vec<u8>,
    pub final_fragment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SocketState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SocketState::Open,
            2 => SocketState::Closing,
            3 => SocketState::Closed,
            _ => SocketState::Connecting,
        }
    }
}

type OnOpen = Box<dyn Fn(&Arc<WebSocketSession>) + Send + Sync>;
type OnMessage = Box<dyn Fn(&Arc<WebSocketSession>, WsFrame) + Send + Sync>;
type OnClose = Box<dyn Fn(&Arc<WebSocketSession>, u16, &str) + Send + Sync>;
type OnError = Box<dyn Fn(&Arc<WebSocketSession>, &str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_open: Option<OnOpen>,
    on_message: Option<OnMessage>,
    on_close: Option<OnClose>,
    on_error: Option<OnError>,
}

/// Per-session tuning, taken from the site policy at upgrade time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub keepalive_ms: u64,
    pub recv_buffer_size: usize,
    pub disable_client_masking: bool,
    pub disable_utf8_verify: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_ms: 30_000,
            recv_buffer_size: 32 * 1024,
            disable_client_masking: false,
            disable_utf8_verify: false,
        }
    }
}

pub struct WebSocketSession {
    key: String,
    state: AtomicU8,
    writer: SharedWriter,
    callbacks: std::sync::Mutex<Callbacks>,
    keepalive: Duration,
    recv_buffer_size: usize,
    require_masked: bool,
    utf8_verify: bool,
    awaiting_pong: AtomicBool,
    close_fired: AtomicBool,
    error_fired: AtomicBool,
    close_info: std::sync::Mutex<(u16, String)>,
    closed: tokio::sync::Notify,
}

impl WebSocketSession {
    pub fn new(key: impl Into<String>, writer: SharedWriter, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            state: AtomicU8::new(SocketState::Connecting as u8),
            writer,
            callbacks: std::sync::Mutex::new(Callbacks::default()),
            keepalive: Duration::from_millis(settings.keepalive_ms.max(MIN_KEEPALIVE_MS)),
            recv_buffer_size: settings.recv_buffer_size.max(MIN_BUFFER_SIZE),
            require_masked: !settings.disable_client_masking,
            utf8_verify: !settings.disable_utf8_verify,
            awaiting_pong: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            error_fired: AtomicBool::new(false),
            close_info: std::sync::Mutex::new((1005, String::new())),
            closed: tokio::sync::Notify::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive
    }

    // ── Callback wiring (before or right after attach) ──

    pub fn set_on_open(&self, f: impl Fn(&Arc<WebSocketSession>) + Send + Sync + 'static) {
        self.callbacks.lock().expect("ws callbacks").on_open = Some(Box::new(f));
    }

    pub fn set_on_message(&self, f: impl Fn(&Arc<WebSocketSession>, WsFrame) + Send + Sync + 'static) {
        self.callbacks.lock().expect("ws callbacks").on_message = Some(Box::new(f));
    }

    pub fn set_on_close(&self, f: impl Fn(&Arc<WebSocketSession>, u16, &str) + Send + Sync + 'static) {
        self.callbacks.lock().expect("ws callbacks").on_close = Some(Box::new(f));
    }

    pub fn set_on_error(&self, f: impl Fn(&Arc<WebSocketSession>, &str) + Send + Sync + 'static) {
        self.callbacks.lock().expect("ws callbacks").on_error = Some(Box::new(f));
    }

    // ── Sending ──

    pub async fn send_text(self: &Arc<Self>, text: &str) -> Result<(), MarlinError> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(self: &Arc<Self>, data: &[u8]) -> Result<(), MarlinError> {
        self.send_frame(OpCode::Binary, data).await
    }

    pub async fn send_ping(self: &Arc<Self>, payload: &[u8]) -> Result<(), MarlinError> {
        self.send_frame(OpCode::Ping, payload).await
    }

    async fn send_pong(self: &Arc<Self>, payload: &[u8]) -> Result<(), MarlinError> {
        self.send_frame(OpCode::Pong, payload).await
    }

    async fn send_frame(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<(), MarlinError> {
        if matches!(self.state(), SocketState::Closed) {
            return Err(MarlinError::StreamGone);
        }
        let wire = encode_frame(opcode, payload, true);
        let mut writer = self.writer.lock().await;
        writer.write_all(&wire).await.map_err(|e| {
            warn!(session = %self.key, error = %e, "WebSocket send failed");
            MarlinError::StreamGone
        })
    }

    /// Initiate the closing handshake: send a close frame, move to
    /// `Closing`, and let the read loop finish on the peer's close or the
    /// keepalive deadline.
    pub async fn send_close_socket(self: &Arc<Self>, code: u16, reason: &str) -> Result<(), MarlinError> {
        if !matches!(self.state(), SocketState::Open) {
            return Err(MarlinError::StreamGone);
        }
        *self.close_info.lock().expect("ws close info") = (code, reason.to_string());
        let payload = encode_close_payload(code, reason);
        self.send_frame(OpCode::Close, &payload).await?;
        self.state.store(SocketState::Closing as u8, Ordering::Release);
        debug!(session = %self.key, code, "Close handshake started");
        Ok(())
    }

    /// Wait until the session reaches `Closed`.
    pub async fn await_closed(&self) {
        while self.state() != SocketState::Closed {
            let notified = self.closed.notified();
            if self.state() == SocketState::Closed {
                return;
            }
            notified.await;
        }
    }

    // ── Internal transitions ──

    fn fire_open(self: &Arc<Self>) {
        self.state.store(SocketState::Open as u8, Ordering::Release);
        let callbacks = self.callbacks.lock().expect("ws callbacks");
        if let Some(on_open) = &callbacks.on_open {
            on_open(self);
        }
    }

    fn fire_message(self: &Arc<Self>, frame: WsFrame) {
        let callbacks = self.callbacks.lock().expect("ws callbacks");
        if let Some(on_message) = &callbacks.on_message {
            on_message(self, frame);
        }
    }

    fn fire_error(self: &Arc<Self>, message: &str) {
        if self.error_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self.callbacks.lock().expect("ws callbacks");
        if let Some(on_error) = &callbacks.on_error {
            on_error(self, message);
        }
    }

    /// Terminal transition; fires `OnClose` exactly once.
    fn finalize(self: &Arc<Self>, code: u16, reason: &str) {
        self.state.store(SocketState::Closed as u8, Ordering::Release);
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.key, code, "WebSocket closed");
        {
            let callbacks = self.callbacks.lock().expect("ws callbacks");
            if let Some(on_close) = &callbacks.on_close {
                on_close(self, code, reason);
            }
        }
        self.closed.notify_waiters();
    }
}

// ── Session engine / registry ────────────────────────────────

pub struct WsEngine {
    sessions: DashMap<String, Arc<WebSocketSession>>,
}

impl WsEngine {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    pub fn register(&self, session: Arc<WebSocketSession>) {
        self.sessions.insert(session.key().to_string(), session);
    }

    pub fn get(&self, key: &str) -> Option<Arc<WebSocketSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, key: &str) {
        self.sessions.remove(key);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start close handshakes everywhere; used by the server drain path.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let sessions: Vec<Arc<WebSocketSession>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        for session in sessions {
            let _ = session.send_close_socket(code, reason).await;
        }
    }
}

impl Default for WsEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Read loop ────────────────────────────────────────────────

/// Drive one session until it closes. `leftover` carries bytes the client
/// pipelined behind its upgrade request.
pub async fn run_session(
    session: Arc<WebSocketSession>,
    mut reader: OwnedReadHalf,
    leftover: BytesMut,
    engine: Arc<WsEngine>,
) {
    use tokio::io::AsyncReadExt;

    session.fire_open();

    let mut buf = leftover;
    let mut assembly = MessageAssembly::new(session.recv_buffer_size);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + session.keepalive,
        session.keepalive,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'session: loop {
        // Drain complete frames already buffered
        loop {
            match parse_frame(&buf, session.require_masked) {
                Ok(Some((frame, used))) => {
                    buf.advance(used);
                    session.awaiting_pong.store(false, Ordering::SeqCst);
                    if !handle_frame(&session, frame, &mut assembly).await {
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(violation) => {
                    session.fire_error(&violation.reason);
                    let payload = encode_close_payload(violation.code, &violation.reason);
                    let _ = session.send_frame(OpCode::Close, &payload).await;
                    session.finalize(violation.code, &violation.reason);
                    break 'session;
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        if session.state() == SocketState::Closing {
                            let (code, reason) = session.close_info.lock().expect("ws close info").clone();
                            session.finalize(code, &reason);
                        } else {
                            session.fire_error("connection dropped without close frame");
                            session.finalize(1006, "abnormal closure");
                        }
                        break 'session;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        session.fire_error(&format!("read error: {e}"));
                        session.finalize(1006, "abnormal closure");
                        break 'session;
                    }
                }
            }
            _ = ticker.tick() => {
                if session.state() == SocketState::Closing {
                    // Peer never answered our close frame
                    let (code, reason) = session.close_info.lock().expect("ws close info").clone();
                    session.finalize(code, &reason);
                    break 'session;
                }
                if session.awaiting_pong.swap(true, Ordering::SeqCst) {
                    session.fire_error("keepalive pong missing");
                    session.finalize(1006, "keepalive timeout");
                    break 'session;
                }
                if session.send_ping(b"marlin").await.is_err() {
                    session.finalize(1006, "keepalive send failed");
                    break 'session;
                }
            }
        }
    }

    engine.remove(session.key());
    let mut writer = session.writer.lock().await;
    let _ = writer.shutdown().await;
}

/// Fragment reassembly bounded by the receive buffer size.
struct MessageAssembly {
    limit: usize,
    opcode: Option<OpCode>,
    data: Vec<u8>,
    was_split: bool,
}

impl MessageAssembly {
    fn new(limit: usize) -> Self {
        Self { limit, opcode: None, data: Vec::new(), was_split: false }
    }

    fn reset(&mut self) {
        self.opcode = None;
        self.data.clear();
        self.was_split = false;
    }
}

/// Returns `false` when the session reached a terminal state.
async fn handle_frame(
    session: &Arc<WebSocketSession>,
    frame: Frame,
    assembly: &mut MessageAssembly,
) -> bool {
    match frame.opcode {
        OpCode::Ping => {
            if session.send_pong(&frame.payload).await.is_err() {
                session.finalize(1006, "pong send failed");
                return false;
            }
            true
        }
        OpCode::Pong => true,
        OpCode::Close => {
            let (code, reason) = match parse_close_payload(&frame.payload) {
                Ok(parsed) => parsed,
                Err(violation) => (violation.code, violation.reason),
            };
            if session.state() == SocketState::Closing {
                // Our close, their echo: handshake complete
                session.finalize(code, &reason);
            } else {
                // Peer-initiated: echo the code back, then close
                let echo_code = if code == 1005 { 1000 } else { code };
                let payload = encode_close_payload(echo_code, &reason);
                let _ = session.send_frame(OpCode::Close, &payload).await;
                session.finalize(echo_code, &reason);
            }
            false
        }
        OpCode::Text | OpCode::Binary => {
            if assembly.opcode.is_some() {
                return protocol_failure(session, "data frame inside fragmented message").await;
            }
            assembly.opcode = Some(frame.opcode);
            append_payload(session, frame, assembly).await
        }
        OpCode::Continuation => {
            if assembly.opcode.is_none() {
                return protocol_failure(session, "continuation without initial frame").await;
            }
            append_payload(session, frame, assembly).await
        }
    }
}

async fn append_payload(
    session: &Arc<WebSocketSession>,
    frame: Frame,
    assembly: &mut MessageAssembly,
) -> bool {
    let text = assembly.opcode == Some(OpCode::Text);
    assembly.data.extend_from_slice(&frame.payload);

    // Flush oversized partial content so the buffer stays bounded
    while !frame.fin && assembly.data.len() >= assembly.limit {
        let chunk: Vec<u8> = assembly.data.drain(..assembly.limit).collect();
        assembly.was_split = true;
        session.fire_message(WsFrame { text, data: chunk, final_fragment: false });
    }

    if frame.fin {
        let data = std::mem::take(&mut assembly.data);
        // Verification needs the whole message in one piece; split
        // deliveries already gave up that option.
        if text && session.utf8_verify && !assembly.was_split && std::str::from_utf8(&data).is_err()
        {
            session.fire_error("text message is not valid UTF-8");
            let payload = encode_close_payload(1007, "invalid UTF-8");
            let _ = session.send_frame(OpCode::Close, &payload).await;
            session.finalize(1007, "invalid UTF-8");
            return false;
        }
        session.fire_message(WsFrame { text, data, final_fragment: true });
        assembly.reset();
    }
    true
}

async fn protocol_failure(session: &Arc<WebSocketSession>, reason: &str) -> bool {
    session.fire_error(reason);
    let payload = encode_close_payload(1002, reason);
    let _ = session.send_frame(OpCode::Close, &payload).await;
    session.finalize(1002, reason);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::encode_frame_masked;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    struct Harness {
        session: Arc<WebSocketSession>,
        engine: Arc<WsEngine>,
        client: TcpStream,
        events: Arc<Mutex<Vec<String>>>,
    }

    async fn harness(settings: SessionSettings) -> Harness {
        let (server, client) = socket_pair().await;
        let (rd, wr) = server.into_split();
        let session = WebSocketSession::new("test-session", Arc::new(tokio::sync::Mutex::new(wr)), settings);
        let engine = Arc::new(WsEngine::new());
        engine.register(Arc::clone(&session));

        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            session.set_on_open(move |_| events.lock().unwrap().push("open".to_string()));
        }
        {
            let events = Arc::clone(&events);
            session.set_on_message(move |_, frame| {
                let kind = if frame.text { "text" } else { "binary" };
                let fin = if frame.final_fragment { "fin" } else { "part" };
                events.lock().unwrap().push(format!(
                    "msg:{kind}:{fin}:{}",
                    String::from_utf8_lossy(&frame.data)
                ));
            });
        }
        {
            let events = Arc::clone(&events);
            session.set_on_error(move |_, e| events.lock().unwrap().push(format!("error:{e}")));
        }
        {
            let events = Arc::clone(&events);
            session.set_on_close(move |_, code, _| events.lock().unwrap().push(format!("close:{code}")));
        }

        tokio::spawn(run_session(
            Arc::clone(&session),
            rd,
            BytesMut::new(),
            Arc::clone(&engine),
        ));

        Harness { session, engine, client, events }
    }

    async fn wait_for(events: &Arc<Mutex<Vec<String>>>, needle: &str) {
        for _ in 0..200 {
            if events.lock().unwrap().iter().any(|e| e.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event {needle:?} not observed: {:?}", events.lock().unwrap());
    }

    #[tokio::test]
    async fn delivers_masked_text_message() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame_masked(OpCode::Text, b"hello", true, [1, 2, 3, 4]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "msg:text:fin:hello").await;
        assert_eq!(h.session.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn reassembles_fragmented_message() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let first = encode_frame_masked(OpCode::Text, b"hel", false, [5, 6, 7, 8]);
        let second = encode_frame_masked(OpCode::Continuation, b"lo", true, [9, 9, 9, 9]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &first).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &second).await.unwrap();
        wait_for(&h.events, "msg:text:fin:hello").await;
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let ping = encode_frame_masked(OpCode::Ping, b"probe", true, [1, 1, 1, 1]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &ping).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = h.client.read(&mut buf).await.unwrap();
        let (frame, _) = parse_frame(&buf[..n], false).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(frame.payload, b"probe");
    }

    #[tokio::test]
    async fn peer_close_handshake_echoes_code() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let close = encode_frame_masked(
            OpCode::Close,
            &encode_close_payload(1000, "bye"),
            true,
            [2, 2, 2, 2],
        );
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &close).await.unwrap();

        // Server echoes close with the same code
        let mut buf = vec![0u8; 64];
        let n = h.client.read(&mut buf).await.unwrap();
        let (frame, _) = parse_frame(&buf[..n], false).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        let (code, _) = parse_close_payload(&frame.payload).unwrap();
        assert_eq!(code, 1000);

        wait_for(&h.events, "close:1000").await;
        assert_eq!(h.session.state(), SocketState::Closed);
        assert_eq!(h.engine.session_count(), 0);

        // OnClose fired exactly once, after open and never an error
        let events = h.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| e.starts_with("close:")).count(), 1);
        assert_eq!(events.first().map(String::as_str), Some("open"));
        assert!(!events.iter().any(|e| e.starts_with("error:")));
    }

    #[tokio::test]
    async fn local_close_completes_on_peer_echo() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        h.session.send_close_socket(1001, "going away").await.unwrap();
        assert_eq!(h.session.state(), SocketState::Closing);

        // Peer reads the close frame and echoes it
        let mut buf = vec![0u8; 64];
        let n = h.client.read(&mut buf).await.unwrap();
        let (frame, _) = parse_frame(&buf[..n], false).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        let echo = encode_frame_masked(OpCode::Close, &frame.payload, true, [3, 3, 3, 3]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &echo).await.unwrap();

        wait_for(&h.events, "close:1001").await;
        h.session.await_closed().await;
        assert_eq!(h.session.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn unmasked_client_frame_fails_with_1002() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame(OpCode::Text, b"naked", true);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "error:").await;
        wait_for(&h.events, "close:1002").await;

        let events = h.events.lock().unwrap().clone();
        let error_pos = events.iter().position(|e| e.starts_with("error:")).unwrap();
        let close_pos = events.iter().position(|e| e.starts_with("close:")).unwrap();
        assert!(error_pos < close_pos, "OnError precedes OnClose: {events:?}");
    }

    #[tokio::test]
    async fn masking_can_be_disabled_for_testing() {
        let mut h = harness(SessionSettings {
            disable_client_masking: true,
            ..Default::default()
        })
        .await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame(OpCode::Text, b"plain", true);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "msg:text:fin:plain").await;
    }

    #[tokio::test]
    async fn invalid_utf8_text_closes_1007() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame_masked(OpCode::Text, &[0xFF, 0xFE, 0xFD], true, [4, 4, 4, 4]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "close:1007").await;
    }

    #[tokio::test]
    async fn utf8_verify_can_be_disabled() {
        let mut h = harness(SessionSettings {
            disable_utf8_verify: true,
            ..Default::default()
        })
        .await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame_masked(OpCode::Text, &[0xFF, 0xFE], true, [4, 4, 4, 4]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "msg:text:fin:").await;
        assert_eq!(h.session.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn oversized_message_is_delivered_in_bounded_records() {
        let mut h = harness(SessionSettings {
            recv_buffer_size: MIN_BUFFER_SIZE,
            ..Default::default()
        })
        .await;
        wait_for(&h.events, "open").await;

        // Two fragments totalling ~600 bytes against a 270-byte buffer
        let big = vec![b'a'; 600];
        let first = encode_frame_masked(OpCode::Binary, &big[..300], false, [1, 2, 3, 4]);
        let second = encode_frame_masked(OpCode::Continuation, &big[300..], true, [5, 6, 7, 8]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &first).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &second).await.unwrap();

        wait_for(&h.events, "msg:binary:fin:").await;
        let events = h.events.lock().unwrap().clone();
        let parts: Vec<&String> = events.iter().filter(|e| e.starts_with("msg:binary:part:")).collect();
        assert!(!parts.is_empty(), "oversized message must arrive split: {events:?}");
        let total: usize = events
            .iter()
            .filter(|e| e.starts_with("msg:binary:"))
            .map(|e| e.rsplit(':').next().unwrap().len())
            .sum();
        assert_eq!(total, 600);
    }

    #[tokio::test]
    async fn continuation_without_start_is_protocol_error() {
        let mut h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;

        let wire = encode_frame_masked(OpCode::Continuation, b"lost", true, [1, 1, 1, 1]);
        tokio::io::AsyncWriteExt::write_all(&mut h.client, &wire).await.unwrap();
        wait_for(&h.events, "close:1002").await;
    }

    #[tokio::test]
    async fn dropped_connection_closes_1006() {
        let h = harness(SessionSettings::default()).await;
        wait_for(&h.events, "open").await;
        drop(h.client);
        wait_for(&h.events, "close:1006").await;
        assert_eq!(h.engine.session_count(), 0);
    }

    #[test]
    fn settings_are_clamped() {
        let settings = SessionSettings {
            keepalive_ms: 50,
            recv_buffer_size: 10,
            ..Default::default()
        };
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (server, _client) = {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let client = TcpStream::connect(addr).await.unwrap();
                let (server, _) = listener.accept().await.unwrap();
                (server, client)
            };
            let (_rd, wr) = server.into_split();
            let session = WebSocketSession::new("clamped", Arc::new(tokio::sync::Mutex::new(wr)), settings);
            assert_eq!(session.keepalive_interval(), Duration::from_millis(MIN_KEEPALIVE_MS));
            assert_eq!(session.recv_buffer_size, MIN_BUFFER_SIZE);
        });
    }
}
