//! The server event driver.
//!
//! Channels are registered by name plus a cookie authentication tuple,
//! bound to a delivery policy and an application callback, and bridged to
//! whichever transport the client shows up on: WebSocket, SSE or
//! long-poll. Per channel, event numbers are strictly monotonic and
//! delivery respects that order.

use crate::channel::{Channel, ChannelPolicy, ChannelTransport, EventCallback};
use crate::event::{EventKind, LtEvent};
use crate::longpoll::LongPollHandler;
use bytes::Bytes;
use dashmap::DashMap;
use http::Method;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use marlin_http::listener::HttpServer;
use marlin_http::sse::{EventStream, ServerEvent, SseEngine};
use marlin_http::ws::session::{SocketState, WebSocketSession, WsFrame};
use marlin_site::handler::{FnHandler, HandlerOutcome};
use marlin_site::site::Site;
use marlin_observability::reporting;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct EventDriver {
    channels: DashMap<u32, Arc<Channel>>,
    by_name: DashMap<String, u32>,
    next_id: AtomicU32,
    started: AtomicBool,
    sse: Arc<SseEngine>,
    /// SSE stream id → channel id, to run detach on stream close.
    stream_index: DashMap<u64, u32>,
}

impl EventDriver {
    /// Build a driver bound to the server's SSE engine. Stream closures
    /// detach their channels automatically.
    pub fn new(sse: Arc<SseEngine>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<EventDriver>| {
            let weak = weak.clone();
            sse.on_close(move |stream_id| {
                if let Some(driver) = weak.upgrade() {
                    driver.handle_stream_closed(stream_id);
                }
            });
            EventDriver {
                channels: DashMap::new(),
                by_name: DashMap::new(),
                next_id: AtomicU32::new(1),
                started: AtomicBool::new(false),
                sse: Arc::clone(&sse),
                stream_index: DashMap::new(),
            }
        })
    }

    // ── Channel management ───────────────────────────────────

    /// Register a channel. The identity triple must be unique; a conflict
    /// returns 0.
    pub fn register_channel(&self, name: &str, cookie_name: &str, cookie_value: &str) -> u32 {
        if self.by_name.contains_key(name) {
            warn!(channel = name, "Channel name already registered");
            return 0;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel::new(
            id,
            name.to_string(),
            cookie_name.to_string(),
            cookie_value.to_string(),
        ));
        self.channels.insert(id, channel);
        self.by_name.insert(name.to_string(), id);
        info!(channel = name, id, "Channel registered");
        id
    }

    /// Bind policy, callback and application context. Only allowed while
    /// the channel has no transport attached.
    pub fn set_channel_policy(
        &self,
        id: u32,
        policy: ChannelPolicy,
        callback: EventCallback,
        context: u64,
    ) -> bool {
        let Some(channel) = self.channel(id) else {
            return false;
        };
        if channel.current_transport().is_bound() {
            warn!(channel = %channel.name(), "Policy change refused on a bound channel");
            return false;
        }
        *channel.policy.lock().expect("channel policy lock") = policy;
        *channel.callback.lock().expect("channel callback lock") = Some(callback);
        channel.app_context.store(context, Ordering::Release);
        true
    }

    /// Drop a channel. SureDelivery events still queued are surfaced to
    /// the error report before they are lost.
    pub fn unregister_channel(&self, id: u32) -> Result<(), MarlinError> {
        let Some((_, channel)) = self.channels.remove(&id) else {
            return Err(MarlinError::ChannelError(format!("unknown channel {id}")));
        };
        self.by_name.remove(channel.name());
        let pending = channel.queue_count();
        if pending > 0 && channel.policy() == ChannelPolicy::SureDelivery {
            reporting::report_error(
                "EventDriver::unregister_channel",
                0,
                &format!("channel {} dropped with {pending} undelivered events", channel.name()),
            );
        }
        info!(channel = %channel.name(), pending, "Channel unregistered");
        Ok(())
    }

    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn channel_queue_count(&self, id: u32) -> usize {
        self.channel(id).map(|c| c.queue_count()).unwrap_or(0)
    }

    /// Resolve the channel a request addresses: the last routing segment
    /// names it, the cookie tuple authenticates it.
    pub fn find_channel_for(&self, message: &HttpMessage) -> Option<Arc<Channel>> {
        let name = message.routing.last()?;
        let id = *self.by_name.get(name)?.value();
        let channel = self.channel(id)?;
        let value = message.cookie_value(&channel.cookie_name)?;
        if channel.authenticates(&channel.cookie_name, value) {
            Some(channel)
        } else {
            debug!(channel = name, "Cookie authentication failed for channel");
            None
        }
    }

    // ── Lifecycle ────────────────────────────────────────────

    pub fn start_driver(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Drain SureDelivery queues with a final flush attempt, then close
    /// every bound transport.
    pub async fn stop_driver(&self) -> bool {
        if !self.started.swap(false, Ordering::SeqCst) {
            return false;
        }
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        for channel in channels {
            self.flush_queue(&channel).await;
            let pending = channel.queue_count();
            if pending > 0 && channel.policy() == ChannelPolicy::SureDelivery {
                reporting::report_error(
                    "EventDriver::stop_driver",
                    0,
                    &format!(
                        "channel {} stopped with {pending} undelivered events",
                        channel.name()
                    ),
                );
            }
            match channel.current_transport() {
                ChannelTransport::WebSocket(session) => {
                    let _ = session.send_close_socket(1001, "driver stopping").await;
                }
                ChannelTransport::Sse(stream) => {
                    self.sse.close_stream(&stream).await;
                }
                _ => {}
            }
            self.detach_channel(&channel);
        }
        info!("Event driver stopped");
        true
    }

    // ── Posting ──────────────────────────────────────────────

    /// Post a text event to a channel. Returns whether the channel
    /// accepted it (delivered or queued per policy).
    pub async fn post_event(&self, id: u32, payload: impl Into<Bytes>) -> bool {
        self.post(id, EventKind::Message, payload.into()).await
    }

    /// Post a binary event.
    pub async fn post_binary(&self, id: u32, payload: impl Into<Bytes>) -> bool {
        self.post(id, EventKind::Binary, payload.into()).await
    }

    async fn post(&self, id: u32, kind: EventKind, payload: Bytes) -> bool {
        let Some(channel) = self.channel(id) else {
            return false;
        };
        let event = channel.make_event(kind, payload);

        if !self.is_started() {
            channel.enqueue(event);
            return true;
        }

        // Long-poll is pull-based: queue and wake the blocked poller
        if matches!(channel.current_transport(), ChannelTransport::LongPoll) {
            channel.enqueue(event);
            channel.poll_notify.notify_one();
            return true;
        }

        if self.deliver(&channel, &event).await {
            return true;
        }
        channel.enqueue(event);
        channel.poll_notify.notify_one();
        true
    }

    /// Push one event through the bound transport. `false` means it was
    /// not (or could not be) delivered.
    async fn deliver(&self, channel: &Arc<Channel>, event: &LtEvent) -> bool {
        match channel.current_transport() {
            ChannelTransport::WebSocket(session) => {
                if session.state() != SocketState::Open {
                    return false;
                }
                let sent = match event.kind {
                    EventKind::Binary => session.send_binary(&event.payload).await,
                    _ => session.send_text(&event.payload_string()).await,
                };
                sent.is_ok()
            }
            ChannelTransport::Sse(stream) => {
                let sse_event = ServerEvent {
                    event: event.kind.as_str().to_string(),
                    id: Some(event.number),
                    data: event.payload_string(),
                    retry: None,
                };
                self.sse.send_event(&stream, &sse_event).await.is_ok()
            }
            ChannelTransport::LongPoll | ChannelTransport::Unbound => false,
        }
    }

    /// Deliver queued events in order; stop at the first failure so the
    /// SureDelivery queue keeps what was not acknowledged.
    async fn flush_queue(&self, channel: &Arc<Channel>) {
        loop {
            let front = channel.queue.lock().expect("channel queue lock").front().cloned();
            let Some(event) = front else {
                return;
            };
            if matches!(channel.current_transport(), ChannelTransport::LongPoll) {
                // The poller pulls these itself
                channel.poll_notify.notify_one();
                return;
            }
            if !self.deliver(channel, &event).await {
                return;
            }
            channel.queue.lock().expect("channel queue lock").pop_front();
        }
    }

    // ── Transport binding ────────────────────────────────────

    /// Attach a WebSocket session to a channel: synthesize `EV_Open`,
    /// flush the queue, and route incoming frames to the callback.
    pub async fn bind_websocket(self: &Arc<Self>, channel: &Arc<Channel>, session: Arc<WebSocketSession>) {
        {
            let driver = Arc::clone(self);
            let bound = Arc::clone(channel);
            session.set_on_message(move |_, frame| {
                driver.incoming_frame(&bound, frame);
            });
        }
        {
            let driver = Arc::clone(self);
            let bound = Arc::clone(channel);
            session.set_on_close(move |_, _, _| {
                driver.detach_channel(&bound);
            });
        }
        self.bind(channel, ChannelTransport::WebSocket(session)).await;
    }

    /// Attach an SSE stream to a channel.
    pub async fn bind_sse(self: &Arc<Self>, channel: &Arc<Channel>, stream: Arc<EventStream>) {
        self.stream_index.insert(stream.id(), channel.id());
        self.bind(channel, ChannelTransport::Sse(stream)).await;
    }

    /// Mark the channel long-poll bound (first poll attaches it).
    pub async fn bind_longpoll(self: &Arc<Self>, channel: &Arc<Channel>) {
        if matches!(channel.current_transport(), ChannelTransport::LongPoll) {
            return;
        }
        self.bind(channel, ChannelTransport::LongPoll).await;
    }

    async fn bind(&self, channel: &Arc<Channel>, transport: ChannelTransport) {
        let previous = channel.set_transport(transport);
        if !previous.is_bound() {
            let open = channel.make_event(EventKind::Open, Bytes::new());
            channel.fire_callback(open);
        }
        info!(channel = %channel.name(), "Transport attached");
        self.flush_queue(channel).await;
    }

    /// Detach whatever transport is bound and synthesize `EV_Close`.
    pub fn detach_channel(&self, channel: &Arc<Channel>) {
        let previous = channel.set_transport(ChannelTransport::Unbound);
        if previous.is_bound() {
            let close = channel.make_event(EventKind::Close, Bytes::new());
            channel.fire_callback(close);
            info!(channel = %channel.name(), "Transport detached");
        }
    }

    /// Route an incoming WebSocket frame to the application callback.
    fn incoming_frame(&self, channel: &Arc<Channel>, frame: WsFrame) {
        let kind = if frame.text { EventKind::Message } else { EventKind::Binary };
        let event = channel.make_event(kind, Bytes::from(frame.data));
        channel.fire_callback(event);
    }

    fn handle_stream_closed(&self, stream_id: u64) {
        if let Some((_, channel_id)) = self.stream_index.remove(&stream_id)
            && let Some(channel) = self.channel(channel_id)
            && matches!(channel.current_transport(), ChannelTransport::Sse(_))
        {
            self.detach_channel(&channel);
        }
    }

    // ── Server wiring ────────────────────────────────────────

    /// Register the driver's handlers on a site and hook its upgrades.
    /// Call before `start_site`; the site is switched to event-stream
    /// mode so GET handlers may upgrade to SSE.
    pub fn register_site(self: &Arc<Self>, server: &HttpServer, site: &Arc<Site>) -> Result<(), MarlinError> {
        site.update_policy(|p| p.is_event_stream = true)?;

        let poll = Arc::new(LongPollHandler::new(Arc::clone(self), Duration::from_secs(30)));
        site.set_handler(Method::POST, poll)?;

        // GET decides by headers: WebSocket upgrade or SSE subscribe;
        // polling clients use POST.
        site.set_handler(
            Method::GET,
            Arc::new(FnHandler::new(|message: &mut HttpMessage| {
                let upgrade = message
                    .headers
                    .get("upgrade")
                    .map(|u| u.eq_ignore_ascii_case("websocket"))
                    .unwrap_or(false);
                if upgrade {
                    return Ok(HandlerOutcome::UpgradeWebSocket);
                }
                let wants_sse = message
                    .headers
                    .get("accept")
                    .map(|a| a.contains("text/event-stream"))
                    .unwrap_or(false);
                if wants_sse {
                    return Ok(HandlerOutcome::UpgradeSse);
                }
                message.set_status(400);
                message.set_body(&b"use WebSocket, SSE or POST polling"[..], "text/plain");
                Ok(HandlerOutcome::Reply)
            })),
        )?;

        {
            let driver = Arc::clone(self);
            server.on_socket_upgrade(
                site.key(),
                Arc::new(move |session: &Arc<WebSocketSession>, message: &HttpMessage| {
                    let Some(channel) = driver.find_channel_for(message) else {
                        let session = Arc::clone(session);
                        tokio::spawn(async move {
                            let _ = session.send_close_socket(1008, "unknown channel").await;
                        });
                        return;
                    };
                    let driver = Arc::clone(&driver);
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        driver.bind_websocket(&channel, session).await;
                    });
                }),
            );
        }
        {
            let driver = Arc::clone(self);
            server.on_stream_upgrade(
                site.key(),
                Arc::new(move |stream: &Arc<EventStream>, message: &HttpMessage| {
                    let Some(channel) = driver.find_channel_for(message) else {
                        return;
                    };
                    let driver = Arc::clone(&driver);
                    let stream = Arc::clone(stream);
                    tokio::spawn(async move {
                        driver.bind_sse(&channel, stream).await;
                    });
                }),
            );
        }
        Ok(())
    }
}
