//! Driver channels: one addressable destination per client session,
//! identified by name plus a cookie authentication tuple.

use crate::event::{EventKind, LtEvent};
use bytes::Bytes;
use marlin_http::sse::EventStream;
use marlin_http::ws::session::WebSocketSession;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Delivery guarantees for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// Deliver when a transport is attached, otherwise keep only the
    /// newest event (queue depth 1).
    BestEffort,
    /// Retain events until a transport acknowledged them.
    SureDelivery,
}

/// Which transport currently carries the channel.
#[derive(Clone, Default)]
pub enum ChannelTransport {
    WebSocket(Arc<WebSocketSession>),
    Sse(Arc<EventStream>),
    LongPoll,
    #[default]
    Unbound,
}

impl ChannelTransport {
    pub fn is_bound(&self) -> bool {
        !matches!(self, ChannelTransport::Unbound)
    }
}

/// Application callback receiving channel events (incoming messages plus
/// the synthesized open/close pair).
pub type EventCallback = Arc<dyn Fn(LtEvent) + Send + Sync>;

pub struct Channel {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) cookie_name: String,
    pub(crate) cookie_value: String,
    pub(crate) policy: Mutex<ChannelPolicy>,
    pub(crate) callback: Mutex<Option<EventCallback>>,
    pub(crate) app_context: AtomicU64,
    pub(crate) queue: Mutex<VecDeque<LtEvent>>,
    pub(crate) next_seq: AtomicU64,
    pub(crate) transport: Mutex<ChannelTransport>,
    /// Wakes a blocked long-poll handler when an event arrives.
    pub(crate) poll_notify: Notify,
}

impl Channel {
    pub(crate) fn new(id: u32, name: String, cookie_name: String, cookie_value: String) -> Self {
        Self {
            id,
            name,
            cookie_name,
            cookie_value,
            policy: Mutex::new(ChannelPolicy::BestEffort),
            callback: Mutex::new(None),
            app_context: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            transport: Mutex::new(ChannelTransport::Unbound),
            poll_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ChannelPolicy {
        *self.policy.lock().expect("channel policy lock")
    }

    /// Does the request's cookie authenticate against this channel?
    pub fn authenticates(&self, cookie_name: &str, cookie_value: &str) -> bool {
        self.cookie_name == cookie_name && self.cookie_value == cookie_value
    }

    /// Allocate the next strictly monotonic event number.
    pub(crate) fn next_number(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Build an event stamped with the next number and the bound context.
    pub(crate) fn make_event(&self, kind: EventKind, payload: Bytes) -> LtEvent {
        LtEvent {
            number: self.next_number(),
            kind,
            payload,
            sender: self.app_context.load(Ordering::Acquire),
        }
    }

    /// Queue an undelivered event according to the policy.
    pub(crate) fn enqueue(&self, event: LtEvent) {
        let mut queue = self.queue.lock().expect("channel queue lock");
        match self.policy() {
            ChannelPolicy::BestEffort => {
                queue.clear();
                queue.push_back(event);
            }
            ChannelPolicy::SureDelivery => queue.push_back(event),
        }
    }

    /// Oldest pending event, removed from the queue.
    pub(crate) fn take_pending(&self) -> Option<LtEvent> {
        self.queue.lock().expect("channel queue lock").pop_front()
    }

    pub fn queue_count(&self) -> usize {
        self.queue.lock().expect("channel queue lock").len()
    }

    pub(crate) fn current_transport(&self) -> ChannelTransport {
        self.transport.lock().expect("channel transport lock").clone()
    }

    pub(crate) fn set_transport(&self, transport: ChannelTransport) -> ChannelTransport {
        std::mem::replace(&mut *self.transport.lock().expect("channel transport lock"), transport)
    }

    /// Hand an event to the application callback.
    pub(crate) fn fire_callback(&self, event: LtEvent) {
        let callback = self.callback.lock().expect("channel callback lock").clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(1, "firstsession_123".into(), "GUID".into(), "123-123-123-123".into())
    }

    #[test]
    fn numbers_are_strictly_monotonic() {
        let c = channel();
        let a = c.next_number();
        let b = c.next_number();
        let d = c.next_number();
        assert!(a < b && b < d);
        assert_eq!((a, b, d), (1, 2, 3));
    }

    #[test]
    fn cookie_authentication() {
        let c = channel();
        assert!(c.authenticates("GUID", "123-123-123-123"));
        assert!(!c.authenticates("GUID", "wrong"));
        assert!(!c.authenticates("OTHER", "123-123-123-123"));
    }

    #[test]
    fn best_effort_queue_is_depth_one() {
        let c = channel();
        for i in 0..5 {
            let event = c.make_event(EventKind::Message, Bytes::from(format!("m{i}")));
            c.enqueue(event);
        }
        assert_eq!(c.queue_count(), 1);
        assert_eq!(c.take_pending().unwrap().payload_string(), "m4");
    }

    #[test]
    fn sure_delivery_queue_retains_in_order() {
        let c = channel();
        *c.policy.lock().unwrap() = ChannelPolicy::SureDelivery;
        for i in 0..5 {
            let event = c.make_event(EventKind::Message, Bytes::from(format!("m{i}")));
            c.enqueue(event);
        }
        assert_eq!(c.queue_count(), 5);
        let numbers: Vec<u64> = std::iter::from_fn(|| c.take_pending().map(|e| e.number)).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn callback_receives_bound_context() {
        let c = channel();
        c.app_context.store(77, Ordering::Release);
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            *c.callback.lock().unwrap() =
                Some(Arc::new(move |event: LtEvent| *seen.lock().unwrap() = Some(event.sender)));
        }
        let event = c.make_event(EventKind::Open, Bytes::new());
        c.fire_callback(event);
        assert_eq!(*seen.lock().unwrap(), Some(77));
    }
}
