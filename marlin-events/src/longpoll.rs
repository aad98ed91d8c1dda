//! Long-poll transport: a site handler that blocks up to a deadline,
//! answers with the oldest pending event, and marks it delivered.

use crate::driver::EventDriver;
use async_trait::async_trait;
use marlin_core::error::MarlinError;
use marlin_core::message::HttpMessage;
use marlin_site::handler::{HandlerOutcome, SiteHandler};
use std::sync::Arc;
use std::time::Duration;

pub struct LongPollHandler {
    driver: Arc<EventDriver>,
    deadline: Duration,
}

impl LongPollHandler {
    pub fn new(driver: Arc<EventDriver>, deadline: Duration) -> Self {
        Self { driver, deadline }
    }
}

#[async_trait]
impl SiteHandler for LongPollHandler {
    async fn handle(&self, message: &mut HttpMessage) -> Result<HandlerOutcome, MarlinError> {
        let Some(channel) = self.driver.find_channel_for(message) else {
            message.reset();
            message.set_status(404);
            return Ok(HandlerOutcome::Reply);
        };
        self.driver.bind_longpoll(&channel).await;

        let deadline = tokio::time::Instant::now() + self.deadline;
        loop {
            if let Some(event) = channel.take_pending() {
                message.reset();
                message.set_status(200);
                let body = serde_json::json!({
                    "number": event.number,
                    "type": event.kind.as_str(),
                    "payload": event.payload_string(),
                });
                message.set_body(body.to_string(), "application/json");
                return Ok(HandlerOutcome::Reply);
            }

            let notified = channel.poll_notify.notified();
            if channel.queue_count() > 0 {
                continue;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Nothing arrived inside the poll window
                message.reset();
                message.set_status(204);
                return Ok(HandlerOutcome::Reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelPolicy;
    use http::Method;
    use marlin_core::cookie::Cookie;
    use marlin_core::url::CrackedUrl;
    use marlin_http::sse::SseEngine;

    fn poll_message(channel_name: &str, cookie: &str) -> HttpMessage {
        let url = CrackedUrl::parse(&format!("http://server/Driver/{channel_name}")).unwrap();
        let mut message = HttpMessage::new(Method::POST, url);
        message.routing = vec![channel_name.to_string()];
        message.cookies = Cookie::parse_request_header(cookie);
        message
    }

    fn driver_with_channel() -> (Arc<EventDriver>, u32) {
        let driver = EventDriver::new(Arc::new(SseEngine::new()));
        let id = driver.register_channel("thirdsession_789", "GUID", "789-789-789-789");
        driver.set_channel_policy(id, ChannelPolicy::SureDelivery, Arc::new(|_| {}), 0);
        driver.start_driver();
        (driver, id)
    }

    #[tokio::test]
    async fn poll_returns_pending_event() {
        let (driver, id) = driver_with_channel();
        driver.post_event(id, "waiting for you").await;

        let handler = LongPollHandler::new(Arc::clone(&driver), Duration::from_secs(1));
        let mut message = poll_message("thirdsession_789", "GUID=789-789-789-789");
        handler.handle(&mut message).await.unwrap();

        assert_eq!(message.status, 200);
        let body: serde_json::Value = serde_json::from_slice(message.body.as_slice()).unwrap();
        assert_eq!(body["type"], "message");
        assert_eq!(body["payload"], "waiting for you");
        assert_eq!(driver.channel_queue_count(id), 0);
    }

    #[tokio::test]
    async fn poll_blocks_until_event_arrives() {
        let (driver, id) = driver_with_channel();
        let handler = Arc::new(LongPollHandler::new(Arc::clone(&driver), Duration::from_secs(5)));

        let poll = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let mut message = poll_message("thirdsession_789", "GUID=789-789-789-789");
                handler.handle(&mut message).await.unwrap();
                message
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.post_event(id, "late arrival").await;

        let message = poll.await.unwrap();
        assert_eq!(message.status, 200);
        assert!(message.body_string().contains("late arrival"));
    }

    #[tokio::test]
    async fn poll_times_out_with_204() {
        let (driver, _) = driver_with_channel();
        let handler = LongPollHandler::new(driver, Duration::from_millis(100));
        let mut message = poll_message("thirdsession_789", "GUID=789-789-789-789");
        handler.handle(&mut message).await.unwrap();
        assert_eq!(message.status, 204);
        assert!(message.body.is_empty());
    }

    #[tokio::test]
    async fn wrong_cookie_is_404() {
        let (driver, _) = driver_with_channel();
        let handler = LongPollHandler::new(driver, Duration::from_millis(100));
        let mut message = poll_message("thirdsession_789", "GUID=intruder");
        handler.handle(&mut message).await.unwrap();
        assert_eq!(message.status, 404);
    }

    #[tokio::test]
    async fn events_drain_in_order_across_polls() {
        let (driver, id) = driver_with_channel();
        for text in ["one", "two", "three"] {
            driver.post_event(id, text).await;
        }
        let handler = LongPollHandler::new(Arc::clone(&driver), Duration::from_secs(1));
        let mut numbers = Vec::new();
        for _ in 0..3 {
            let mut message = poll_message("thirdsession_789", "GUID=789-789-789-789");
            handler.handle(&mut message).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(message.body.as_slice()).unwrap();
            numbers.push(body["number"].as_u64().unwrap());
        }
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(driver.channel_queue_count(id), 0);
    }
}
