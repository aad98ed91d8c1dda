//! Event-driver end-to-end: channels delivering over WebSocket, SSE and
//! long-poll against a live server, with SureDelivery drain checks.

use marlin_core::config::MarlinConfig;
use marlin_events::channel::ChannelPolicy;
use marlin_events::driver::EventDriver;
use marlin_events::event::{EventKind, LtEvent};
use marlin_http::listener::HttpServer;
use marlin_http::ws::frame::{self, OpCode};
use marlin_site::registry::SiteRegistry;
use marlin_site::site::SiteKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const NUM_EVENTS: usize = 20;

struct Seen {
    opens: usize,
    closes: usize,
    messages: Vec<String>,
}

fn counting_callback(seen: &Arc<Mutex<Seen>>) -> marlin_events::channel::EventCallback {
    let seen = Arc::clone(seen);
    Arc::new(move |event: LtEvent| {
        let mut seen = seen.lock().unwrap();
        match event.kind {
            EventKind::Open => seen.opens += 1,
            EventKind::Close => seen.closes += 1,
            EventKind::Message | EventKind::Binary => seen.messages.push(event.payload_string()),
            EventKind::Error => {}
        }
    })
}

async fn start_driver_server() -> (Arc<HttpServer>, Arc<EventDriver>, u16) {
    let registry = Arc::new(SiteRegistry::new());
    let config = Arc::new(MarlinConfig::default());
    let server = Arc::new(HttpServer::new(Arc::clone(&registry), config));
    let port = server.listen("127.0.0.1:0").await.unwrap();

    let site = registry
        .create_site(SiteKind::Strong, false, port, "/MarlinTest/Driver/", false)
        .unwrap();
    let driver = EventDriver::new(Arc::clone(server.sse()));
    driver.register_site(&server, &site).unwrap();
    registry.start_site(&site).unwrap();

    (server, driver, port)
}

// ── WebSocket transport ──────────────────────────────────────

#[tokio::test]
async fn websocket_channel_delivers_every_event() {
    let (_server, driver, port) = start_driver_server().await;

    let seen = Arc::new(Mutex::new(Seen { opens: 0, closes: 0, messages: Vec::new() }));
    let channel = driver.register_channel("firstsession_123", "GUID", "123-123-123-123");
    assert_ne!(channel, 0);
    assert!(driver.set_channel_policy(
        channel,
        ChannelPolicy::SureDelivery,
        counting_callback(&seen),
        1,
    ));
    driver.start_driver();

    // Client opens the socket with the channel cookie
    let request = format!(
        "GET /MarlinTest/Driver/firstsession_123 HTTP/1.1\r\nHost: 127.0.0.1\r\nCookie: GUID=123-123-123-123\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !collected.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = client.read(&mut buf).await.unwrap();
        collected.extend_from_slice(&buf[..n]);
    }
    assert!(collected.starts_with(b"HTTP/1.1 101 "));
    let head_end = collected.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    collected.drain(..head_end);

    // EV_Open reaches the application
    for _ in 0..200 {
        if seen.lock().unwrap().opens == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().unwrap().opens, 1, "EV_Open must be synthesized");

    // Post the test burst; every event must land on the client
    for i in 0..NUM_EVENTS {
        assert!(driver.post_event(channel, format!("Testing event number [{i}]")).await);
    }

    let mut received = Vec::new();
    while received.len() < NUM_EVENTS {
        while let Some((parsed, used)) = frame::parse_frame(&collected, false).unwrap() {
            if parsed.opcode == OpCode::Text {
                received.push(String::from_utf8(parsed.payload).unwrap());
            }
            collected.drain(..used);
        }
        if received.len() >= NUM_EVENTS {
            break;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("socket delivery timed out")
            .unwrap();
        assert!(n > 0, "socket closed early");
        collected.extend_from_slice(&buf[..n]);
    }
    for (i, text) in received.iter().enumerate() {
        assert_eq!(text, &format!("Testing event number [{i}]"));
    }

    // Everything acknowledged: nothing pending
    assert_eq!(driver.channel_queue_count(channel), 0);

    // Client messages flow back to the application callback
    let ws_frame = frame::encode_frame_masked(OpCode::Text, b"from-client", true, [1, 2, 3, 4]);
    client.write_all(&ws_frame).await.unwrap();
    for _ in 0..200 {
        if seen.lock().unwrap().messages.iter().any(|m| m == "from-client") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen.lock().unwrap().messages.iter().any(|m| m == "from-client"));

    // Close: EV_Close synthesized exactly once
    let close = frame::encode_frame_masked(
        OpCode::Close,
        &frame::encode_close_payload(1000, "done"),
        true,
        [9, 9, 9, 9],
    );
    client.write_all(&close).await.unwrap();
    for _ in 0..200 {
        if seen.lock().unwrap().closes == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().unwrap().closes, 1);

    assert!(driver.unregister_channel(channel).is_ok());
    assert!(driver.stop_driver().await);
}

// ── SSE transport ────────────────────────────────────────────

#[tokio::test]
async fn sse_channel_delivers_with_sequence_ids() {
    let (_server, driver, port) = start_driver_server().await;

    let seen = Arc::new(Mutex::new(Seen { opens: 0, closes: 0, messages: Vec::new() }));
    let channel = driver.register_channel("secondsession_456", "GUID", "456-456-456-456");
    driver.set_channel_policy(channel, ChannelPolicy::SureDelivery, counting_callback(&seen), 2);
    driver.start_driver();

    let request = "GET /MarlinTest/Driver/secondsession_456 HTTP/1.1\r\nHost: 127.0.0.1\r\nCookie: GUID=456-456-456-456\r\nAccept: text/event-stream\r\n\r\n";
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let mut text = String::new();
    let mut buf = [0u8; 4096];
    while !text.contains("\r\n\r\n") {
        let n = client.read(&mut buf).await.unwrap();
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(text.contains("Content-Type: text/event-stream"), "{text}");

    // Wait for the channel to bind, then post
    for _ in 0..200 {
        if seen.lock().unwrap().opens == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for i in 0..3 {
        assert!(driver.post_event(channel, format!("sse-{i}")).await);
    }

    while text.matches("data: sse-").count() < 3 {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("SSE delivery timed out")
            .unwrap();
        assert!(n > 0);
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }

    // Events carry the channel sequence as the record id, ascending
    let first = text.find("id: 1\ndata: sse-0").expect("first event");
    let second = text.find("id: 2\ndata: sse-1").expect("second event");
    let third = text.find("id: 3\ndata: sse-2").expect("third event");
    assert!(first < second && second < third, "{text}");
    assert_eq!(driver.channel_queue_count(channel), 0);

    // Disconnect: the stream watcher detaches the channel
    drop(client);
    for _ in 0..400 {
        if seen.lock().unwrap().closes == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().unwrap().closes, 1, "EV_Close on client disconnect");

    assert!(driver.stop_driver().await);
}

// ── Long-poll transport ──────────────────────────────────────

#[tokio::test]
async fn longpoll_channel_drains_queue_across_polls() {
    let (_server, driver, port) = start_driver_server().await;

    let seen = Arc::new(Mutex::new(Seen { opens: 0, closes: 0, messages: Vec::new() }));
    let channel = driver.register_channel("thirdsession_789", "GUID", "789-789-789-789");
    driver.set_channel_policy(channel, ChannelPolicy::SureDelivery, counting_callback(&seen), 3);
    driver.start_driver();

    for i in 0..3 {
        driver.post_event(channel, format!("poll-{i}")).await;
    }
    assert_eq!(driver.channel_queue_count(channel), 3);

    let mut payloads = Vec::new();
    for _ in 0..3 {
        let request = "POST /MarlinTest/Driver/thirdsession_789 HTTP/1.1\r\nHost: 127.0.0.1\r\nCookie: GUID=789-789-789-789\r\nContent-Length: 0\r\n\r\n";
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();

        let mut text = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("poll timed out")
                .unwrap();
            if n == 0 {
                break;
            }
            text.push_str(&String::from_utf8_lossy(&buf[..n]));
            if let Some(body_start) = text.find("\r\n\r\n") {
                let body = &text[body_start + 4..];
                if body.ends_with('}') {
                    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
                    payloads.push(parsed["payload"].as_str().unwrap().to_string());
                    break;
                }
            }
        }
    }
    assert_eq!(payloads, vec!["poll-0", "poll-1", "poll-2"]);
    assert_eq!(driver.channel_queue_count(channel), 0, "all polled events delivered");
    assert_eq!(seen.lock().unwrap().opens, 1, "first poll attaches the channel");

    // Invariant: stop with empty queues succeeds and closes the transport
    assert!(driver.stop_driver().await);
    assert_eq!(driver.channel_queue_count(channel), 0);
    assert_eq!(seen.lock().unwrap().closes, 1);
}

// ── Wrong cookie never binds ─────────────────────────────────

#[tokio::test]
async fn wrong_cookie_is_rejected() {
    let (_server, driver, port) = start_driver_server().await;
    let channel = driver.register_channel("firstsession_123", "GUID", "123-123-123-123");
    driver.set_channel_policy(channel, ChannelPolicy::BestEffort, Arc::new(|_| {}), 0);
    driver.start_driver();

    let request = "POST /MarlinTest/Driver/firstsession_123 HTTP/1.1\r\nHost: 127.0.0.1\r\nCookie: GUID=wrong-wrong\r\nContent-Length: 0\r\n\r\n";
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let mut text = String::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
        if text.contains("\r\n\r\n") {
            break;
        }
    }
    assert!(text.starts_with("HTTP/1.1 404 "), "{text}");
}
