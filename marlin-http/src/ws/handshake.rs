//! RFC-6455 opening handshake, server side.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Method;
use marlin_core::message::HeaderMap;
use sha1::{Digest, Sha1};

/// Concatenated with the client key before hashing, per RFC-6455 §1.3.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The validated handshake answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub accept: String,
    pub subprotocol: Option<String>,
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validate an upgrade request. `offered` lists the sub-protocols the
/// application serves; the first one the client also asked for is selected.
///
/// Failures return the status code (always 400 here) and a specific reason.
pub fn validate(
    method: &Method,
    headers: &HeaderMap,
    offered: &[String],
) -> Result<HandshakeReply, (u16, String)> {
    if method != Method::GET {
        return Err((400, "WebSocket upgrade requires GET".into()));
    }
    let upgrade = headers.get("upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err((400, "missing Upgrade: websocket".into()));
    }
    let connection = headers.get("connection").unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err((400, "missing Connection: Upgrade".into()));
    }
    match headers.get("sec-websocket-version") {
        Some("13") => {}
        Some(other) => return Err((400, format!("unsupported WebSocket version {other}"))),
        None => return Err((400, "missing Sec-WebSocket-Version".into())),
    }
    let Some(key) = headers.get("sec-websocket-key") else {
        return Err((400, "missing Sec-WebSocket-Key".into()));
    };
    match BASE64.decode(key.trim()) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err((400, "Sec-WebSocket-Key is not 16 base64 bytes".into())),
    }

    let subprotocol = headers.get("sec-websocket-protocol").and_then(|requested| {
        let requested: Vec<&str> = requested.split(',').map(str::trim).collect();
        offered
            .iter()
            .find(|candidate| requested.iter().any(|r| r.eq_ignore_ascii_case(candidate)))
            .cloned()
    });

    Ok(HandshakeReply { accept: compute_accept(key.trim()), subprotocol })
}

/// The `101 Switching Protocols` response bytes.
pub fn response_bytes(reply: &HandshakeReply) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
    out.extend_from_slice(reply.accept.as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(protocol) = &reply.subprotocol {
        out.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        out.extend_from_slice(protocol.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "keep-alive, Upgrade");
        headers.set("Sec-WebSocket-Version", "13");
        headers.set("Sec-WebSocket-Key", key);
        headers
    }

    #[test]
    fn rfc_6455_accept_vector() {
        // The worked example from RFC 6455 §1.3
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_handshake_passes() {
        let headers = upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==");
        let reply = validate(&Method::GET, &headers, &[]).unwrap();
        assert_eq!(reply.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(reply.subprotocol, None);
    }

    #[test]
    fn subprotocol_selection_prefers_server_order() {
        let mut headers = upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==");
        headers.set("Sec-WebSocket-Protocol", "chat, superchat");
        let offered = vec!["superchat".to_string(), "chat".to_string()];
        let reply = validate(&Method::GET, &headers, &offered).unwrap();
        assert_eq!(reply.subprotocol, Some("superchat".into()));
    }

    #[test]
    fn specific_failure_reasons() {
        let headers = upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==");
        let (status, reason) = validate(&Method::POST, &headers, &[]).unwrap_err();
        assert_eq!(status, 400);
        assert!(reason.contains("GET"));

        let mut no_upgrade = upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==");
        no_upgrade.remove("Upgrade");
        assert!(validate(&Method::GET, &no_upgrade, &[]).unwrap_err().1.contains("Upgrade"));

        let mut wrong_version = upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==");
        wrong_version.set("Sec-WebSocket-Version", "8");
        assert!(validate(&Method::GET, &wrong_version, &[]).unwrap_err().1.contains("version"));

        let bad_key = upgrade_headers("tooshort");
        assert!(validate(&Method::GET, &bad_key, &[]).unwrap_err().1.contains("base64"));
    }

    #[test]
    fn response_contains_accept_and_protocol() {
        let reply = HandshakeReply {
            accept: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".into(),
            subprotocol: Some("chat".into()),
        };
        let text = String::from_utf8(response_bytes(&reply)).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
