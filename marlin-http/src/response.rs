//! Response building into reusable byte buffers.

use marlin_core::cookie::{Cookie, CookieDefaults};
use marlin_core::error::reason_phrase;
use marlin_core::message::HeaderMap;

// ── Pre-built static error responses ──────────────────────────

pub const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nContent-Length: 36\r\nConnection: close\r\n\r\n{\"error\":\"Bad Request\",\"status\":400}";

pub const RESP_404: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: 34\r\nConnection: keep-alive\r\n\r\n{\"error\":\"Not Found\",\"status\":404}";

pub const RESP_500: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Type: application/json\r\nContent-Length: 46\r\nConnection: keep-alive\r\n\r\n{\"error\":\"Internal Server Error\",\"status\":500}";

pub const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: application/json\r\nContent-Length: 36\r\nConnection: keep-alive\r\n\r\n{\"error\":\"Bad Gateway\",\"status\":502}";

/// Build a complete response from status, headers and body.
pub fn build_response(
    buf: &mut Vec<u8>,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    keep_alive: bool,
) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason_phrase(status).as_bytes());
    buf.extend_from_slice(b"\r\nServer: Marlin\r\nContent-Length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(if keep_alive {
        b"\r\nConnection: keep-alive\r\n" as &[u8]
    } else {
        b"\r\nConnection: close\r\n" as &[u8]
    });
    for (name, value) in headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

/// Write the status line: `HTTP/1.1 <status> <phrase>\r\n`.
pub fn reason_head(buf: &mut Vec<u8>, status: u16) {
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason_phrase(status).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Build the response a handler produced: status, the response headers,
/// `Set-Cookie` lines with site defaults applied, and the body.
#[allow(clippy::too_many_arguments)]
pub fn build_full_response(
    buf: &mut Vec<u8>,
    status: u16,
    headers: &HeaderMap,
    cookies: &[Cookie],
    cookie_defaults: &CookieDefaults,
    body: &[u8],
    keep_alive: bool,
    include_body: bool,
) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    reason_head(buf, status);
    buf.extend_from_slice(b"Server: Marlin\r\n");

    if !headers.contains("content-length") {
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !headers.contains("connection") {
        buf.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n" as &[u8]
        } else {
            b"Connection: close\r\n" as &[u8]
        });
    }
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for cookie in cookies {
        buf.extend_from_slice(b"Set-Cookie: ");
        buf.extend_from_slice(cookie.to_set_cookie(cookie_defaults).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if include_body {
        buf.extend_from_slice(body);
    }
}
