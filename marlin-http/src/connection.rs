//! Per-connection HTTP/1.1 handling.
//!
//! One task per accepted connection: parse the request head with httparse,
//! materialize the body, hand the request to the dispatcher, and loop for
//! keep-alive. Upgrades consume the connection halves and end the loop.

use crate::chunked::{ChunkProgress, ChunkedDecoder};
use crate::dispatch::{self, DispatchOutcome};
use crate::listener::ServerState;
use crate::response::RESP_400;
use crate::sse::SharedWriter;
use bytes::{Buf, BytesMut};
use http::Method;
use marlin_core::error::MarlinError;
use marlin_core::message::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

/// Request heads larger than this are refused outright.
const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Bodies larger than this are refused; the file-buffer contract keeps the
/// limit in one place for a future spill-to-disk variant.
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// The parsed request line and headers.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub keep_alive: bool,
}

/// Buffered reader over the connection's read half.
pub struct RequestReader {
    reader: OwnedReadHalf,
    buf: BytesMut,
}

impl RequestReader {
    pub fn new(reader: OwnedReadHalf) -> Self {
        Self { reader, buf: BytesMut::with_capacity(8 * 1024) }
    }

    /// Read and parse one request head. `Ok(None)` is a clean EOF between
    /// requests.
    pub async fn read_head(&mut self) -> Result<Option<RequestHead>, MarlinError> {
        loop {
            if !self.buf.is_empty() {
                let mut header_storage = [httparse::EMPTY_HEADER; 64];
                let mut parsed = httparse::Request::new(&mut header_storage);
                match parsed.parse(&self.buf) {
                    Ok(httparse::Status::Complete(head_len)) => {
                        let method = parsed
                            .method
                            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                            .ok_or_else(|| MarlinError::BadRequest("bad method".into()))?;
                        let target = parsed.path.unwrap_or("/").to_string();

                        let mut headers = HeaderMap::new();
                        let mut keep_alive = true;
                        for header in parsed.headers.iter() {
                            if header.name.is_empty() {
                                break;
                            }
                            let value = std::str::from_utf8(header.value)
                                .map_err(|_| {
                                    MarlinError::BadRequest("non-UTF-8 header value".into())
                                })?
                                .to_string();
                            if header.name.eq_ignore_ascii_case("connection") {
                                keep_alive = !value.eq_ignore_ascii_case("close");
                            }
                            headers.append(header.name, value);
                        }

                        self.buf.advance(head_len);
                        return Ok(Some(RequestHead { method, target, headers, keep_alive }));
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() > MAX_HEAD_SIZE {
                            return Err(MarlinError::BadRequest("request head too large".into()));
                        }
                    }
                    Err(e) => {
                        return Err(MarlinError::BadRequest(format!("malformed request: {e}")));
                    }
                }
            }

            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(MarlinError::BadRequest("connection closed mid-request".into()));
            }
        }
    }

    /// Materialize the request body declared by the head. Chunked transfer
    /// is decoded; `Content-Length` is read exactly.
    pub async fn read_body(&mut self, head: &RequestHead) -> Result<Vec<u8>, MarlinError> {
        let chunked = head
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if chunked {
            let mut decoder = ChunkedDecoder::new(MAX_BODY_SIZE);
            loop {
                match decoder.decode(&self.buf)? {
                    ChunkProgress::Complete { consumed } => {
                        self.buf.advance(consumed);
                        return Ok(decoder.body);
                    }
                    ChunkProgress::Incomplete => {
                        let read = self.reader.read_buf(&mut self.buf).await?;
                        if read == 0 {
                            return Err(MarlinError::BadRequest(
                                "connection closed inside chunked body".into(),
                            ));
                        }
                    }
                }
            }
        }

        let length: usize = match head.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| MarlinError::BadRequest("bad Content-Length".into()))?,
            None => return Ok(Vec::new()),
        };
        if length > MAX_BODY_SIZE {
            return Err(MarlinError::BadRequest("body too large".into()));
        }
        while self.buf.len() < length {
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(MarlinError::BadRequest("connection closed inside body".into()));
            }
        }
        let body = self.buf.split_to(length);
        Ok(body.to_vec())
    }

    /// Hand the read half (plus already-buffered bytes) to a streaming
    /// engine.
    pub fn detach(self) -> (OwnedReadHalf, BytesMut) {
        (self.reader, self.buf)
    }
}

/// Serve one accepted connection until close, error or upgrade.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut reader = RequestReader::new(read_half);
    let connection_id = state.register_connection(Arc::clone(&writer));

    let result = async {
        loop {
            let head = match reader.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Request parse failed");
                    let mut writer = writer.lock().await;
                    let _ = writer.write_all(RESP_400).await;
                    return Ok(());
                }
            };

            match dispatch::dispatch_request(
                &state,
                head,
                reader,
                Arc::clone(&writer),
                connection_id,
                peer,
                port,
            )
            .await
            {
                DispatchOutcome::Continue { reader: returned, keep_alive } => {
                    reader = returned;
                    if !keep_alive {
                        return Ok(());
                    }
                }
                DispatchOutcome::Close => return Ok(()),
                DispatchOutcome::Detached => return Ok(()),
            }
        }
    }
    .await;

    state.unregister_connection(connection_id);
    result
}
