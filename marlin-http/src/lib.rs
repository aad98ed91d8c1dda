pub mod auth;
pub mod chunked;
pub mod compress;
pub mod connection;
pub mod dispatch;
pub mod listener;
pub mod response;
pub mod sse;
pub mod ws;

pub use listener::{HttpServer, ServerPhase, ServerState, SocketHook, StreamHook};
pub use sse::{EventStream, ServerEvent, SharedWriter, SseEngine};
pub use ws::{SessionSettings, SocketState, WebSocketSession, WsEngine, WsFrame};
