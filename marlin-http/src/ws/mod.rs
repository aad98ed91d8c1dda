pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{Frame, OpCode, ProtocolError};
pub use session::{SessionSettings, SocketState, WebSocketSession, WsEngine, WsFrame, run_session};
