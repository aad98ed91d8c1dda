pub mod channel;
pub mod driver;
pub mod event;
pub mod longpoll;

pub use channel::{Channel, ChannelPolicy, ChannelTransport, EventCallback};
pub use driver::EventDriver;
pub use event::{EventKind, LtEvent};
pub use longpoll::LongPollHandler;
