pub mod config;
pub mod cookie;
pub mod error;
pub mod headers;
pub mod message;
pub mod url;

pub use config::MarlinConfig;
pub use cookie::{Cookie, CookieDefaults, SameSite};
pub use error::MarlinError;
pub use headers::SecurityHeaders;
pub use message::{FileBuffer, HeaderMap, HttpMessage, Routing};
pub use url::CrackedUrl;
