pub mod forward;
pub mod rewriter;

pub use forward::{Forwarder, ProxyHandler, RewriteProxy};
pub use rewriter::UrlRewriter;
