pub mod handler;
pub mod handlers;
pub mod registry;
pub mod site;

pub use handler::{Filter, FilterAction, FilterChain, FnFilter, FnHandler, HandlerMap, HandlerOutcome, SiteHandler};
pub use registry::SiteRegistry;
pub use site::{AuthScheme, EncryptionLevel, Site, SiteKey, SiteKind, SitePolicy, SiteState, SiteTimeouts, StartedSite};
