use thiserror::Error;

/// Unified error type for the Marlin runtime.
#[derive(Error, Debug)]
pub enum MarlinError {
    #[error("Site already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid site prefix: {0}")]
    InvalidPrefix(String),

    #[error("No parent site for sub-site: {0}")]
    NoParentSite(String),

    #[error("Site not configured: {0}")]
    NotConfigured(String),

    #[error("Site has registered sub-sites: {0}")]
    HasSubsites(String),

    #[error("Invalid site configuration: {0}")]
    ConfigInvalid(String),

    #[error("Port unavailable: {0}")]
    PortUnavailable(u16),

    #[error("Authentication required for realm: {0}")]
    AuthRequired(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Handler fault: {0}")]
    HandlerFault(String),

    #[error("Stream gone")]
    StreamGone,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl MarlinError {
    /// Map to the HTTP status code the router answers with.
    ///
    /// Registration-time errors never reach a client; they map to 500 so a
    /// handler surfacing one by accident still produces a valid response.
    pub fn status_code(&self) -> u16 {
        match self {
            MarlinError::AuthRequired(_) => 401,
            MarlinError::AuthFailed(_) => 403,
            MarlinError::NotFound(_) => 404,
            MarlinError::MethodNotAllowed(_) => 405,
            MarlinError::UnsupportedMediaType(_) => 415,
            MarlinError::BadRequest(_) => 400,
            MarlinError::Timeout(_) => 408,
            MarlinError::BackendUnavailable(_) => 502,
            MarlinError::StreamGone => 410,
            MarlinError::HandlerFault(_) => 500,
            _ => 500,
        }
    }

    /// Opaque JSON error body. Internal detail stays out of the wire format.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        format!(r#"{{"error":"{}","status":{}}}"#, reason_phrase(status), status).into_bytes()
    }
}

/// Canonical reason phrase for the status codes Marlin emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        410 => "Gone",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        101 => "Switching Protocols",
        _ => "Unknown",
    }
}
