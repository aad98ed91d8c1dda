//! Response gzip policy.

use marlin_core::message::HttpMessage;

/// MIME types worth gzipping. Binary image/archive formats are already
/// compressed and are left alone.
pub fn is_compressible(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or(content_type).trim();
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/soap+xml"
                | "application/xhtml+xml"
                | "image/svg+xml"
                | "message/http"
        )
}

/// Gzip the response body in place when the site allows it, the client
/// accepts it, the MIME is compressible and the body clears the size
/// threshold. Returns whether compression was applied.
pub fn maybe_compress_response(
    message: &mut HttpMessage,
    site_compression: bool,
    accepts_gzip: bool,
    compress_limit: usize,
) -> bool {
    if !site_compression || !accepts_gzip || message.body.is_gzipped() {
        return false;
    }
    if message.body.len() < compress_limit {
        return false;
    }
    let compressible = message
        .headers
        .get("content-type")
        .map(is_compressible)
        .unwrap_or(false);
    if !compressible {
        return false;
    }
    if message.body.compress().is_err() {
        return false;
    }
    message.headers.set("Content-Encoding", "gzip");
    message.headers.remove("content-length");
    true
}
