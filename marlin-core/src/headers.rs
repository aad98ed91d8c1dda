//! Always-added security headers and CORS policy for a site.

use crate::error::MarlinError;
use crate::message::HeaderMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum XFrameOption {
    Deny,
    SameOrigin,
    AllowFrom,
}

impl XFrameOption {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DENY" => Some(XFrameOption::Deny),
            "SAMEORIGIN" => Some(XFrameOption::SameOrigin),
            "ALLOW-FROM" => Some(XFrameOption::AllowFrom),
            _ => None,
        }
    }
}

/// Cross-origin resource sharing settings for one site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorsPolicy {
    pub allow_origin: String,
    pub allow_headers: Option<String>,
    pub allow_max_age: Option<u64>,
    pub allow_credentials: bool,
}

/// The security headers a site injects into every response.
///
/// Headers the handler already set explicitly are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityHeaders {
    pub x_frame_option: Option<XFrameOption>,
    /// Origin for `ALLOW-FROM`.
    pub x_frame_allowed: Option<String>,
    pub hsts_max_age: Option<u64>,
    pub hsts_sub_domains: bool,
    pub content_no_sniff: bool,
    pub xss_protection: bool,
    pub xss_block_mode: bool,
    pub no_cache_control: bool,
    pub cors: Option<CorsPolicy>,
}

impl SecurityHeaders {
    /// Reject configurations that cannot be honored on the wire.
    pub fn validate(&self) -> Result<(), MarlinError> {
        if let Some(cors) = &self.cors
            && cors.allow_credentials
            && cors.allow_origin == "*"
        {
            return Err(MarlinError::ConfigInvalid(
                "credentials require explicit origin".into(),
            ));
        }
        if self.x_frame_option == Some(XFrameOption::AllowFrom) && self.x_frame_allowed.is_none() {
            return Err(MarlinError::ConfigInvalid(
                "ALLOW-FROM requires an allowed origin".into(),
            ));
        }
        Ok(())
    }

    /// Inject the configured headers into a response header map.
    pub fn apply(&self, headers: &mut HeaderMap) {
        match &self.x_frame_option {
            Some(XFrameOption::Deny) => {
                headers.set_if_absent("X-Frame-Options", "DENY");
            }
            Some(XFrameOption::SameOrigin) => {
                headers.set_if_absent("X-Frame-Options", "SAMEORIGIN");
            }
            Some(XFrameOption::AllowFrom) => {
                if let Some(allowed) = &self.x_frame_allowed {
                    headers.set_if_absent("X-Frame-Options", format!("ALLOW-FROM {allowed}"));
                }
            }
            None => {}
        }
        if let Some(max_age) = self.hsts_max_age {
            let value = if self.hsts_sub_domains {
                format!("max-age={max_age}; includeSubDomains")
            } else {
                format!("max-age={max_age}")
            };
            headers.set_if_absent("Strict-Transport-Security", value);
        }
        if self.content_no_sniff {
            headers.set_if_absent("X-Content-Type-Options", "nosniff");
        }
        if self.xss_protection {
            let value = if self.xss_block_mode { "1; mode=block" } else { "1" };
            headers.set_if_absent("X-XSS-Protection", value);
        }
        if self.no_cache_control {
            headers.set_if_absent("Cache-Control", "no-cache, no-store, must-revalidate");
            headers.set_if_absent("Pragma", "no-cache");
            headers.set_if_absent("Expires", "0");
        }
        if let Some(cors) = &self.cors {
            headers.set_if_absent("Access-Control-Allow-Origin", cors.allow_origin.clone());
            if let Some(allow_headers) = &cors.allow_headers {
                headers.set_if_absent("Access-Control-Allow-Headers", allow_headers.clone());
            }
            if let Some(max_age) = cors.allow_max_age {
                headers.set_if_absent("Access-Control-Max-Age", max_age.to_string());
            }
            if cors.allow_credentials {
                headers.set_if_absent("Access-Control-Allow-Credentials", "true");
            }
        }
    }
}
