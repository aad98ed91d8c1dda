//! Cookie parsing and `Set-Cookie` serialization.
//!
//! A site carries server-side cookie defaults; attributes the handler did
//! not set explicitly are filled in from those defaults when the response
//! is emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    None,
    Lax,
    Strict,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::None => "None",
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(SameSite::None),
            "lax" => Some(SameSite::Lax),
            "strict" => Some(SameSite::Strict),
            _ => None,
        }
    }
}

/// One cookie, request- or response-side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<SameSite>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Parse a request `Cookie:` header into its name/value pairs.
    pub fn parse_request_header(header: &str) -> Vec<Cookie> {
        header
            .split(';')
            .filter_map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return None;
                }
                let (name, value) = part.split_once('=')?;
                Some(Cookie::new(name.trim(), value.trim()))
            })
            .collect()
    }

    /// Serialize as a `Set-Cookie` value, filling unset attributes from the
    /// site defaults.
    pub fn to_set_cookie(&self, defaults: &CookieDefaults) -> String {
        let mut out = format!("{}={}", self.name, self.value);

        let path = self.path.as_deref().or(defaults.path.as_deref());
        if let Some(path) = path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        let domain = self.domain.as_deref().or(defaults.domain.as_deref());
        if let Some(domain) = domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        let expires = self.expires.or(defaults.expires);
        if let Some(expires) = expires {
            out.push_str("; Expires=");
            out.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        }
        let max_age = self.max_age.or(defaults.max_age);
        if let Some(max_age) = max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if self.secure.or(defaults.secure).unwrap_or(false) {
            out.push_str("; Secure");
        }
        if self.http_only.or(defaults.http_only).unwrap_or(false) {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site.or(defaults.same_site) {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        out
    }
}

/// Server-side defaults applied to every `Set-Cookie` a handler emits that
/// does not already specify the attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieDefaults {
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<SameSite>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
}
