//! Request authentication against the site's scheme.
//!
//! `Basic` is verified in-process against the site's configured user and
//! password. The handshake-based schemes (NTLM, Negotiate, Digest,
//! Kerberos) belong to an external security provider; an injectable
//! validator hook stands in for it, and without one every request is
//! challenged.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use marlin_core::error::MarlinError;
use marlin_core::message::HeaderMap;
use marlin_site::site::{AuthScheme, SitePolicy};
use std::sync::Arc;

/// External validator for handshake-based schemes. Receives the scheme and
/// the raw `Authorization` value; returns the authenticated principal.
pub type AuthValidator = Arc<dyn Fn(AuthScheme, &str) -> Option<String> + Send + Sync>;

/// Outcome of a successful authentication check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Anonymous,
    Authenticated(String),
}

/// Check the request against the site's authentication scheme.
///
/// `AuthRequired` means the 401 challenge must be emitted; `AuthFailed`
/// means credentials were presented and rejected (403).
pub fn check_auth(
    policy: &SitePolicy,
    headers: &HeaderMap,
    validator: Option<&AuthValidator>,
) -> Result<AuthOutcome, MarlinError> {
    match policy.auth_scheme {
        AuthScheme::Anonymous => Ok(AuthOutcome::Anonymous),
        AuthScheme::Basic => check_basic(policy, headers),
        scheme => {
            let Some(authorization) = headers.get("authorization") else {
                return Err(MarlinError::AuthRequired(policy.auth_realm.clone()));
            };
            match validator.and_then(|v| v(scheme, authorization)) {
                Some(principal) => Ok(AuthOutcome::Authenticated(principal)),
                None => Err(MarlinError::AuthRequired(policy.auth_realm.clone())),
            }
        }
    }
}

fn check_basic(policy: &SitePolicy, headers: &HeaderMap) -> Result<AuthOutcome, MarlinError> {
    let Some(authorization) = headers.get("authorization") else {
        return Err(MarlinError::AuthRequired(policy.auth_realm.clone()));
    };
    let Some(encoded) = authorization.strip_prefix("Basic ") else {
        return Err(MarlinError::AuthRequired(policy.auth_realm.clone()));
    };
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| MarlinError::BadRequest("malformed Basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| MarlinError::BadRequest("malformed Basic credentials".into()))?;
    let Some((user, password)) = decoded.split_once(':') else {
        return Err(MarlinError::BadRequest("malformed Basic credentials".into()));
    };

    let expected_user = policy.auth_user.as_deref().unwrap_or_default();
    let expected_password = policy.auth_password.as_deref().unwrap_or_default();
    if user == expected_user && password == expected_password && !expected_user.is_empty() {
        Ok(AuthOutcome::Authenticated(user.to_string()))
    } else {
        Err(MarlinError::AuthFailed(user.to_string()))
    }
}

/// The `WWW-Authenticate` challenge headers for a 401 answer.
pub fn challenge_headers(policy: &SitePolicy) -> Vec<(String, String)> {
    policy
        .auth_scheme
        .challenge(&policy.auth_realm, policy.auth_domain.as_deref())
        .into_iter()
        .map(|value| ("WWW-Authenticate".to_string(), value))
        .collect()
}

/// Encode credentials for tests and the forwarding client.
pub fn basic_credentials(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}
