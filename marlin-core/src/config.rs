//! Sectioned, typed server configuration.
//!
//! Loaded by figment from `marlin.yaml` plus `MARLIN_`-prefixed environment
//! variables. Optional settings are `Option<T>`: a key being present in the
//! map is the "use this" switch. Per-site and per-URL override files are
//! merged on top of the global configuration; their file names are derived
//! from the prefix URL (see [`site_config_name`] / [`url_config_name`]).

use crate::cookie::SameSite;
use crate::error::MarlinError;
use crate::headers::{CorsPolicy, SecurityHeaders, XFrameOption};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Log cache bounds ─────────────────────────────────────────

pub const LOG_CACHE_MIN: usize = 100;
pub const LOG_CACHE_MAX: usize = 100_000;

// ── Top-level configuration ──────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarlinConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub cors: CorsSettings,

    #[serde(default)]
    pub cookies: CookieSettings,

    #[serde(default)]
    pub authentication: AuthenticationSettings,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub rewriter: RewriterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Filesystem root for file-serving handlers.
    pub web_root: Option<PathBuf>,

    /// Base URL prefix prepended to every site registration.
    pub base_url: Option<String>,

    #[serde(default)]
    pub secure: bool,

    #[serde(default = "default_port")]
    pub port: u16,

    /// strong / named / address / full / weak
    #[serde(default = "default_channel_type")]
    pub channel_type: String,

    #[serde(default = "default_queue_length")]
    pub queue_length: usize,

    /// Tunnel PATCH and other extension verbs through POST.
    #[serde(default)]
    pub verb_tunneling: bool,

    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Stack size for dedicated worker threads (bytes).
    pub stack_size: Option<usize>,

    #[serde(default)]
    pub respond_unicode: bool,

    #[serde(default)]
    pub http_compression: bool,

    /// Responses larger than this stream in chunks.
    #[serde(default = "default_streaming_limit")]
    pub streaming_limit: usize,

    /// Bodies smaller than this are never gzipped.
    #[serde(default = "default_compress_limit")]
    pub compress_limit: usize,

    #[serde(default)]
    pub http_throtteling: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// DENY / SAMEORIGIN / ALLOW-FROM
    pub x_frame_option: Option<String>,
    pub x_frame_allowed: Option<String>,
    pub hsts_max_age: Option<u64>,
    #[serde(default)]
    pub hsts_sub_domains: bool,
    #[serde(default)]
    pub content_no_sniff: bool,
    #[serde(default)]
    pub xss_protection: bool,
    #[serde(default)]
    pub xss_block_mode: bool,
    #[serde(default)]
    pub no_cache_control: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsSettings {
    #[serde(default)]
    pub use_cors: bool,
    pub allow_origin: Option<String>,
    pub allow_headers: Option<String>,
    pub allow_max_age: Option<u64>,
    #[serde(default)]
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieSettings {
    pub cookie_secure: Option<bool>,
    pub cookie_http_only: Option<bool>,
    /// None / Lax / Strict
    pub cookie_same_site: Option<String>,
    pub cookie_path: Option<String>,
    pub cookie_domain: Option<String>,
    pub cookie_expires: Option<String>,
    pub cookie_max_age: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationSettings {
    /// Anonymous / Basic / NTLM / Negotiate / Digest / Kerberos
    pub scheme: Option<String>,
    pub realm: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub ntlm_cache: bool,
    pub user: Option<String>,
    /// Stored obfuscated; see [`Obfuscator`].
    pub password: Option<String>,
    #[serde(default)]
    pub sso: bool,
    #[serde(default)]
    pub client_certificate: bool,
    pub certificate_name: Option<String>,
    pub certificate_thumbprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub use_proxy: bool,
    pub proxy: Option<String>,
    pub proxy_bypass: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,

    #[serde(default = "default_agent")]
    pub agent: String,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_timeout_resolve")]
    pub timeout_resolve_ms: u64,
    #[serde(default = "default_timeout_connect")]
    pub timeout_connect_ms: u64,
    #[serde(default = "default_timeout_send")]
    pub timeout_send_ms: u64,
    #[serde(default = "default_timeout_receive")]
    pub timeout_receive_ms: u64,

    pub certificate_store: Option<String>,
    pub certificate_name: Option<String>,
    #[serde(default)]
    pub relax_certificate_valid: bool,
    #[serde(default)]
    pub relax_certificate_date: bool,
    #[serde(default)]
    pub relax_certificate_author: bool,
    #[serde(default)]
    pub relax_certificate_usage: bool,

    #[serde(default)]
    pub verb_tunneling: bool,
    #[serde(default = "default_true")]
    pub http_compression: bool,
    #[serde(default)]
    pub send_bom: bool,

    #[serde(default)]
    pub secure_ssl20: bool,
    #[serde(default)]
    pub secure_ssl30: bool,
    #[serde(default)]
    pub secure_tls10: bool,
    #[serde(default)]
    pub secure_tls11: bool,
    #[serde(default = "default_true")]
    pub secure_tls12: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub logfile: Option<PathBuf>,

    #[serde(default = "default_log_cache")]
    pub cache: usize,

    #[serde(default)]
    pub do_logging: bool,

    #[serde(default)]
    pub do_timing: bool,

    #[serde(default)]
    pub do_events: bool,

    /// 0..=5, see the log sink levels.
    #[serde(default = "default_log_level")]
    pub log_level: u8,

    #[serde(default)]
    pub rotate: bool,

    /// Log under the per-user directory instead of the shared one.
    #[serde(default)]
    pub per_user: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriterSettings {
    pub protocol: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub extension: Option<String>,
    pub route0: Option<String>,
    pub route1: Option<String>,
    pub route2: Option<String>,
    pub route3: Option<String>,
    pub route4: Option<String>,
    /// Comma-separated route indexes to delete.
    pub remove_route: Option<String>,
    pub start_route: Option<usize>,

    pub target_protocol: Option<String>,
    pub target_server: Option<String>,
    pub target_port: Option<u16>,
    pub target_path: Option<String>,
    pub target_extension: Option<String>,
    pub target_route0: Option<String>,
    pub target_route1: Option<String>,
    pub target_route2: Option<String>,
    pub target_route3: Option<String>,
    pub target_route4: Option<String>,
}

// ── Loading and layering ─────────────────────────────────────

impl MarlinConfig {
    /// Load configuration from a YAML file plus environment overrides
    /// (`MARLIN_SERVER__PORT`, etc.).
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["marlin.yaml", "/etc/marlin/marlin.yaml", "config/marlin.yaml"] {
                if Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("MARLIN_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Merge a site-level override file on top of this configuration, when
    /// one exists for the prefix URL.
    pub fn overlay_site(&self, config_dir: &Path, prefix_url: &str) -> anyhow::Result<Self> {
        self.overlay_file(&config_dir.join(site_config_name(prefix_url)))
    }

    /// Merge a URL-level override file on top of this configuration, when
    /// one exists for the full URL.
    pub fn overlay_url(&self, config_dir: &Path, url: &str) -> anyhow::Result<Self> {
        self.overlay_file(&config_dir.join(url_config_name(url)))
    }

    fn overlay_file(&self, path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(self.clone());
        }
        let merged: Self = Figment::from(Serialized::defaults(self))
            .merge(Yaml::file(path))
            .extract()?;
        Ok(merged)
    }

    /// Validate the settings that have hard rules attached.
    pub fn validate(&self) -> Result<(), MarlinError> {
        let port = self.server.port;
        if port == 0 || (port != 80 && port != 443 && port < 1025) {
            return Err(MarlinError::ConfigInvalid(format!(
                "port must be 80, 443 or >= 1025, got {port}"
            )));
        }
        if self.logging.log_level > 5 {
            return Err(MarlinError::ConfigInvalid(format!(
                "log level must be 0..=5, got {}",
                self.logging.log_level
            )));
        }
        if self.server.min_threads > self.server.max_threads {
            return Err(MarlinError::ConfigInvalid(format!(
                "min_threads {} exceeds max_threads {}",
                self.server.min_threads, self.server.max_threads
            )));
        }
        self.security_headers()?.validate()
    }

    /// Compile the security/CORS sections into the per-site header policy.
    pub fn security_headers(&self) -> Result<SecurityHeaders, MarlinError> {
        let x_frame_option = match &self.security.x_frame_option {
            Some(value) => Some(XFrameOption::parse(value).ok_or_else(|| {
                MarlinError::ConfigInvalid(format!("unknown XFrameOption: {value}"))
            })?),
            None => None,
        };
        let cors = if self.cors.use_cors {
            Some(CorsPolicy {
                allow_origin: self.cors.allow_origin.clone().unwrap_or_else(|| "*".into()),
                allow_headers: self.cors.allow_headers.clone(),
                allow_max_age: self.cors.allow_max_age,
                allow_credentials: self.cors.allow_credentials,
            })
        } else {
            None
        };
        Ok(SecurityHeaders {
            x_frame_option,
            x_frame_allowed: self.security.x_frame_allowed.clone(),
            hsts_max_age: self.security.hsts_max_age,
            hsts_sub_domains: self.security.hsts_sub_domains,
            content_no_sniff: self.security.content_no_sniff,
            xss_protection: self.security.xss_protection,
            xss_block_mode: self.security.xss_block_mode,
            no_cache_control: self.security.no_cache_control,
            cors,
        })
    }

    /// Cookie defaults from the cookie section.
    pub fn cookie_defaults(&self) -> crate::cookie::CookieDefaults {
        crate::cookie::CookieDefaults {
            secure: self.cookies.cookie_secure,
            http_only: self.cookies.cookie_http_only,
            same_site: self
                .cookies
                .cookie_same_site
                .as_deref()
                .and_then(SameSite::parse),
            path: self.cookies.cookie_path.clone(),
            domain: self.cookies.cookie_domain.clone(),
            expires: self
                .cookies
                .cookie_expires
                .as_deref()
                .and_then(|s| s.parse().ok()),
            max_age: self.cookies.cookie_max_age,
        }
    }
}

impl LoggingSettings {
    /// Cache size clamped into the workable range.
    pub fn effective_cache(&self) -> usize {
        self.cache.clamp(LOG_CACHE_MIN, LOG_CACHE_MAX)
    }
}

// ── Persisted override file names ────────────────────────────

/// Derive the site override file name from a prefix URL.
///
/// `http://+:1200/MarlinTest/` becomes `Site+-1200-MarlinTest.config`:
/// separators collapse to `-`, dots become `_`, a weak `*` becomes `!`,
/// trailing dashes are trimmed.
pub fn site_config_name(prefix_url: &str) -> String {
    let rest = match prefix_url.split_once("//") {
        Some((_, rest)) => rest,
        None => prefix_url,
    };
    let mut name = format!("Site{rest}");
    name = name
        .replace(':', "-")
        .replace('*', "!")
        .replace('.', "_")
        .replace(['/', '\\'], "-");
    while name.contains("--") {
        name = name.replace("--", "-");
    }
    let name = name.trim_end_matches('-');
    format!("{name}.config")
}

/// Derive the URL override file name from a full URL: the query string and
/// the resource segment are dropped and the name is prefixed with `URL`.
pub fn url_config_name(url: &str) -> String {
    let rest = match url.split_once("//") {
        Some((_, rest)) => rest,
        None => url,
    };
    let mut name = format!("URL{rest}");
    if let Some(pos) = name.find('?') {
        name.truncate(pos);
    }
    name = name.replace('\\', "/");
    if let Some(pos) = name.rfind('/') {
        name.truncate(pos);
    }
    name = name
        .replace([':', ']', '['], "-")
        .replace('.', "_")
        .replace('/', "-");
    while name.contains("--") {
        name = name.replace("--", "-");
    }
    let name = name.trim_end_matches('-');
    format!("{name}.config")
}

// ── Password obfuscation seam ────────────────────────────────

/// Reversible concealment for stored secrets. The default implementation is
/// plain base64; deployments plug their own primitive behind this trait.
pub trait Obfuscator: Send + Sync {
    fn conceal(&self, plain: &str) -> String;
    fn reveal(&self, hidden: &str) -> Result<String, MarlinError>;
}

pub struct Base64Obfuscator;

impl Obfuscator for Base64Obfuscator {
    fn conceal(&self, plain: &str) -> String {
        BASE64.encode(plain.as_bytes())
    }

    fn reveal(&self, hidden: &str) -> Result<String, MarlinError> {
        let bytes = BASE64
            .decode(hidden.as_bytes())
            .map_err(|e| MarlinError::ConfigInvalid(format!("cannot reveal secret: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| MarlinError::ConfigInvalid(format!("cannot reveal secret: {e}")))
    }
}

impl AuthenticationSettings {
    /// The configured password, revealed through the obfuscation seam.
    pub fn password_plain(&self, obfuscator: &dyn Obfuscator) -> Result<Option<String>, MarlinError> {
        match &self.password {
            Some(hidden) => obfuscator.reveal(hidden).map(Some),
            None => Ok(None),
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            web_root: None,
            base_url: None,
            secure: false,
            port: default_port(),
            channel_type: default_channel_type(),
            queue_length: default_queue_length(),
            verb_tunneling: false,
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            stack_size: None,
            respond_unicode: false,
            http_compression: false,
            streaming_limit: default_streaming_limit(),
            compress_limit: default_compress_limit(),
            http_throtteling: false,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            use_proxy: false,
            proxy: None,
            proxy_bypass: None,
            proxy_user: None,
            proxy_password: None,
            agent: default_agent(),
            retry_count: default_retry_count(),
            timeout_resolve_ms: default_timeout_resolve(),
            timeout_connect_ms: default_timeout_connect(),
            timeout_send_ms: default_timeout_send(),
            timeout_receive_ms: default_timeout_receive(),
            certificate_store: None,
            certificate_name: None,
            relax_certificate_valid: false,
            relax_certificate_date: false,
            relax_certificate_author: false,
            relax_certificate_usage: false,
            verb_tunneling: false,
            http_compression: true,
            send_bom: false,
            secure_ssl20: false,
            secure_ssl30: false,
            secure_tls10: false,
            secure_tls11: false,
            secure_tls12: true,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            logfile: None,
            cache: default_log_cache(),
            do_logging: false,
            do_timing: false,
            do_events: false,
            log_level: default_log_level(),
            rotate: false,
            per_user: false,
        }
    }
}

fn default_port() -> u16 {
    80
}

fn default_channel_type() -> String {
    "weak".to_string()
}

fn default_queue_length() -> usize {
    256
}

fn default_min_threads() -> usize {
    4
}

fn default_max_threads() -> usize {
    128
}

fn default_streaming_limit() -> usize {
    1024 * 1024
}

fn default_compress_limit() -> usize {
    4096
}

fn default_agent() -> String {
    "Marlin/1.0".to_string()
}

fn default_retry_count() -> u32 {
    0
}

fn default_timeout_resolve() -> u64 {
    5_000
}

fn default_timeout_connect() -> u64 {
    10_000
}

fn default_timeout_send() -> u64 {
    30_000
}

fn default_timeout_receive() -> u64 {
    30_000
}

fn default_log_cache() -> usize {
    1_000
}

fn default_log_level() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MarlinConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.max_threads, 128);
        assert_eq!(config.logging.effective_cache(), 1_000);
    }

    #[test]
    fn port_rules() {
        let mut config = MarlinConfig::default();
        for port in [80u16, 443, 1025, 8080] {
            config.server.port = port;
            assert!(config.validate().is_ok(), "port {port} must be valid");
        }
        for port in [0u16, 81, 1024] {
            config.server.port = port;
            assert!(config.validate().is_err(), "port {port} must be rejected");
        }
    }

    #[test]
    fn log_cache_is_clamped() {
        let mut config = MarlinConfig::default();
        config.logging.cache = 10;
        assert_eq!(config.logging.effective_cache(), LOG_CACHE_MIN);
        config.logging.cache = 1_000_000;
        assert_eq!(config.logging.effective_cache(), LOG_CACHE_MAX);
    }

    #[test]
    fn cors_wildcard_with_credentials_fails_validation() {
        let mut config = MarlinConfig::default();
        config.cors.use_cors = true;
        config.cors.allow_origin = Some("*".into());
        config.cors.allow_credentials = true;
        assert!(matches!(config.validate(), Err(MarlinError::ConfigInvalid(_))));
    }

    #[test]
    fn site_config_name_derivation() {
        assert_eq!(
            site_config_name("http://+:1200/MarlinTest/"),
            "Site+-1200-MarlinTest.config"
        );
        assert_eq!(
            site_config_name("http://server.example.com:80/App/"),
            "Siteserver_example_com-80-App.config"
        );
        assert_eq!(site_config_name("http://*:80/Weak/"), "Site!-80-Weak.config");
    }

    #[test]
    fn url_config_name_derivation() {
        assert_eq!(
            url_config_name("http://server.example.com:1200/App/resource.html?q=1"),
            "URLserver_example_com-1200-App.config"
        );
    }

    #[test]
    fn yaml_section_parsing() {
        let yaml = r#"
server:
  port: 1200
  max_threads: 32
  http_compression: true
cors:
  use_cors: true
  allow_origin: "https://app.example.com"
  allow_credentials: true
logging:
  do_logging: true
  log_level: 3
"#;
        let config: MarlinConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 1200);
        assert!(config.server.http_compression);
        assert!(config.cors.use_cors);
        assert_eq!(config.logging.log_level, 3);
        assert!(config.validate().is_ok());
        let headers = config.security_headers().unwrap();
        assert_eq!(headers.cors.unwrap().allow_origin, "https://app.example.com");
    }

    #[test]
    fn overlay_merges_site_file() {
        let dir = std::env::temp_dir().join(format!("marlin-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let name = site_config_name("http://+:1200/MarlinTest/");
        std::fs::write(dir.join(&name), "server:\n  port: 1200\n").unwrap();

        let base = MarlinConfig::default();
        let merged = base.overlay_site(&dir, "http://+:1200/MarlinTest/").unwrap();
        assert_eq!(merged.server.port, 1200);
        // untouched settings keep the base value
        assert_eq!(merged.server.max_threads, base.server.max_threads);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overlay_without_file_is_identity() {
        let dir = std::env::temp_dir();
        let base = MarlinConfig::default();
        let merged = base.overlay_site(&dir, "http://+:9999/NoSuchSite/").unwrap();
        assert_eq!(merged.server.port, base.server.port);
    }

    #[test]
    fn obfuscator_round_trip() {
        let obf = Base64Obfuscator;
        let hidden = obf.conceal("s3cret!");
        assert_ne!(hidden, "s3cret!");
        assert_eq!(obf.reveal(&hidden).unwrap(), "s3cret!");
    }

    #[test]
    fn password_plain_through_seam() {
        let obf = Base64Obfuscator;
        let auth = AuthenticationSettings {
            password: Some(obf.conceal("hunter2")),
            ..Default::default()
        };
        assert_eq!(auth.password_plain(&obf).unwrap(), Some("hunter2".into()));
        let empty = AuthenticationSettings::default();
        assert_eq!(empty.password_plain(&obf).unwrap(), None);
    }
}
