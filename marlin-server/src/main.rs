// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Marlin — HTTP/1.1 serving runtime
//
//  Data plane:  site registry → filter/handler dispatch
//  Streaming:   SSE + WebSocket engines, event driver
//  Forwarding:  URL rewriter chain / reverse proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use http::Method;
use marlin_core::config::{Base64Obfuscator, MarlinConfig};
use marlin_http::listener::HttpServer;
use marlin_observability::logfile::{LogLevel, Logfile, LogfileConfig};
use marlin_observability::reporting;
use marlin_rewrite::forward::{ProxyHandler, RewriteProxy};
use marlin_rewrite::rewriter::UrlRewriter;
use marlin_site::handlers::FileHandler;
use marlin_site::registry::SiteRegistry;
use marlin_site::site::{AuthScheme, SiteKind, SiteTimeouts};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Global shutdown flag — flipped by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "marlin", version, about = "Marlin — HTTP/1.1 serving runtime")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "marlin.yaml")]
    config: PathBuf,

    /// Log level for tracing output
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Site prefix served from the web root
    #[arg(long, default_value = "/")]
    base_prefix: String,

    /// Drain grace period in seconds on shutdown
    #[arg(long, default_value_t = 10)]
    drain_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Marlin starting");

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        MarlinConfig::load(Some(&cli.config))?
    } else {
        info!("No config file found, using defaults");
        MarlinConfig::default()
    };
    config.validate()?;
    let config = Arc::new(config);

    // ── Log sink + reporting ──
    let logfile = config.logging.logfile.as_ref().map(|path| {
        let sink = Logfile::open(LogfileConfig {
            path: path.clone(),
            cache_lines: config.logging.effective_cache(),
            do_logging: config.logging.do_logging,
            do_timing: config.logging.do_timing,
            do_events: config.logging.do_events,
            level: LogLevel::from_u8(config.logging.log_level),
            rotate: config.logging.rotate,
            ..Default::default()
        })
        .expect("cannot open logfile");
        Arc::new(sink)
    });
    reporting::init("Marlin", "Alerts", logfile.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.max_threads.clamp(2, 64))
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // ── Registry and server ──
        let registry = Arc::new(SiteRegistry::new());
        let server = Arc::new(HttpServer::new(Arc::clone(&registry), Arc::clone(&config)));
        if let Some(logfile) = &logfile {
            server.set_logfile(Arc::clone(logfile));
        }

        let addr = format!("0.0.0.0:{}", config.server.port);
        let port = server.listen(&addr).await?;

        // ── Base site over the web root ──
        let kind = SiteKind::parse(&config.server.channel_type).unwrap_or(SiteKind::Weak);
        let site = registry.create_site(kind, config.server.secure, port, &cli.base_prefix, false)?;

        // Per-site override file layered on top of the global settings
        let config_dir = cli.config.parent().unwrap_or(std::path::Path::new("."));
        let site_config = config.overlay_site(config_dir, &site.prefix_url())?;
        site_config.validate()?;

        site.update_policy(|p| {
            p.compression = site_config.server.http_compression;
            p.compress_limit = site_config.server.compress_limit;
            p.timeouts = SiteTimeouts::from_client_settings(&site_config.client);
        })?;
        if let Ok(headers) = site_config.security_headers() {
            site.update_policy(|p| p.headers = headers)?;
        }
        site.update_policy(|p| p.cookie_defaults = site_config.cookie_defaults())?;
        if let Some(web_root) = &site_config.server.web_root {
            site.set_handler(Method::GET, Arc::new(FileHandler::new(web_root)))?;
        }

        // ── Authentication from the config surface ──
        if let Some(scheme) = site_config
            .authentication
            .scheme
            .as_deref()
            .and_then(AuthScheme::parse)
        {
            let password = site_config.authentication.password_plain(&Base64Obfuscator)?;
            site.update_policy(|p| {
                p.auth_scheme = scheme;
                if let Some(realm) = &site_config.authentication.realm {
                    p.auth_realm = realm.clone();
                }
                p.auth_domain = site_config.authentication.domain.clone();
                p.auth_user = site_config.authentication.user.clone();
                p.auth_password = password;
                p.ntlm_cache = site_config.authentication.ntlm_cache;
            })?;
        }

        // ── Rewriter stage, when configured ──
        let has_rewrite_rules = site_config.rewriter.protocol.is_some()
            || site_config.rewriter.server.is_some()
            || site_config.rewriter.port.is_some()
            || site_config.rewriter.path.is_some()
            || site_config.rewriter.extension.is_some();
        if has_rewrite_rules {
            let rewriter = UrlRewriter::from_settings(&site_config.rewriter);
            let proxy = Arc::new(RewriteProxy::new(rewriter, &site_config.client)?);
            site.set_handler(Method::POST, Arc::new(ProxyHandler::new(Arc::clone(&proxy))))?;
            info!("Rewriter stage installed");
        }

        registry.start_site(&site)?;
        info!(port, prefix = %cli.base_prefix, "Marlin is ready — serving traffic");

        // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
        setup_signal_handler();
        while !SHUTDOWN.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Shutdown signal received, draining");
        server.stop(Duration::from_secs(cli.drain_secs)).await;
        registry.stop_all();
        Ok::<(), anyhow::Error>(())
    })?;

    if let Some(logfile) = &logfile {
        logfile.force_flush();
    }
    reporting::shutdown();
    info!("Marlin stopped");
    Ok(())
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
