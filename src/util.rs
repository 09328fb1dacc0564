use actix_web::HttpResponse;
use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Settings;
use crate::conversion::MessageTranslator;
use crate::credentials::CredentialStore;
use crate::orchestrator::{HttpUpstream, RequestOrchestrator, Upstream};
use crate::rotation::CredentialRotator;
use crate::usage::UsageRecorder;

/// Load dotenv and initialize tracing.
/// - Explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to default .env discovery
/// - Filter: RUST_LOG, then BUDDYRELAY_LOG_LEVEL, then `info`
/// - Logs the source used
pub fn init_tracing() {
    let env_source = load_env_file();

    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            std::env::var("BUDDYRELAY_LOG_LEVEL")
                .ok()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

fn load_env_file() -> String {
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                return format!("{p} ({key})");
            }
        }
    }
    match dotenvy::dotenv() {
        Ok(path) => path.display().to_string(),
        Err(_) => "none".into(),
    }
}

pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        }
        Err(_) => default,
    }
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build the outbound HTTP client.
///
/// The overall deadline is enforced per request by the orchestrator; here the
/// connect timeout and the gap between body reads are bounded.
///
/// Environment:
/// - BUDDYRELAY_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - BUDDYRELAY_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / http_proxy              -> HTTP proxy
/// - HTTPS_PROXY / https_proxy            -> HTTPS proxy
pub fn build_http_client(settings: &Settings) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(settings.timeout_seconds.clamp(1, 30)))
        .read_timeout(Duration::from_secs(settings.timeout_seconds.max(1)));

    if env_truthy("BUDDYRELAY_NO_PROXY", false) {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("BUDDYRELAY_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub usage: Arc<UsageRecorder>,
    pub rotator: Arc<CredentialRotator>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the service from settings: load credentials and build the
    /// reqwest transport.
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let client = build_http_client(&settings);
        Self::with_upstream(settings, Arc::new(HttpUpstream::new(client)))
    }

    /// Same as [`AppState::from_settings`] with an explicit backend transport.
    pub fn with_upstream(settings: Settings, upstream: Arc<dyn Upstream>) -> anyhow::Result<Self> {
        let usage = Arc::new(UsageRecorder::new());
        let store = CredentialStore::new(&settings.creds_dir);
        let rotator = Arc::new(CredentialRotator::new(
            store,
            usage.clone(),
            settings.rotation_count,
        )?);
        let translator = MessageTranslator::new(settings.rewrite_rules());
        let orchestrator = Arc::new(RequestOrchestrator::new(
            rotator.clone(),
            usage.clone(),
            translator,
            upstream,
            settings.chat_completions_url(),
            settings.backend_domain(),
            Duration::from_secs(settings.timeout_seconds),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            usage,
            rotator,
            orchestrator,
            started_at: Instant::now(),
        })
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Build CORS configuration from environment variables.
///
/// - CORS_ALLOWED_ORIGINS: comma-separated origins, or `*`
/// - CORS_ALLOWED_METHODS: comma-separated methods, or `*`
/// - CORS_ALLOWED_HEADERS: comma-separated headers, or `*`
/// - CORS_ALLOW_CREDENTIALS: 1|true|yes|on
/// - CORS_MAX_AGE: seconds
///
/// Unset values are permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match list_env("CORS_ALLOWED_ORIGINS") {
        Some(EnvList::Any) | None => cors = cors.allow_any_origin(),
        Some(EnvList::Items(origins)) => {
            for o in origins {
                cors = cors.allowed_origin(&o);
            }
        }
    }

    match list_env("CORS_ALLOWED_METHODS") {
        Some(EnvList::Any) | None => cors = cors.allow_any_method(),
        Some(EnvList::Items(methods)) => {
            let parsed: Vec<actix_web::http::Method> = methods
                .iter()
                .filter_map(|m| m.parse().ok())
                .collect();
            if !parsed.is_empty() {
                cors = cors.allowed_methods(parsed);
            }
        }
    }

    match list_env("CORS_ALLOWED_HEADERS") {
        Some(EnvList::Any) | None => cors = cors.allow_any_header(),
        Some(EnvList::Items(headers)) => {
            for h in headers {
                cors = cors.allowed_header(h.as_str());
            }
        }
    }

    if env_truthy("CORS_ALLOW_CREDENTIALS", false) {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

enum EnvList {
    Any,
    Items(Vec<String>),
}

fn list_env(name: &str) -> Option<EnvList> {
    let raw = std::env::var(name).ok()?;
    let s = raw.trim();
    if s == "*" {
        return Some(EnvList::Any);
    }
    let items: Vec<String> = s
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(EnvList::Items(items))
    }
}
