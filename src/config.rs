//! Service settings loaded from the environment.
//!
//! Environment (all optional):
//! - BUDDYRELAY_HOST / BUDDYRELAY_PORT     -> bind address (127.0.0.1:8001)
//! - BUDDYRELAY_PASSWORD                   -> shared secret for callers
//! - BUDDYRELAY_API_ENDPOINT               -> backend base URL
//! - BUDDYRELAY_CREDS_DIR                  -> credential directory
//! - BUDDYRELAY_LOG_LEVEL                  -> log filter when RUST_LOG is unset
//! - BUDDYRELAY_MODELS                     -> comma-separated advertised models
//! - BUDDYRELAY_ROTATION_COUNT             -> requests per credential (0 = fixed)
//! - BUDDYRELAY_TIMEOUT_SECONDS            -> outbound deadline
//! - BUDDYRELAY_REWRITE_RULES              -> JSON file of content rewrite rules

use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::conversion::RewriteRule;

pub const DEFAULT_API_ENDPOINT: &str = "https://www.codebuddy.ai";
pub const CHAT_COMPLETIONS_PATH: &str = "/v2/chat/completions";
pub const DEFAULT_MODELS: &str = "claude-4.0,claude-3.7,gpt-5,gpt-5-mini,gpt-5-nano,o4-mini,gemini-2.5-flash,gemini-2.5-pro,auto-chat";

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub api_endpoint: String,
    pub creds_dir: PathBuf,
    pub log_level: String,
    pub models: Vec<String>,
    pub rotation_count: u64,
    pub timeout_seconds: u64,
    pub rewrite_rules_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            password: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            creds_dir: PathBuf::from(".buddyrelay_creds"),
            log_level: "INFO".to_string(),
            models: split_list(DEFAULT_MODELS),
            rotation_count: 10,
            timeout_seconds: 300,
            rewrite_rules_path: None,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", name, raw);
            default
        }),
        None => default,
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            host: env_string("BUDDYRELAY_HOST").unwrap_or(defaults.host),
            port: env_parse("BUDDYRELAY_PORT", defaults.port),
            password: env_string("BUDDYRELAY_PASSWORD"),
            api_endpoint: env_string("BUDDYRELAY_API_ENDPOINT")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_endpoint),
            creds_dir: env_string("BUDDYRELAY_CREDS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.creds_dir),
            log_level: env_string("BUDDYRELAY_LOG_LEVEL").unwrap_or(defaults.log_level),
            models: env_string("BUDDYRELAY_MODELS")
                .map(|m| split_list(&m))
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.models),
            rotation_count: env_parse("BUDDYRELAY_ROTATION_COUNT", defaults.rotation_count),
            timeout_seconds: env_parse("BUDDYRELAY_TIMEOUT_SECONDS", defaults.timeout_seconds),
            rewrite_rules_path: env_string("BUDDYRELAY_REWRITE_RULES").map(PathBuf::from),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}{}", self.api_endpoint, CHAT_COMPLETIONS_PATH)
    }

    /// Host part of the backend URL, sent as `X-Domain`.
    pub fn backend_domain(&self) -> String {
        let without_scheme = self
            .api_endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.api_endpoint);
        without_scheme
            .split('/')
            .next()
            .unwrap_or(without_scheme)
            .to_string()
    }

    /// Configured rewrite rules, or the built-in set when none are configured
    /// or the file cannot be read.
    pub fn rewrite_rules(&self) -> Vec<RewriteRule> {
        match &self.rewrite_rules_path {
            Some(path) => match RewriteRule::load_from_file(path) {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(
                        "Failed to load rewrite rules from {}: {}; using built-in rules",
                        path.display(),
                        e
                    );
                    RewriteRule::builtin()
                }
            },
            None => RewriteRule::builtin(),
        }
    }

    /// Settings view safe to return over HTTP.
    pub fn redacted(&self) -> Value {
        json!({
            "host": self.host,
            "port": self.port,
            "password_set": self.password.is_some(),
            "api_endpoint": self.api_endpoint,
            "creds_dir": self.creds_dir.display().to_string(),
            "log_level": self.log_level,
            "models": self.models,
            "timeout_seconds": self.timeout_seconds,
            "rewrite_rules_path": self.rewrite_rules_path.as_ref().map(|p| p.display().to_string()),
        })
    }
}
