//! Layered configuration for NurtureFlow.
//!
//! Settings are read from `nurtureflow.toml` (optional), then overridden by
//! environment variables, then by CLI flags in `main`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".nurtureflow/nurtureflow.db"
//! dev_mode = false
//! cors = false
//!
//! [ghl]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "http://localhost:3141/oauth/callback"
//! refresh_skew_secs = 600
//! state_ttl_secs = 600
//!
//! [webhook]
//! secret = "..."
//!
//! [frontend]
//! url = "http://localhost:5173"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "nurtureflow.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a local Vite dev server.
    #[serde(default)]
    pub dev_mode: bool,
    /// Permissive CORS outside dev mode.
    #[serde(default)]
    pub cors: bool,
}

impl ServerSection {
    pub fn cors_enabled(&self) -> bool {
        self.dev_mode || self.cors
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
            cors: false,
        }
    }
}

/// GoHighLevel OAuth application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhlSection {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_marketplace_url")]
    pub marketplace_url: String,
    #[serde(default = "default_services_url")]
    pub services_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Value of the `Version` header sent on API calls.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_user_type")]
    pub user_type: String,
    /// Tokens expiring within this many seconds are refreshed before use.
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
    /// OAuth `state` values older than this are rejected by the callback.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GhlSection {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            marketplace_url: default_marketplace_url(),
            services_url: default_services_url(),
            scopes: default_scopes(),
            api_version: default_api_version(),
            user_type: default_user_type(),
            refresh_skew_secs: default_refresh_skew_secs(),
            state_ttl_secs: default_state_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Shared secret for `x-ghl-signature` verification.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSection {
    #[serde(default = "default_frontend_url")]
    pub url: String,
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            url: default_frontend_url(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NurtureConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ghl: GhlSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub frontend: FrontendSection,
}

impl NurtureConfig {
    /// Load from `path` (or `nurtureflow.toml` in the working directory),
    /// then apply environment overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML")
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("GHL_CLIENT_ID") {
            self.ghl.client_id = Some(v);
        }
        if let Some(v) = non_empty("GHL_CLIENT_SECRET") {
            self.ghl.client_secret = Some(v);
        }
        if let Some(v) = non_empty("GHL_REDIRECT_URI") {
            self.ghl.redirect_uri = v;
        }
        if let Some(v) = non_empty("GHL_WEBHOOK_SECRET") {
            self.webhook.secret = Some(v);
        }
        if let Some(v) = non_empty("NURTUREFLOW_FRONTEND_URL") {
            self.frontend.url = v;
        }
        if let Some(v) = non_empty("NURTUREFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("NURTUREFLOW_PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("NURTUREFLOW_PORT is not a valid port: {}", v))?;
        }
        Ok(())
    }

    /// Frontend base URL without a trailing slash.
    pub fn frontend_base(&self) -> &str {
        self.frontend.url.trim_end_matches('/')
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".nurtureflow/nurtureflow.db")
}

fn default_redirect_uri() -> String {
    "http://localhost:3141/oauth/callback".to_string()
}

fn default_marketplace_url() -> String {
    "https://marketplace.gohighlevel.com".to_string()
}

fn default_services_url() -> String {
    "https://services.leadconnectorhq.com".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "contacts.readonly",
        "contacts.write",
        "conversations.readonly",
        "conversations/message.write",
        "locations.readonly",
        "opportunities.readonly",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_api_version() -> String {
    "2021-07-28".to_string()
}

fn default_user_type() -> String {
    "Location".to_string()
}

fn default_refresh_skew_secs() -> i64 {
    600
}

fn default_state_ttl_secs() -> i64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}
