use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub http_proxy: String,
    #[serde(default)]
    pub https_proxy: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_logout_path")]
    pub logout_path: String,
    /// Location handed to the session sink when the session cannot be recovered.
    #[serde(default = "default_login_redirect")]
    pub login_redirect: String,
    /// Transient (5xx / connection) retries for business calls. Never applies to 401.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on the refresh exchange. Unset means the exchange may wait forever.
    #[serde(default)]
    pub refresh_timeout_secs: Option<u64>,
}

const CONFIG_FILE_PATH: &str = "config.toml";

fn default_api_base() -> String {
    "http://localhost:8080".to_string()
}

fn default_refresh_path() -> String {
    "/api/v1/auth/refresh".to_string()
}

fn default_login_path() -> String {
    "/api/v1/auth/login".to_string()
}

fn default_logout_path() -> String {
    "/api/v1/auth/logout".to_string()
}

fn default_login_redirect() -> String {
    "/login".to_string()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base: default_api_base(),
            http_proxy: String::new(),
            https_proxy: String::new(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            logout_path: default_logout_path(),
            login_redirect: default_login_redirect(),
            max_retries: default_max_retries(),
            refresh_timeout_secs: None,
        }
    }
}

impl Config {
    /// Defaults, then `config.toml` in the working directory, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self::from_file(Path::new(CONFIG_FILE_PATH)).unwrap_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn from_file(path: &Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<Config>(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                log::warn!("Ignoring unreadable config file {:?}: {}", path, err);
                None
            }
        }
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_base) = lookup("API_BASE") {
            self.api_base = api_base;
        }
        if let Some(http_proxy) = lookup("HTTP_PROXY") {
            self.http_proxy = http_proxy;
        }
        if let Some(https_proxy) = lookup("HTTPS_PROXY") {
            self.https_proxy = https_proxy;
        }
        if let Some(retries) = lookup("API_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.max_retries = retries;
        }
        if let Some(secs) = lookup("API_REFRESH_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.refresh_timeout_secs = Some(secs);
        }
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_secs.map(Duration::from_secs)
    }
}
