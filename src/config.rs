use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::Scope;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub scope: Scope,
    /// Seconds between scheduled cycles.
    pub interval_secs: u64,
    /// Upper bound on concurrent updates within a cycle.
    pub max_concurrency: usize,
    pub dry_run: bool,
    pub run_once: bool,
    /// Prune dangling images after a cycle that updated something.
    pub cleanup: bool,
    /// Host label used in reports and notifications.
    pub host_name: String,
    pub registry: RegistryConfig,
    pub timeouts: Timeouts,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Manifest query attempts before a reference counts as unreachable.
    pub attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    pub resolve_secs: u64,
    /// Inspect, create, start and remove calls.
    pub engine_secs: u64,
    pub pull_secs: u64,
    /// Grace period given to the old container before it is killed.
    pub stop_secs: u64,
    pub health_secs: u64,
    pub health_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Accept `/update_now` from the configured chat as a cycle trigger.
    pub commands: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    pub api_base: String,
}

/// Credentials for registry queries and pulls, supplied from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    /// Registry host these apply to; all registries when `None`.
    pub server: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            interval_secs: 3600,
            max_concurrency: 1,
            dry_run: false,
            run_once: false,
            cleanup: true,
            host_name: "unknown-host".into(),
            registry: RegistryConfig {
                attempts: 3,
                backoff_ms: 500,
                server: None,
                username: None,
                password: None,
            },
            timeouts: Timeouts {
                resolve_secs: 30,
                engine_secs: 60,
                pull_secs: 600,
                stop_secs: 30,
                health_secs: 120,
                health_poll_ms: 1000,
            },
            telegram: TelegramConfig {
                enabled: false,
                commands: false,
                token: None,
                chat_id: None,
                api_base: "https://api.telegram.org".into(),
            },
        }
    }
}

impl Config {
    /// Defaults, then `freshd.toml` (or `path`), then `freshd.json`, then
    /// `FRESHD_*` environment variables with `__` separating nested keys.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let toml = path.unwrap_or_else(|| Path::new("freshd.toml"));
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml))
            .merge(Json::file("freshd.json"))
            .merge(Env::prefixed("FRESHD_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("FRESHD_REGISTRY_PASSWORD_FILE") {
            config.registry.password = Some(read_secret(&secret_file)?);
        }
        if let Ok(secret_file) = std::env::var("FRESHD_TELEGRAM_TOKEN_FILE") {
            config.telegram.token = Some(read_secret(&secret_file)?);
        }

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.scope {
            Scope::Explicit { containers } if containers.is_empty() => {
                anyhow::bail!("scope lists no containers; refusing to manage nothing")
            }
            Scope::Compose { project, .. } if project.trim().is_empty() => {
                anyhow::bail!("compose scope needs a project name")
            }
            _ => {}
        }
        if self.registry.attempts == 0 {
            anyhow::bail!("registry.attempts must be at least 1");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.interval_secs == 0 && !self.run_once {
            anyhow::bail!("interval_secs must be at least 1");
        }
        if self.registry.username.is_some() != self.registry.password.is_some() {
            anyhow::bail!("registry username and password must be set together");
        }
        if (self.telegram.enabled || self.telegram.commands)
            && (self.telegram.token.is_none() || self.telegram.chat_id.is_none())
        {
            anyhow::bail!("telegram needs both token and chat_id");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn credentials(&self) -> Option<RegistryCredentials> {
        Some(RegistryCredentials {
            username: self.registry.username.clone()?,
            password: self.registry.password.clone()?,
            server: self.registry.server.clone(),
        })
    }
}

fn read_secret(path: &str) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| anyhow::anyhow!("Failed to read secret file {}: {}", path, e))
}
