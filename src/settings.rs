//! File-backed settings.
//!
//! An optional TOML file supplies defaults; environment variables override
//! individual keys when [`crate::config::Config`] is resolved.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub log_json: bool,
    pub database: DatabaseSettings,
    pub ai_core: AiCoreSettings,
    pub server: ServerSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: Option<PathBuf>,
    pub libsql_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiCoreSettings {
    pub url: String,
    /// Whole-request timeout in seconds.
    pub timeout_secs: f64,
    pub history_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token_ttl_hours: i64,
    pub password_hash_iterations: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            database: DatabaseSettings::default(),
            ai_core: AiCoreSettings::default(),
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl Default for AiCoreSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            timeout_secs: 30.0,
            history_limit: 20,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24,
            password_hash_iterations: 100_000,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::SettingsFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::SettingsFile { reason, .. } => ConfigError::SettingsFile {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::SettingsFile {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }
}
