//! Runtime configuration.
//!
//! Resolution order for every key: environment variable (a `.env` file is
//! loaded first through `dotenvy`), then the TOML settings file, then the
//! built-in default. `JWT_SECRET` has no default.

mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::auth::MAX_TOKEN_TTL_HOURS;
use crate::error::ConfigError;
use crate::settings::Settings;

use helpers::{optional_env, parse_bool_env, parse_csv, parse_env, parse_string_env};

/// Shortest accepted signing secret, in bytes.
const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout: Duration,
    pub history_limit: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: SecretString,
    pub token_ttl_hours: i64,
    pub password_hash_iterations: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load `.env`, the optional settings file, and resolve.
    pub fn load(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => {
                return Err(ConfigError::SettingsFile {
                    path: ".env".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        let settings = Settings::load(settings_path)?;
        Self::resolve(&settings)
    }

    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            log_level: parse_string_env("LOG_LEVEL", settings.log_level.clone())?,
            log_json: resolve_log_json(settings)?,
            database: DatabaseConfig::resolve(settings)?,
            upstream: UpstreamConfig::resolve(settings)?,
            server: ServerConfig::resolve(settings)?,
            auth: AuthConfig::resolve(settings)?,
        })
    }
}

impl DatabaseConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let path = match optional_env("DATABASE_PATH")? {
            Some(raw) => PathBuf::from(raw),
            None => settings
                .database
                .path
                .clone()
                .unwrap_or_else(crate::db::default_database_path),
        };
        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.libsql_url.clone());
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);
        if libsql_url.is_some() && libsql_auth_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "LIBSQL_AUTH_TOKEN".to_string(),
                hint: "required when LIBSQL_URL is set".to_string(),
            });
        }
        Ok(Self {
            path,
            libsql_url,
            libsql_auth_token,
        })
    }
}

impl UpstreamConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let url = parse_string_env("AI_CORE_URL", settings.ai_core.url.clone())?;
        let timeout_secs = parse_env("AI_CORE_TIMEOUT", settings.ai_core.timeout_secs)?;
        Ok(Self {
            url: validate_upstream_url(&url)?,
            timeout: timeout_from_secs(timeout_secs)?,
            history_limit: parse_env("AI_CORE_HISTORY_LIMIT", settings.ai_core.history_limit)?,
        })
    }
}

impl ServerConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let cors_origins = match optional_env("CORS_ORIGINS")? {
            Some(raw) => parse_csv(&raw),
            None => settings.server.cors_origins.clone(),
        };
        Ok(Self {
            host: parse_string_env("HOST", settings.server.host.clone())?,
            port: parse_env("PORT", settings.server.port)?,
            cors_origins,
        })
    }
}

impl AuthConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let secret = optional_env("JWT_SECRET")?.ok_or_else(|| ConfigError::MissingRequired {
            key: "JWT_SECRET".to_string(),
            hint: format!("set a random secret of at least {MIN_JWT_SECRET_LEN} bytes"),
        })?;
        let jwt_secret = validate_jwt_secret(SecretString::from(secret))?;

        let token_ttl_hours =
            validate_token_ttl(parse_env("TOKEN_TTL_HOURS", settings.auth.token_ttl_hours)?)?;
        let password_hash_iterations =
            parse_env("PASSWORD_HASH_ITERATIONS", settings.auth.password_hash_iterations)?;
        if password_hash_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PASSWORD_HASH_ITERATIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            jwt_secret,
            token_ttl_hours,
            password_hash_iterations,
        })
    }
}

fn resolve_log_json(settings: &Settings) -> Result<bool, ConfigError> {
    if let Some(format) = optional_env("LOG_FORMAT")? {
        return match format.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(true),
            "text" | "pretty" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message: format!("expected 'json' or 'text', got '{other}'"),
            }),
        };
    }
    parse_bool_env("LOG_JSON", settings.log_json)
}

fn validate_jwt_secret(secret: SecretString) -> Result<SecretString, ConfigError> {
    if secret.expose_secret().len() < MIN_JWT_SECRET_LEN {
        return Err(ConfigError::InvalidValue {
            key: "JWT_SECRET".to_string(),
            message: format!("must be at least {MIN_JWT_SECRET_LEN} bytes"),
        });
    }
    Ok(secret)
}

fn validate_token_ttl(hours: i64) -> Result<i64, ConfigError> {
    if !(1..=MAX_TOKEN_TTL_HOURS).contains(&hours) {
        return Err(ConfigError::InvalidValue {
            key: "TOKEN_TTL_HOURS".to_string(),
            message: format!("must be between 1 and {MAX_TOKEN_TTL_HOURS}, got {hours}"),
        });
    }
    Ok(hours)
}

fn validate_upstream_url(raw: &str) -> Result<String, ConfigError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: "AI_CORE_URL".to_string(),
        message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: "AI_CORE_URL".to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}

fn timeout_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key: "AI_CORE_TIMEOUT".to_string(),
            message: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
