//! Error types for every layer of the service.
//!
//! Storage, configuration and upstream failures each get their own enum.
//! `ServiceError` is the taxonomy that reaches the API edge, where it is
//! mapped onto fixed HTTP status codes.

use std::time::Duration;

/// Persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("constraint failed") {
            DatabaseError::Constraint(message)
        } else {
            DatabaseError::Query(message)
        }
    }
}

/// Configuration resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read settings file {path}: {reason}")]
    SettingsFile { path: String, reason: String },
}

/// Failures of the single upstream call per chat turn.
///
/// The three kinds stay distinguishable all the way to the caller.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("AI Core did not answer within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Cannot reach AI Core at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("AI Core protocol error (status {status:?}): {detail}")]
    Protocol { status: Option<u16>, detail: String },
}

/// Malformed caller input, pinned to the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Schema chain failures.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Broken migration chain: {0}")]
    BrokenChain(String),

    #[error("Unknown migration step '{0}'")]
    UnknownStep(String),

    #[error("Recorded schema state does not match the chain: {0}")]
    StateMismatch(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<MigrationError> for DatabaseError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Database(inner) => inner,
            other => DatabaseError::Migration(other.to_string()),
        }
    }
}

/// Bearer credential and password failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token expired")]
    Expired,

    #[error("Invalid password hash: {0}")]
    BadHash(String),
}

/// Startup failures of the HTTP listener.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

/// Domain-level outcome of a service operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Upstream metadata failed type checks; nothing was persisted.
    #[error("Upstream metadata rejected: {0}")]
    UpstreamValidation(ValidationError),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Not authorized to access {what}")]
    Forbidden { what: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn forbidden(what: impl Into<String>) -> Self {
        Self::Forbidden { what: what.into() }
    }
}

impl From<DatabaseError> for ServiceError {
    fn from(err: DatabaseError) -> Self {
        tracing::error!(error = %err, "Storage failure");
        ServiceError::Internal(err.to_string())
    }
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        ServiceError::Unauthorized(err.to_string())
    }
}
