//! libSQL backend.
//!
//! Every operation opens its own connection from the shared `Database`
//! handle; connections are cheap and dropping one releases it on every exit
//! path. Timestamps are stored as fixed-width RFC 3339 text so that lexical
//! order is chronological order.

mod columns;
mod conversations;
mod users;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Builder, Connection, Value};
use uuid::Uuid;

use crate::db::Database;
use crate::db::libsql_migrations;
use crate::error::DatabaseError;

/// Storage timestamp format: microsecond precision, always UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Clone)]
pub struct LibSqlBackend {
    db: Arc<libsql::Database>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Opened local libSQL database");
        Ok(Self { db: Arc::new(db) })
    }

    /// Open an embedded replica that syncs with a remote libSQL server.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open replica of {}: {}", url, e)))?;
        tracing::debug!(path = %path.display(), url, "Opened libSQL remote replica");
        Ok(Self { db: Arc::new(db) })
    }

    /// A fresh connection with foreign keys enforced.
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        // busy_timeout reports the new value as a row.
        conn.query("PRAGMA busy_timeout = 5000", ()).await?;
        Ok(conn)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let applied = libsql_migrations::migrate_up(&conn, None).await?;
        if !applied.is_empty() {
            tracing::info!(steps = ?applied, "Applied schema migrations");
        }
        Ok(())
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), DatabaseError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            DatabaseError::Pool(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts the storage format, any RFC 3339 string, and SQLite's
/// `datetime('now')` output.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} uuid: {}", field, e)))
}

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_i64(row: &libsql::Row, idx: i32) -> Option<i64> {
    match row.get_value(idx) {
        Ok(Value::Integer(n)) => Some(n),
        _ => None,
    }
}

pub(crate) fn get_opt_f64(row: &libsql::Row, idx: i32) -> Option<f64> {
    match row.get_value(idx) {
        Ok(Value::Real(f)) => Some(f),
        Ok(Value::Integer(n)) => Some(n as f64),
        _ => None,
    }
}

pub(crate) fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

pub(crate) fn opt_i64(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn opt_f64(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Real)
}
