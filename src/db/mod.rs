//! Database abstraction layer.
//!
//! Persistence is expressed as a set of `async_trait` sub-traits combined
//! into one `Database` supertrait, so services hold an `Arc<dyn Database>`
//! and tests can swap the backend. The only backend is libSQL, either a
//! local file or an embedded replica of a remote database.

pub mod libsql;
pub mod libsql_migrations;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::metadata::VersionedMetadata;

/// Open the configured backend without touching the schema.
pub async fn open_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<libsql::LibSqlBackend, DatabaseError> {
    use secrecy::ExposeSecret as _;

    if let Some(ref url) = config.libsql_url {
        let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
            DatabaseError::Pool("LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string())
        })?;
        libsql::LibSqlBackend::new_remote_replica(&config.path, url, token.expose_secret()).await
    } else {
        libsql::LibSqlBackend::new_local(&config.path).await
    }
}

/// Open the configured backend, bring the schema to head, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    let backend = open_from_config(config).await?;
    backend.run_migrations().await?;
    Ok(Arc::new(backend))
}

/// Default on-disk location when no path is configured.
pub fn default_database_path() -> PathBuf {
    PathBuf::from("data").join("conversations.db")
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Audit event kinds written by the chat orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PersonaSwitch,
    Warning,
    Refusal,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PersonaSwitch => "persona_switch",
            Self::Warning => "warning",
            Self::Refusal => "refusal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub email: String,
    pub password_hash: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUserParams {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// A conversation owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Correlation id shared with AI Core. Unique across all sessions.
    pub ai_session_id: String,
    pub title: Option<String>,
    pub archived: bool,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSessionParams {
    pub title: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Present only for assistant messages.
    pub metadata: Option<VersionedMetadata>,
    pub is_mistake: bool,
    pub mistake_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One side of a turn, ready to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<VersionedMetadata>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>, metadata: VersionedMetadata) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            metadata: Some(metadata),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Token counts of a single assistant message, joined with its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUsageRow {
    pub session_id: Uuid,
    pub session_title: Option<String>,
    pub session_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with `DatabaseError::Constraint` when the e-mail is taken.
    async fn create_user(&self, params: &CreateUserParams) -> Result<UserRecord, DatabaseError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError>;
    async fn record_login(&self, id: Uuid) -> Result<(), DatabaseError>;
    async fn update_user(
        &self,
        id: Uuid,
        params: &UpdateUserParams,
    ) -> Result<Option<UserRecord>, DatabaseError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        user_id: Uuid,
        ai_session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord, DatabaseError>;
    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>, DatabaseError>;
    async fn get_session_by_ai_id(
        &self,
        ai_session_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;
    /// Most recently active first.
    async fn list_sessions(
        &self,
        user_id: Uuid,
        limit: i64,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>, DatabaseError>;
    async fn update_session(
        &self,
        id: Uuid,
        params: &UpdateSessionParams,
    ) -> Result<Option<SessionRecord>, DatabaseError>;
    /// Removes the session with its messages and events.
    async fn delete_session(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn delete_all_sessions(&self, user_id: Uuid) -> Result<u64, DatabaseError>;
    async fn session_owner(&self, id: Uuid) -> Result<Option<Uuid>, DatabaseError>;
    async fn session_belongs_to_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        Ok(self.session_owner(id).await? == Some(user_id))
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts the message and bumps the session's `message_count` and
    /// `last_active_at` in one transaction.
    async fn append_message(
        &self,
        session_id: Uuid,
        message: &NewMessage,
    ) -> Result<MessageRecord, DatabaseError>;
    /// Appends both sides of a chat turn atomically, in order.
    async fn append_turn(
        &self,
        session_id: Uuid,
        user: &NewMessage,
        assistant: &NewMessage,
    ) -> Result<(MessageRecord, MessageRecord), DatabaseError>;
    /// Creation order, ties broken by insertion sequence.
    async fn list_messages(
        &self,
        session_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;
    async fn get_message(&self, id: Uuid) -> Result<Option<MessageRecord>, DatabaseError>;
    /// Owner of the session the message belongs to.
    async fn message_owner(&self, id: Uuid) -> Result<Option<Uuid>, DatabaseError>;
    async fn mark_mistake(
        &self,
        id: Uuid,
        is_mistake: bool,
        note: Option<&str>,
    ) -> Result<Option<MessageRecord>, DatabaseError>;
    /// Newest first.
    async fn list_mistakes(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;
    async fn last_assistant_persona(
        &self,
        session_id: Uuid,
    ) -> Result<Option<String>, DatabaseError>;
    async fn list_token_usage(&self, user_id: Uuid) -> Result<Vec<TokenUsageRow>, DatabaseError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(
        &self,
        session_id: Uuid,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> Result<EventRecord, DatabaseError>;
    /// Oldest first.
    async fn list_events(&self, session_id: Uuid) -> Result<Vec<EventRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: UserStore + SessionStore + MessageStore + EventStore + Send + Sync {
    /// Bring the schema up to the head of the migration chain.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
