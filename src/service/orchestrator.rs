//! One chat turn, end to end.
//!
//! resolve session → call AI Core → check and reconcile metadata → persist
//! both sides → append audit events → answer. The upstream call is the only
//! suspending step that leaves the process; nothing is written until it has
//! returned well-formed metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{
    Database, EventKind, EventStore, MessageRecord, MessageRole, MessageStore, NewMessage,
    SessionRecord, SessionStore,
};
use crate::error::{ServiceError, ValidationError};
use crate::metadata::{VersionedMetadata, reconcile_payload, validate_metadata};
use crate::service::{owned_session, page_limit};
use crate::upstream::{ChatUpstream, UpstreamHistoryEntry};

pub const DEFAULT_HISTORY_PAGE: i64 = 100;
pub const MAX_HISTORY_PAGE: i64 = 1_000;

/// The answer to one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub session_id: Uuid,
    pub ai_session_id: String,
    pub user_message_id: Uuid,
    pub message_id: Uuid,
    pub response: String,
    pub metadata: VersionedMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Local,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Absent for entries that only exist upstream.
    pub id: Option<Uuid>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<VersionedMetadata>,
    pub is_mistake: bool,
    pub mistake_note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<MessageRecord> for HistoryEntry {
    fn from(message: MessageRecord) -> Self {
        Self {
            id: Some(message.id),
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            is_mistake: message.is_mistake,
            mistake_note: message.mistake_note,
            created_at: Some(message.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHistory {
    pub session_id: Uuid,
    pub title: Option<String>,
    pub source: HistorySource,
    pub messages: Vec<HistoryEntry>,
}

pub struct ConversationOrchestrator {
    db: Arc<dyn Database>,
    upstream: Arc<dyn ChatUpstream>,
    upstream_history_limit: u32,
}

impl ConversationOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        upstream: Arc<dyn ChatUpstream>,
        upstream_history_limit: u32,
    ) -> Self {
        Self {
            db,
            upstream,
            upstream_history_limit,
        }
    }

    /// Run one turn, continuing `session_id` or starting a new session.
    pub async fn send_message(
        &self,
        user: &AuthUser,
        message: &str,
        session_id: Option<Uuid>,
    ) -> Result<ChatTurn, ServiceError> {
        if message.trim().is_empty() {
            return Err(ValidationError::new("message", "must not be empty").into());
        }

        let existing = match session_id {
            Some(id) => Some(owned_session(self.db.as_ref(), user, id, "session").await?),
            None => None,
        };
        tracing::info!(
            user_id = %user.user_id(),
            session_id = ?existing.as_ref().map(|s| s.id),
            message_length = message.len(),
            "Processing chat turn"
        );

        let forwarded = existing.as_ref().map(|s| s.ai_session_id.as_str());
        let reply = self
            .upstream
            .send_message(message, forwarded)
            .await
            .map_err(|e| {
                tracing::warn!(user_id = %user.user_id(), error = %e, "Chat turn failed upstream");
                ServiceError::Upstream(e)
            })?;

        if let Err(e) = validate_metadata(&reply.metadata) {
            tracing::warn!(
                user_id = %user.user_id(),
                ai_session_id = %reply.session_id,
                field = %e.field,
                reason = %e.reason,
                "AI Core returned malformed metadata; turn not persisted"
            );
            return Err(ServiceError::UpstreamValidation(e));
        }
        let metadata = reconcile_payload(&reply.metadata);

        let session = match existing {
            Some(session) => {
                if session.ai_session_id != reply.session_id {
                    tracing::warn!(
                        session_id = %session.id,
                        ai_session_id = %reply.session_id,
                        "AI Core answered under a different session id"
                    );
                }
                session
            }
            None => self.resolve_new_session(user, &reply.session_id).await?,
        };

        let previous_persona = self.db.last_assistant_persona(session.id).await?;
        let (user_message, assistant_message) = self
            .db
            .append_turn(
                session.id,
                &NewMessage::user(message),
                &NewMessage::assistant(reply.response.clone(), metadata.clone()),
            )
            .await?;

        self.record_events(session.id, previous_persona.as_deref(), &assistant_message.id, &metadata)
            .await;

        tracing::info!(
            session_id = %session.id,
            message_id = %assistant_message.id,
            contract = ?metadata.contract,
            persona = ?metadata.persona_label,
            "Chat turn complete"
        );

        Ok(ChatTurn {
            session_id: session.id,
            ai_session_id: session.ai_session_id,
            user_message_id: user_message.id,
            message_id: assistant_message.id,
            response: reply.response,
            metadata,
        })
    }

    /// Stored messages in creation order, falling back to AI Core when the
    /// session has none locally.
    pub async fn history(
        &self,
        user: &AuthUser,
        session_id: Uuid,
        limit: Option<i64>,
    ) -> Result<SessionHistory, ServiceError> {
        let session = owned_session(self.db.as_ref(), user, session_id, "session").await?;
        let limit = page_limit(limit, DEFAULT_HISTORY_PAGE, MAX_HISTORY_PAGE);
        let messages = self.db.list_messages(session.id, Some(limit)).await?;

        if !messages.is_empty() {
            return Ok(SessionHistory {
                session_id: session.id,
                title: session.title,
                source: HistorySource::Local,
                messages: messages.into_iter().map(HistoryEntry::from).collect(),
            });
        }

        let messages = self.upstream_history(&session).await;
        Ok(SessionHistory {
            session_id: session.id,
            title: session.title,
            source: HistorySource::Upstream,
            messages,
        })
    }

    /// Find the session AI Core just opened, or register it for `user`.
    async fn resolve_new_session(
        &self,
        user: &AuthUser,
        ai_session_id: &str,
    ) -> Result<SessionRecord, ServiceError> {
        if let Some(session) = self.db.get_session_by_ai_id(ai_session_id).await? {
            if session.user_id == user.user_id() {
                return Ok(session);
            }
            tracing::error!(
                session_id = %session.id,
                user_id = %user.user_id(),
                "AI Core returned a session id registered to another user"
            );
            return Err(ServiceError::Internal(
                "upstream session id collision".to_string(),
            ));
        }
        let session = self
            .db
            .create_session(user.user_id(), ai_session_id, None)
            .await?;
        tracing::info!(session_id = %session.id, user_id = %user.user_id(), "Session created from chat");
        Ok(session)
    }

    /// Audit trail for the turn. The turn itself is already committed, so
    /// failures here are logged rather than returned.
    async fn record_events(
        &self,
        session_id: Uuid,
        previous_persona: Option<&str>,
        message_id: &Uuid,
        metadata: &VersionedMetadata,
    ) {
        let mut events = Vec::new();
        if let (Some(from), Some(to)) = (previous_persona, metadata.persona_label.as_deref())
            && from != to
        {
            events.push((
                EventKind::PersonaSwitch,
                json!({"from": from, "to": to, "message_id": message_id}),
            ));
        }
        if !metadata.warnings.is_empty() {
            events.push((
                EventKind::Warning,
                json!({"warnings": metadata.warnings, "message_id": message_id}),
            ));
        }
        if metadata.should_refuse == Some(true) {
            events.push((
                EventKind::Refusal,
                json!({"message_id": message_id, "context_type": metadata.context_type}),
            ));
        }

        for (kind, payload) in events {
            if let Err(e) = self.db.append_event(session_id, kind, &payload).await {
                tracing::error!(
                    %session_id,
                    %message_id,
                    event = kind.as_str(),
                    error = %e,
                    "Failed to record event"
                );
            }
        }
    }

    async fn upstream_history(&self, session: &SessionRecord) -> Vec<HistoryEntry> {
        match self
            .upstream
            .get_history(&session.ai_session_id, self.upstream_history_limit)
            .await
        {
            Ok(history) => history
                .messages
                .into_iter()
                .filter_map(upstream_entry)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Upstream history unavailable; returning empty history"
                );
                Vec::new()
            }
        }
    }
}

fn upstream_entry(entry: UpstreamHistoryEntry) -> Option<HistoryEntry> {
    let Some(role) = MessageRole::from_db_value(&entry.role) else {
        tracing::debug!(role = %entry.role, "Skipping upstream history entry with unknown role");
        return None;
    };
    let metadata = match role {
        MessageRole::Assistant => Some(reconcile_payload(&entry.metadata)),
        MessageRole::User => None,
    };
    let created_at = entry
        .created_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc));
    Some(HistoryEntry {
        id: None,
        role,
        content: entry.content,
        metadata,
        is_mistake: false,
        mistake_note: None,
        created_at,
    })
}
