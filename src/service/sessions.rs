//! Session management, mistake tracking and debug views.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{
    Database, EventRecord, EventStore, MessageRecord, MessageRole, MessageStore, SessionRecord,
    SessionStore, UpdateSessionParams,
};
use crate::error::{ServiceError, ValidationError};
use crate::metadata::VersionedMetadata;
use crate::service::{owned_message, owned_session, page_limit};

pub const DEFAULT_SESSION_PAGE: i64 = 20;
pub const MAX_SESSION_PAGE: i64 = 100;
pub const DEFAULT_MISTAKE_PAGE: i64 = 50;
pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_MISTAKE_NOTE_CHARS: usize = 500;

/// Stored metadata of one message, for debugging upstream contracts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetadataView {
    pub message_id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub metadata: Option<VersionedMetadata>,
}

pub struct SessionService {
    db: Arc<dyn Database>,
}

impl SessionService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Register an empty session with a fresh correlation id.
    pub async fn create(
        &self,
        user: &AuthUser,
        title: Option<&str>,
    ) -> Result<SessionRecord, ServiceError> {
        let title = title.map(validate_title).transpose()?;
        let ai_session_id = Uuid::new_v4().to_string();
        let session = self
            .db
            .create_session(user.user_id(), &ai_session_id, title.as_deref())
            .await?;
        tracing::info!(session_id = %session.id, user_id = %user.user_id(), "Session created");
        Ok(session)
    }

    pub async fn get(&self, user: &AuthUser, id: Uuid) -> Result<SessionRecord, ServiceError> {
        owned_session(self.db.as_ref(), user, id, "session").await
    }

    pub async fn list(
        &self,
        user: &AuthUser,
        limit: Option<i64>,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>, ServiceError> {
        let limit = page_limit(limit, DEFAULT_SESSION_PAGE, MAX_SESSION_PAGE);
        Ok(self
            .db
            .list_sessions(user.user_id(), limit, include_archived)
            .await?)
    }

    pub async fn update(
        &self,
        user: &AuthUser,
        id: Uuid,
        title: Option<&str>,
        archived: Option<bool>,
    ) -> Result<SessionRecord, ServiceError> {
        let params = UpdateSessionParams {
            title: title.map(validate_title).transpose()?,
            archived,
        };
        owned_session(self.db.as_ref(), user, id, "session").await?;
        self.db
            .update_session(id, &params)
            .await?
            .ok_or_else(|| ServiceError::not_found("session"))
    }

    pub async fn delete(&self, user: &AuthUser, id: Uuid) -> Result<(), ServiceError> {
        owned_session(self.db.as_ref(), user, id, "session").await?;
        if !self.db.delete_session(id).await? {
            return Err(ServiceError::not_found("session"));
        }
        tracing::info!(session_id = %id, user_id = %user.user_id(), "Session deleted");
        Ok(())
    }

    /// Returns how many sessions were removed.
    pub async fn delete_all(&self, user: &AuthUser) -> Result<u64, ServiceError> {
        let deleted = self.db.delete_all_sessions(user.user_id()).await?;
        tracing::info!(user_id = %user.user_id(), deleted, "All sessions deleted");
        Ok(deleted)
    }

    pub async fn mark_mistake(
        &self,
        user: &AuthUser,
        message_id: Uuid,
        is_mistake: bool,
        note: Option<&str>,
    ) -> Result<MessageRecord, ServiceError> {
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        if let Some(note) = note
            && note.chars().count() > MAX_MISTAKE_NOTE_CHARS
        {
            return Err(ValidationError::new(
                "note",
                format!("must be at most {MAX_MISTAKE_NOTE_CHARS} characters"),
            )
            .into());
        }
        owned_message(self.db.as_ref(), user, message_id).await?;
        self.db
            .mark_mistake(message_id, is_mistake, note)
            .await?
            .ok_or_else(|| ServiceError::not_found("message"))
    }

    pub async fn list_mistakes(
        &self,
        user: &AuthUser,
        limit: Option<i64>,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        let limit = page_limit(limit, DEFAULT_MISTAKE_PAGE, MAX_SESSION_PAGE);
        Ok(self.db.list_mistakes(user.user_id(), limit).await?)
    }

    pub async fn message_metadata(
        &self,
        user: &AuthUser,
        message_id: Uuid,
    ) -> Result<MessageMetadataView, ServiceError> {
        let message = owned_message(self.db.as_ref(), user, message_id).await?;
        Ok(MessageMetadataView {
            message_id: message.id,
            session_id: message.session_id,
            role: message.role,
            metadata: message.metadata,
        })
    }

    pub async fn session_events(
        &self,
        user: &AuthUser,
        session_id: Uuid,
    ) -> Result<Vec<EventRecord>, ServiceError> {
        owned_session(self.db.as_ref(), user, session_id, "session").await?;
        Ok(self.db.list_events(session_id).await?)
    }
}

fn validate_title(raw: &str) -> Result<String, ValidationError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ValidationError::new("title", "must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ValidationError::new(
            "title",
            format!("must be at most {MAX_TITLE_CHARS} characters"),
        ));
    }
    Ok(title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::db::{EventKind, NewMessage};
    use crate::metadata::reconcile_payload;
    use crate::testing::{TestBackend, create_test_user, setup_backend};

    struct Fixture {
        _db: TestBackend,
        service: SessionService,
        db: Arc<dyn Database>,
        alice: AuthUser,
        bob: AuthUser,
    }

    async fn fixture() -> Fixture {
        let backend = setup_backend().await;
        let alice = create_test_user(&backend, "alice@example.com").await;
        let bob = create_test_user(&backend, "bob@example.com").await;
        let db: Arc<dyn Database> = Arc::new(backend.backend.clone());
        Fixture {
            service: SessionService::new(Arc::clone(&db)),
            db,
            _db: backend,
            alice: AuthUser::new(alice, "alice@example.com"),
            bob: AuthUser::new(bob, "bob@example.com"),
        }
    }

    #[test]
    fn titles_are_trimmed_and_bounded() {
        assert_eq!(validate_title("  Trip plan ").unwrap(), "Trip plan");
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"x".repeat(255)).is_ok());
        assert!(validate_title(&"x".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn create_generates_a_correlation_id() {
        let f = fixture().await;
        let a = f.service.create(&f.alice, Some(" Notes ")).await.expect("create");
        let b = f.service.create(&f.alice, None).await.expect("create");
        assert_eq!(a.title.as_deref(), Some("Notes"));
        assert!(Uuid::parse_str(&a.ai_session_id).is_ok());
        assert_ne!(a.ai_session_id, b.ai_session_id);
        assert!(matches!(
            f.service.create(&f.alice, Some("")).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn other_users_cannot_touch_a_session() {
        let f = fixture().await;
        let session = f.service.create(&f.alice, None).await.expect("create");

        assert!(matches!(
            f.service.get(&f.bob, session.id).await,
            Err(ServiceError::Forbidden { .. })
        ));
        assert!(matches!(
            f.service.update(&f.bob, session.id, Some("mine now"), None).await,
            Err(ServiceError::Forbidden { .. })
        ));
        assert!(matches!(
            f.service.delete(&f.bob, session.id).await,
            Err(ServiceError::Forbidden { .. })
        ));
        assert!(matches!(
            f.service.session_events(&f.bob, session.id).await,
            Err(ServiceError::Forbidden { .. })
        ));
        assert!(matches!(
            f.service.get(&f.bob, Uuid::new_v4()).await,
            Err(ServiceError::NotFound { .. })
        ));
        assert_eq!(f.service.get(&f.alice, session.id).await.unwrap().id, session.id);
    }

    #[tokio::test]
    async fn update_archive_and_list() {
        let f = fixture().await;
        let session = f.service.create(&f.alice, None).await.expect("create");
        let updated = f
            .service
            .update(&f.alice, session.id, Some("Renamed"), Some(true))
            .await
            .expect("update");
        assert_eq!(updated.title.as_deref(), Some("Renamed"));
        assert!(updated.archived);

        assert!(f.service.list(&f.alice, None, false).await.unwrap().is_empty());
        assert_eq!(f.service.list(&f.alice, None, true).await.unwrap().len(), 1);
        assert!(f.service.list(&f.bob, None, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_only_removes_own_sessions() {
        let f = fixture().await;
        f.service.create(&f.alice, None).await.expect("create");
        f.service.create(&f.alice, None).await.expect("create");
        let kept = f.service.create(&f.bob, None).await.expect("create");

        assert_eq!(f.service.delete_all(&f.alice).await.unwrap(), 2);
        assert_eq!(f.service.delete_all(&f.alice).await.unwrap(), 0);
        assert!(f.service.get(&f.bob, kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn mistakes_are_ownership_checked() {
        let f = fixture().await;
        let session = f.service.create(&f.alice, None).await.expect("create");
        let (_, reply) = f
            .db
            .append_turn(
                session.id,
                &NewMessage::user("2+2?"),
                &NewMessage::assistant("5", reconcile_payload(&json!({"persona": "Tutor"}))),
            )
            .await
            .expect("turn");

        assert!(matches!(
            f.service.mark_mistake(&f.bob, reply.id, true, None).await,
            Err(ServiceError::Forbidden { .. })
        ));
        assert!(matches!(
            f.service.mark_mistake(&f.alice, Uuid::new_v4(), true, None).await,
            Err(ServiceError::NotFound { .. })
        ));
        let too_long = "n".repeat(MAX_MISTAKE_NOTE_CHARS + 1);
        assert!(matches!(
            f.service.mark_mistake(&f.alice, reply.id, true, Some(&too_long)).await,
            Err(ServiceError::Validation(_))
        ));

        let marked = f
            .service
            .mark_mistake(&f.alice, reply.id, true, Some(" wrong sum "))
            .await
            .expect("mark");
        assert!(marked.is_mistake);
        assert_eq!(marked.mistake_note.as_deref(), Some("wrong sum"));

        let listed = f.service.list_mistakes(&f.alice, None).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(f.service.list_mistakes(&f.bob, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn debug_views() {
        let f = fixture().await;
        let session = f.service.create(&f.alice, None).await.expect("create");
        let (question, reply) = f
            .db
            .append_turn(
                session.id,
                &NewMessage::user("hi"),
                &NewMessage::assistant(
                    "hello",
                    reconcile_payload(&json!({"persona_used": "Casual + Normal", "needs_knowledge": false})),
                ),
            )
            .await
            .expect("turn");
        f.db
            .append_event(session.id, EventKind::Warning, &json!({"warnings": ["w"]}))
            .await
            .expect("event");

        let view = f.service.message_metadata(&f.alice, reply.id).await.expect("view");
        let meta = view.metadata.expect("assistant metadata");
        assert_eq!(meta.persona_label.as_deref(), Some("Casual + Normal"));
        assert_eq!(meta.needs_knowledge, Some(false));
        assert_eq!(meta.context_clarity, None);

        let user_view = f.service.message_metadata(&f.alice, question.id).await.expect("view");
        assert_eq!(user_view.metadata, None);

        assert!(matches!(
            f.service.message_metadata(&f.bob, reply.id).await,
            Err(ServiceError::Forbidden { .. })
        ));

        let events = f.service.session_events(&f.alice, session.id).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "warning");
    }

    #[tokio::test]
    async fn deleting_twice_reports_not_found() {
        let f = fixture().await;
        let session = f.service.create(&f.alice, None).await.expect("create");
        f.service.delete(&f.alice, session.id).await.expect("delete");
        assert!(matches!(
            f.service.delete(&f.alice, session.id).await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(f.db.get_session(session.id).await.unwrap().is_none());
    }
}
