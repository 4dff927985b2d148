//! Service layer.
//!
//! Every operation takes the caller's [`AuthUser`] and checks ownership of
//! whatever it touches before reading or writing. Handlers in
//! `channels::web` only translate between HTTP and these calls.

pub mod accounts;
pub mod orchestrator;
pub mod reporting;
pub mod sessions;

pub use accounts::{AccountService, AuthResponse};
pub use orchestrator::{ChatTurn, ConversationOrchestrator, HistoryEntry, SessionHistory};
pub use reporting::{ReportingService, SessionComparison, SessionReplay, TokenAnalytics};
pub use sessions::SessionService;

use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{Database, MessageRecord, MessageStore, SessionRecord, SessionStore};
use crate::error::ServiceError;

/// Load a session the caller owns.
///
/// An unknown id is `NotFound`; a session owned by someone else is
/// `Forbidden`. `what` names the side in error messages ("session",
/// "session 1", ...).
pub(crate) async fn owned_session(
    db: &dyn Database,
    user: &AuthUser,
    session_id: Uuid,
    what: &str,
) -> Result<SessionRecord, ServiceError> {
    let session = db
        .get_session(session_id)
        .await?
        .ok_or_else(|| ServiceError::not_found(what))?;
    if session.user_id != user.user_id() {
        tracing::warn!(
            %session_id,
            user_id = %user.user_id(),
            "Session ownership check failed"
        );
        return Err(ServiceError::forbidden(what));
    }
    Ok(session)
}

/// Load a message whose session the caller owns.
pub(crate) async fn owned_message(
    db: &dyn Database,
    user: &AuthUser,
    message_id: Uuid,
) -> Result<MessageRecord, ServiceError> {
    let owner = db
        .message_owner(message_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("message"))?;
    if owner != user.user_id() {
        tracing::warn!(
            %message_id,
            user_id = %user.user_id(),
            "Message ownership check failed"
        );
        return Err(ServiceError::forbidden("message"));
    }
    db.get_message(message_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("message"))
}

/// Clamp an optional caller-supplied page size into `1..=max`.
pub(crate) fn page_limit(requested: Option<i64>, default: i64, max: i64) -> i64 {
    requested.unwrap_or(default).clamp(1, max)
}
