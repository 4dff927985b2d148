//! Request and response DTOs for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{MessageRecord, SessionRecord};

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: &'static str,
}

// --- Chat ---

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Local session to continue; a new one is created when absent.
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

// --- Sessions ---

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionRecord>,
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SessionDeletedResponse {
    pub status: &'static str,
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SessionsDeletedResponse {
    pub status: &'static str,
    pub deleted: u64,
}

// --- Mistakes ---

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct MarkMistakeRequest {
    #[serde(default = "default_true")]
    pub is_mistake: bool,
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MistakesQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MistakesListResponse {
    pub mistakes: Vec<MessageRecord>,
    pub total: usize,
}

// --- Analytics ---

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub session_id_1: Uuid,
    pub session_id_2: Uuid,
}

// --- Debug ---

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub session_id: Uuid,
    pub events: Vec<crate::db::EventRecord>,
    pub total: usize,
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
}
