//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use uuid::Uuid;

use crate::db::libsql::LibSqlBackend;
use crate::db::{CreateUserParams, Database, UserStore};
use crate::error::UpstreamError;
use crate::upstream::{ChatUpstream, UpstreamHistory, UpstreamReply};

/// A migrated libSQL database living in a temp directory.
///
/// The directory is removed when this is dropped, so keep it alive for the
/// whole test.
pub(crate) struct TestBackend {
    pub backend: LibSqlBackend,
    _tmpdir: TempDir,
}

impl std::ops::Deref for TestBackend {
    type Target = LibSqlBackend;

    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

pub(crate) async fn setup_backend() -> TestBackend {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let backend = LibSqlBackend::new_local(&tmpdir.path().join("test.db"))
        .await
        .expect("open backend");
    backend.run_migrations().await.expect("migrate");
    TestBackend {
        backend,
        _tmpdir: tmpdir,
    }
}

pub(crate) async fn create_test_user(db: &LibSqlBackend, email: &str) -> Uuid {
    db.create_user(&CreateUserParams {
        email: email.to_string(),
        password_hash: "pbkdf2-sha256$1$c2FsdA$aGFzaA".to_string(),
        name: "Test User".to_string(),
    })
    .await
    .expect("create user")
    .id
}

/// What the fake should answer to the next `send_message`.
pub(crate) enum Scripted {
    Reply {
        response: String,
        session_id: String,
        metadata: Value,
    },
    Fail(UpstreamError),
}

impl Scripted {
    pub fn reply(session_id: &str, response: &str, metadata: Value) -> Self {
        Self::Reply {
            response: response.to_string(),
            session_id: session_id.to_string(),
            metadata,
        }
    }
}

/// Upstream double that plays back scripted replies and records requests.
#[derive(Default)]
pub(crate) struct FakeUpstream {
    replies: Mutex<VecDeque<Scripted>>,
    history: Mutex<Option<Result<UpstreamHistory, UpstreamError>>>,
    sent: Mutex<Vec<(String, Option<String>)>>,
    closed: Mutex<u32>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, scripted: Scripted) {
        self.replies.lock().unwrap().push_back(scripted);
    }

    pub fn set_history(&self, history: Result<UpstreamHistory, UpstreamError>) {
        *self.history.lock().unwrap() = Some(history);
    }

    /// `(message, forwarded session id)` for every call so far.
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatUpstream for FakeUpstream {
    async fn send_message(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<UpstreamReply, UpstreamError> {
        self.sent
            .lock()
            .unwrap()
            .push((message.to_string(), session_id.map(str::to_string)));
        match self.replies.lock().unwrap().pop_front() {
            Some(Scripted::Reply {
                response,
                session_id,
                metadata,
            }) => Ok(UpstreamReply {
                response,
                session_id,
                metadata,
            }),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(UpstreamError::Protocol {
                status: None,
                detail: "no scripted reply".to_string(),
            }),
        }
    }

    async fn get_history(
        &self,
        session_id: &str,
        _limit: u32,
    ) -> Result<UpstreamHistory, UpstreamError> {
        match self.history.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(UpstreamHistory {
                session_id: Some(session_id.to_string()),
                messages: Vec::new(),
            }),
        }
    }

    async fn close(&self) -> bool {
        let mut closed = self.closed.lock().unwrap();
        *closed += 1;
        *closed == 1
    }
}
