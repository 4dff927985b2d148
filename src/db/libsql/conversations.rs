//! Sessions, messages and events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Value, params};
use uuid::Uuid;

use crate::db::{
    EventKind, EventRecord, EventStore, MessageRecord, MessageRole, MessageStore, NewMessage,
    SessionRecord, SessionStore, TokenUsageRow, UpdateSessionParams,
};
use crate::error::DatabaseError;

use super::columns::{METADATA_COLUMNS, MetadataColumns};
use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_i64, get_opt_text, get_text, opt_i64, opt_text,
    parse_timestamp, parse_uuid,
};

const SESSION_COLUMNS: &str =
    "id, user_id, ai_session_id, title, archived, message_count, created_at, last_active_at";

/// Index of the first metadata column in [`message_select`] rows.
const METADATA_OFFSET: i32 = 7;

fn message_columns() -> String {
    let metadata = METADATA_COLUMNS
        .iter()
        .map(|c| format!("m.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("m.id, m.session_id, m.role, m.content, m.is_mistake, m.mistake_note, m.created_at, {metadata}")
}

fn message_select() -> String {
    format!("SELECT {} FROM messages m", message_columns())
}

fn row_to_session_record(row: &libsql::Row) -> Result<SessionRecord, DatabaseError> {
    Ok(SessionRecord {
        id: parse_uuid(&get_text(row, 0), "session.id")?,
        user_id: parse_uuid(&get_text(row, 1), "session.user_id")?,
        ai_session_id: get_text(row, 2),
        title: get_opt_text(row, 3),
        archived: get_i64(row, 4) != 0,
        message_count: get_i64(row, 5),
        created_at: parse_timestamp(&get_text(row, 6))?,
        last_active_at: parse_timestamp(&get_text(row, 7))?,
    })
}

fn row_to_message_record(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let role_raw = get_text(row, 2);
    let role = MessageRole::from_db_value(&role_raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid message role '{}'", role_raw)))?;
    Ok(MessageRecord {
        id: parse_uuid(&get_text(row, 0), "message.id")?,
        session_id: parse_uuid(&get_text(row, 1), "message.session_id")?,
        role,
        content: get_text(row, 3),
        is_mistake: get_i64(row, 4) != 0,
        mistake_note: get_opt_text(row, 5),
        created_at: parse_timestamp(&get_text(row, 6))?,
        metadata: MetadataColumns::read(row, METADATA_OFFSET).into_domain(role)?,
    })
}

fn row_to_event_record(row: &libsql::Row) -> Result<EventRecord, DatabaseError> {
    let raw_payload = get_text(row, 3);
    let payload = if raw_payload.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&raw_payload).map_err(|e| DatabaseError::Serialization(e.to_string()))?
    };
    Ok(EventRecord {
        id: parse_uuid(&get_text(row, 0), "event.id")?,
        session_id: parse_uuid(&get_text(row, 1), "event.session_id")?,
        event_type: get_text(row, 2),
        payload,
        created_at: parse_timestamp(&get_text(row, 4))?,
    })
}

async fn fetch_session(conn: &Connection, id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?1"),
            params![id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_session_record(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_message(conn: &Connection, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
    let mut rows = conn
        .query(&format!("{} WHERE m.id = ?1", message_select()), params![id])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_message_record(&row)?)),
        None => Ok(None),
    }
}

/// Insert one message and bump its session. Caller owns the transaction.
async fn insert_message(
    conn: &Connection,
    session_id: &str,
    message: &NewMessage,
    created_at: DateTime<Utc>,
) -> Result<MessageRecord, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    let columns = MetadataColumns::from_domain(message.metadata.as_ref())?;
    let placeholders = (6..6 + METADATA_COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO messages (id, session_id, role, content, created_at, {}) \
         VALUES (?1, ?2, ?3, ?4, ?5, {})",
        METADATA_COLUMNS.join(", "),
        placeholders
    );

    let mut values = vec![
        Value::Text(id.clone()),
        Value::Text(session_id.to_string()),
        Value::Text(message.role.as_str().to_string()),
        Value::Text(message.content.clone()),
        Value::Text(fmt_ts(&created_at)),
    ];
    values.extend(columns.values());
    conn.execute(&sql, values).await?;

    let bumped = conn
        .execute(
            "UPDATE chat_sessions SET message_count = message_count + 1, last_active_at = ?2 \
             WHERE id = ?1",
            params![session_id, fmt_ts(&created_at)],
        )
        .await?;
    if bumped == 0 {
        return Err(DatabaseError::Query(format!("session {} does not exist", session_id)));
    }

    fetch_message(conn, &id)
        .await?
        .ok_or_else(|| DatabaseError::Query("failed to load created message".to_string()))
}

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn create_session(
        &self,
        user_id: Uuid,
        ai_session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO chat_sessions \
             (id, user_id, ai_session_id, title, archived, message_count, created_at, last_active_at) \
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)",
            params![id.as_str(), user_id.to_string(), ai_session_id, opt_text(title), now],
        )
        .await?;
        fetch_session(&conn, &id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created session".to_string()))
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        fetch_session(&conn, &id.to_string()).await
    }

    async fn get_session_by_ai_id(
        &self,
        ai_session_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE ai_session_id = ?1"),
                params![ai_session_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        limit: i64,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM chat_sessions \
                     WHERE user_id = ?1 AND (?3 = 1 OR archived = 0) \
                     ORDER BY last_active_at DESC, rowid DESC LIMIT ?2"
                ),
                params![user_id.to_string(), limit, i64::from(include_archived)],
            )
            .await?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(row_to_session_record(&row)?);
        }
        Ok(sessions)
    }

    async fn update_session(
        &self,
        id: Uuid,
        input: &UpdateSessionParams,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let id = id.to_string();
        conn.execute(
            "UPDATE chat_sessions SET \
               title = COALESCE(?2, title), \
               archived = COALESCE(?3, archived) \
             WHERE id = ?1",
            params![
                id.as_str(),
                opt_text(input.title.as_deref()),
                opt_i64(input.archived.map(i64::from)),
            ],
        )
        .await?;
        fetch_session(&conn, &id).await
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let id = id.to_string();
        conn.execute("BEGIN", ()).await?;
        let delete_result = async {
            conn.execute("DELETE FROM events WHERE session_id = ?1", params![id.as_str()])
                .await?;
            conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id.as_str()])
                .await?;
            let removed = conn
                .execute("DELETE FROM chat_sessions WHERE id = ?1", params![id.as_str()])
                .await?;
            Ok::<bool, DatabaseError>(removed > 0)
        }
        .await;

        match delete_result {
            Ok(removed) => {
                conn.execute("COMMIT", ()).await?;
                Ok(removed)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn delete_all_sessions(&self, user_id: Uuid) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let user_id = user_id.to_string();
        conn.execute("BEGIN", ()).await?;
        let delete_result = async {
            conn.execute(
                "DELETE FROM events WHERE session_id IN \
                 (SELECT id FROM chat_sessions WHERE user_id = ?1)",
                params![user_id.as_str()],
            )
            .await?;
            conn.execute(
                "DELETE FROM messages WHERE session_id IN \
                 (SELECT id FROM chat_sessions WHERE user_id = ?1)",
                params![user_id.as_str()],
            )
            .await?;
            let removed = conn
                .execute(
                    "DELETE FROM chat_sessions WHERE user_id = ?1",
                    params![user_id.as_str()],
                )
                .await?;
            Ok::<u64, DatabaseError>(removed)
        }
        .await;

        match delete_result {
            Ok(removed) => {
                conn.execute("COMMIT", ()).await?;
                Ok(removed)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn session_owner(&self, id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT user_id FROM chat_sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_uuid(&get_text(&row, 0), "session.user_id")?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn append_message(
        &self,
        session_id: Uuid,
        message: &NewMessage,
    ) -> Result<MessageRecord, DatabaseError> {
        let conn = self.connect().await?;
        let session_id = session_id.to_string();
        conn.execute("BEGIN", ()).await?;
        let insert_result = insert_message(&conn, &session_id, message, Utc::now()).await;

        match insert_result {
            Ok(record) => {
                conn.execute("COMMIT", ()).await?;
                Ok(record)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn append_turn(
        &self,
        session_id: Uuid,
        user: &NewMessage,
        assistant: &NewMessage,
    ) -> Result<(MessageRecord, MessageRecord), DatabaseError> {
        let conn = self.connect().await?;
        let session_id = session_id.to_string();
        conn.execute("BEGIN", ()).await?;
        let turn_result = async {
            let user_record = insert_message(&conn, &session_id, user, Utc::now()).await?;
            let assistant_record = insert_message(&conn, &session_id, assistant, Utc::now()).await?;
            Ok::<_, DatabaseError>((user_record, assistant_record))
        }
        .await;

        match turn_result {
            Ok(records) => {
                conn.execute("COMMIT", ()).await?;
                Ok(records)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn list_messages(
        &self,
        session_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        // Newest `limit` rows, returned oldest first.
        let sql = format!(
            "SELECT * FROM ( \
               SELECT {}, m.rowid AS seq FROM messages m WHERE m.session_id = ?1 \
               ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2 \
             ) ORDER BY created_at ASC, seq ASC",
            message_columns()
        );
        let mut rows = conn
            .query(&sql, params![session_id.to_string(), limit.unwrap_or(-1)])
            .await?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message_record(&row)?);
        }
        Ok(messages)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<MessageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        fetch_message(&conn, &id.to_string()).await
    }

    async fn message_owner(&self, id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT s.user_id FROM messages m \
                 JOIN chat_sessions s ON s.id = m.session_id \
                 WHERE m.id = ?1",
                params![id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_uuid(&get_text(&row, 0), "session.user_id")?)),
            None => Ok(None),
        }
    }

    async fn mark_mistake(
        &self,
        id: Uuid,
        is_mistake: bool,
        note: Option<&str>,
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let id = id.to_string();
        let updated = conn
            .execute(
                "UPDATE messages SET is_mistake = ?2, mistake_note = ?3 WHERE id = ?1",
                params![id.as_str(), i64::from(is_mistake), opt_text(note)],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        fetch_message(&conn, &id).await
    }

    async fn list_mistakes(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let sql = format!(
            "{} JOIN chat_sessions s ON s.id = m.session_id \
             WHERE s.user_id = ?1 AND m.is_mistake = 1 \
             ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2",
            message_select()
        );
        let mut rows = conn.query(&sql, params![user_id.to_string(), limit]).await?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message_record(&row)?);
        }
        Ok(messages)
    }

    async fn last_assistant_persona(
        &self,
        session_id: Uuid,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT persona FROM messages \
                 WHERE session_id = ?1 AND role = 'assistant' AND persona IS NOT NULL \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![session_id.to_string()],
            )
            .await?;
        Ok(rows.next().await?.and_then(|row| get_opt_text(&row, 0)))
    }

    async fn list_token_usage(&self, user_id: Uuid) -> Result<Vec<TokenUsageRow>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT m.session_id, s.title, s.created_at, m.created_at, m.prompt_tokens, m.completion_tokens \
                 FROM messages m JOIN chat_sessions s ON s.id = m.session_id \
                 WHERE s.user_id = ?1 AND m.role = 'assistant' \
                 ORDER BY m.created_at ASC, m.rowid ASC",
                params![user_id.to_string()],
            )
            .await?;
        let mut usage = Vec::new();
        while let Some(row) = rows.next().await? {
            usage.push(TokenUsageRow {
                session_id: parse_uuid(&get_text(&row, 0), "message.session_id")?,
                session_title: get_opt_text(&row, 1),
                session_created_at: parse_timestamp(&get_text(&row, 2))?,
                created_at: parse_timestamp(&get_text(&row, 3))?,
                prompt_tokens: get_opt_i64(&row, 4),
                completion_tokens: get_opt_i64(&row, 5),
            });
        }
        Ok(usage)
    }
}

#[async_trait]
impl EventStore for LibSqlBackend {
    async fn append_event(
        &self,
        session_id: Uuid,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> Result<EventRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let payload_json =
            serde_json::to_string(payload).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO events (id, session_id, event_type, payload_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                session_id.to_string(),
                kind.as_str(),
                payload_json,
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        let mut rows = conn
            .query(
                "SELECT id, session_id, event_type, payload_json, created_at FROM events WHERE id = ?1",
                params![id.as_str()],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created event".to_string()))?;
        row_to_event_record(&row)
    }

    async fn list_events(&self, session_id: Uuid) -> Result<Vec<EventRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, session_id, event_type, payload_json, created_at FROM events \
                 WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![session_id.to_string()],
            )
            .await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(row_to_event_record(&row)?);
        }
        Ok(events)
    }
}
