//! Schema migration chain for the libSQL backend.
//!
//! The schema is a strictly linear chain of additive steps. Each step names
//! its predecessor and lists the changes it makes; the reverse operation is
//! derived from that list, so every step can be undone exactly. Applied step
//! ids are recorded in `schema_migrations` and checked against the chain on
//! every startup.
//!
//! Columns are never dropped when superseded: rows written under older
//! AI Core contracts keep their legacy values and read new columns as NULL.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use libsql::{Connection, params};

use crate::error::{DatabaseError, MigrationError};

use super::libsql::{fmt_ts, get_text};

/// One additive change and, implicitly, its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable {
        table: &'static str,
        columns: &'static str,
    },
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    CreateIndex {
        name: &'static str,
        table: &'static str,
        columns: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStep {
    pub id: &'static str,
    pub predecessor: Option<&'static str>,
    pub description: &'static str,
    pub changes: &'static [SchemaChange],
}

/// Applied-state of one step, as reported by `migrate status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: &'static str,
    pub description: &'static str,
    pub applied: bool,
}

pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        id: "0000_base_tables",
        predecessor: None,
        description: "users, chat sessions, messages and events",
        changes: &[
            SchemaChange::CreateTable {
                table: "users",
                columns: "id TEXT PRIMARY KEY, \
                          email TEXT NOT NULL UNIQUE, \
                          password_hash TEXT NOT NULL, \
                          name TEXT NOT NULL, \
                          avatar_url TEXT, \
                          created_at TEXT NOT NULL, \
                          last_login_at TEXT",
            },
            SchemaChange::CreateTable {
                table: "chat_sessions",
                columns: "id TEXT PRIMARY KEY, \
                          user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE, \
                          ai_session_id TEXT NOT NULL UNIQUE, \
                          title TEXT, \
                          archived INTEGER NOT NULL DEFAULT 0, \
                          message_count INTEGER NOT NULL DEFAULT 0, \
                          created_at TEXT NOT NULL, \
                          last_active_at TEXT NOT NULL",
            },
            SchemaChange::CreateTable {
                table: "messages",
                columns: "id TEXT PRIMARY KEY, \
                          session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE, \
                          role TEXT NOT NULL CHECK (role IN ('user', 'assistant')), \
                          content TEXT NOT NULL, \
                          persona TEXT, \
                          context_type TEXT, \
                          confidence REAL, \
                          model_name TEXT, \
                          prompt_tokens INTEGER, \
                          completion_tokens INTEGER, \
                          created_at TEXT NOT NULL",
            },
            SchemaChange::CreateTable {
                table: "events",
                columns: "id TEXT PRIMARY KEY, \
                          session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE, \
                          event_type TEXT NOT NULL, \
                          payload_json TEXT NOT NULL DEFAULT '{}', \
                          created_at TEXT NOT NULL",
            },
            SchemaChange::CreateIndex {
                name: "idx_chat_sessions_user_activity",
                table: "chat_sessions",
                columns: "user_id, last_active_at",
            },
            SchemaChange::CreateIndex {
                name: "idx_messages_session_created",
                table: "messages",
                columns: "session_id, created_at",
            },
            SchemaChange::CreateIndex {
                name: "idx_events_session_created",
                table: "events",
                columns: "session_id, created_at",
            },
        ],
    },
    MigrationStep {
        id: "0001_mistake_tracking",
        predecessor: Some("0000_base_tables"),
        description: "user-annotated mistake flag and note on messages",
        changes: &[
            SchemaChange::AddColumn {
                table: "messages",
                column: "is_mistake",
                definition: "INTEGER NOT NULL DEFAULT 0",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "mistake_note",
                definition: "TEXT",
            },
        ],
    },
    MigrationStep {
        id: "0002_tone_behavior",
        predecessor: Some("0001_mistake_tracking"),
        description: "v2.0 tone and behavior labels",
        changes: &[
            SchemaChange::AddColumn {
                table: "messages",
                column: "tone",
                definition: "TEXT",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "behavior",
                definition: "TEXT",
            },
        ],
    },
    MigrationStep {
        id: "0003_signal_strength",
        predecessor: Some("0002_tone_behavior"),
        description: "v2.1 signal strength, context clarity and knowledge need",
        changes: &[
            SchemaChange::AddColumn {
                table: "messages",
                column: "signal_strength",
                definition: "REAL CHECK (signal_strength IS NULL OR (signal_strength >= 0 AND signal_strength <= 1))",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "context_clarity",
                definition: "INTEGER CHECK (context_clarity IS NULL OR context_clarity IN (0, 1))",
            },
            // No default: rows from older contracts must read as unknown.
            SchemaChange::AddColumn {
                table: "messages",
                column: "needs_knowledge",
                definition: "INTEGER CHECK (needs_knowledge IS NULL OR needs_knowledge IN (0, 1))",
            },
        ],
    },
    MigrationStep {
        id: "0004_metadata_provenance",
        predecessor: Some("0003_signal_strength"),
        description: "validation outcome, warnings, content metrics, refusal flag and contract version",
        changes: &[
            SchemaChange::AddColumn {
                table: "messages",
                column: "valid",
                definition: "INTEGER CHECK (valid IS NULL OR valid IN (0, 1))",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "warnings_json",
                definition: "TEXT",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "content_metrics_json",
                definition: "TEXT",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "should_refuse",
                definition: "INTEGER CHECK (should_refuse IS NULL OR should_refuse IN (0, 1))",
            },
            SchemaChange::AddColumn {
                table: "messages",
                column: "contract_version",
                definition: "TEXT CHECK (contract_version IS NULL OR contract_version IN ('legacy', 'v2.0', 'v2.1'))",
            },
        ],
    },
];

/// Validate `steps` as a linear chain and return them root first.
pub fn ordered_chain(steps: &[MigrationStep]) -> Result<Vec<&MigrationStep>, MigrationError> {
    let mut by_id: HashMap<&str, &MigrationStep> = HashMap::new();
    for step in steps {
        if by_id.insert(step.id, step).is_some() {
            return Err(MigrationError::BrokenChain(format!("duplicate step id '{}'", step.id)));
        }
    }

    let roots: Vec<&MigrationStep> = steps.iter().filter(|s| s.predecessor.is_none()).collect();
    let root = match roots.as_slice() {
        [root] => *root,
        [] => return Err(MigrationError::BrokenChain("no root step".to_string())),
        _ => {
            return Err(MigrationError::BrokenChain(format!(
                "{} root steps, expected exactly one",
                roots.len()
            )));
        }
    };

    let mut successor: HashMap<&str, &MigrationStep> = HashMap::new();
    for step in steps {
        let Some(pred) = step.predecessor else {
            continue;
        };
        if !by_id.contains_key(pred) {
            return Err(MigrationError::BrokenChain(format!(
                "step '{}' follows unknown step '{}'",
                step.id, pred
            )));
        }
        if let Some(other) = successor.insert(pred, step) {
            return Err(MigrationError::BrokenChain(format!(
                "steps '{}' and '{}' both follow '{}'",
                other.id, step.id, pred
            )));
        }
    }

    let mut ordered = vec![root];
    let mut seen: HashSet<&str> = HashSet::from([root.id]);
    let mut current = root;
    while let Some(next) = successor.get(current.id) {
        if !seen.insert(next.id) {
            return Err(MigrationError::BrokenChain(format!("cycle at step '{}'", next.id)));
        }
        ordered.push(next);
        current = next;
    }

    if ordered.len() != steps.len() {
        return Err(MigrationError::BrokenChain(format!(
            "{} step(s) unreachable from root '{}'",
            steps.len() - ordered.len(),
            root.id
        )));
    }
    Ok(ordered)
}

impl MigrationStep {
    /// Apply this step. Safe to replay: existing objects are skipped.
    pub async fn forward(&self, conn: &Connection) -> Result<(), DatabaseError> {
        for change in self.changes {
            match *change {
                SchemaChange::CreateTable { table, columns } => {
                    conn.execute(&format!("CREATE TABLE IF NOT EXISTS {table} ({columns})"), ())
                        .await?;
                }
                SchemaChange::AddColumn {
                    table,
                    column,
                    definition,
                } => {
                    if !column_exists(conn, table, column).await? {
                        conn.execute(
                            &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
                            (),
                        )
                        .await?;
                    }
                }
                SchemaChange::CreateIndex {
                    name,
                    table,
                    columns,
                } => {
                    conn.execute(
                        &format!("CREATE INDEX IF NOT EXISTS {name} ON {table} ({columns})"),
                        (),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Undo this step, newest change first.
    pub async fn backward(&self, conn: &Connection) -> Result<(), DatabaseError> {
        for change in self.changes.iter().rev() {
            match *change {
                SchemaChange::CreateTable { table, .. } => {
                    conn.execute(&format!("DROP TABLE IF EXISTS {table}"), ()).await?;
                }
                SchemaChange::AddColumn { table, column, .. } => {
                    if column_exists(conn, table, column).await? {
                        conn.execute(&format!("ALTER TABLE {table} DROP COLUMN {column}"), ())
                            .await?;
                    }
                }
                SchemaChange::CreateIndex { name, .. } => {
                    conn.execute(&format!("DROP INDEX IF EXISTS {name}"), ()).await?;
                }
            }
        }
        Ok(())
    }
}

pub async fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn.query(&format!("PRAGMA table_info({table})"), ()).await?;
    let mut names = Vec::new();
    while let Some(row) = rows.next().await? {
        names.push(get_text(&row, 1));
    }
    Ok(names)
}

async fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    Ok(column_names(conn, table).await?.iter().any(|c| c == column))
}

async fn ensure_bookkeeping(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations ( \
           id TEXT PRIMARY KEY, \
           applied_at TEXT NOT NULL \
         )",
        (),
    )
    .await?;
    Ok(())
}

async fn applied_ids(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn
        .query("SELECT id FROM schema_migrations ORDER BY rowid ASC", ())
        .await?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await? {
        ids.push(get_text(&row, 0));
    }
    Ok(ids)
}

/// Number of chain steps already applied. Recorded ids must be a prefix
/// of the chain.
fn verify_applied(chain: &[&MigrationStep], applied: &[String]) -> Result<usize, MigrationError> {
    if applied.len() > chain.len() {
        return Err(MigrationError::StateMismatch(format!(
            "{} steps recorded but the chain has only {}",
            applied.len(),
            chain.len()
        )));
    }
    for (step, recorded) in chain.iter().zip(applied) {
        if step.id != recorded.as_str() {
            return Err(MigrationError::StateMismatch(format!(
                "expected '{}' but found '{}'",
                step.id, recorded
            )));
        }
    }
    Ok(applied.len())
}

fn position(chain: &[&MigrationStep], id: &str) -> Result<usize, MigrationError> {
    chain
        .iter()
        .position(|s| s.id == id)
        .ok_or_else(|| MigrationError::UnknownStep(id.to_string()))
}

async fn load_state(conn: &Connection) -> Result<(Vec<&'static MigrationStep>, usize), MigrationError> {
    let chain = ordered_chain(MIGRATIONS)?;
    ensure_bookkeeping(conn).await?;
    let applied = applied_ids(conn).await?;
    let count = verify_applied(&chain, &applied)?;
    Ok((chain, count))
}

/// Apply pending steps up to and including `target` (default: head).
pub async fn migrate_up(
    conn: &Connection,
    target: Option<&str>,
) -> Result<Vec<&'static str>, MigrationError> {
    let (chain, applied) = load_state(conn).await?;
    let end = match target {
        Some(id) => position(&chain, id)? + 1,
        None => chain.len(),
    };

    let mut done = Vec::new();
    for step in chain.iter().take(end).skip(applied) {
        conn.execute("BEGIN", ()).await.map_err(DatabaseError::from)?;
        let step_result = async {
            step.forward(conn).await?;
            conn.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                params![step.id, fmt_ts(&Utc::now())],
            )
            .await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match step_result {
            Ok(()) => {
                conn.execute("COMMIT", ()).await.map_err(DatabaseError::from)?;
                tracing::debug!(step = step.id, "Applied migration step");
                done.push(step.id);
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                tracing::error!(step = step.id, error = %err, "Migration step failed");
                return Err(err.into());
            }
        }
    }
    Ok(done)
}

/// Revert applied steps newer than `target`; `None` reverts the whole chain.
pub async fn migrate_down(
    conn: &Connection,
    target: Option<&str>,
) -> Result<Vec<&'static str>, MigrationError> {
    let (chain, applied) = load_state(conn).await?;
    let keep = match target {
        Some(id) => position(&chain, id)? + 1,
        None => 0,
    };

    let mut undone = Vec::new();
    for step in chain.iter().take(applied).skip(keep).rev() {
        conn.execute("BEGIN", ()).await.map_err(DatabaseError::from)?;
        let step_result = async {
            step.backward(conn).await?;
            conn.execute("DELETE FROM schema_migrations WHERE id = ?1", params![step.id])
                .await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match step_result {
            Ok(()) => {
                conn.execute("COMMIT", ()).await.map_err(DatabaseError::from)?;
                tracing::debug!(step = step.id, "Reverted migration step");
                undone.push(step.id);
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                tracing::error!(step = step.id, error = %err, "Migration rollback failed");
                return Err(err.into());
            }
        }
    }
    Ok(undone)
}

pub async fn status(conn: &Connection) -> Result<Vec<MigrationStatus>, MigrationError> {
    let (chain, applied) = load_state(conn).await?;
    Ok(chain
        .iter()
        .enumerate()
        .map(|(i, step)| MigrationStatus {
            id: step.id,
            description: step.description,
            applied: i < applied,
        })
        .collect())
}
