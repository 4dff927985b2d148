//! Read-side projections over stored messages.
//!
//! The projections are plain functions over records so they can be tested
//! without a database; [`ReportingService`] loads the records and checks
//! ownership.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{Database, MessageRecord, MessageRole, MessageStore, SessionRecord, TokenUsageRow};
use crate::error::ServiceError;
use crate::metadata::VersionedMetadata;
use crate::service::owned_session;

/// Replay compresses any gap longer than this.
pub const MAX_REPLAY_DELAY_MS: i64 = 10_000;

/// Days reported in the per-day breakdown.
pub const TOKEN_ANALYTICS_DAYS: usize = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub message_count: i64,
    pub avg_tokens_per_message: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTokenStats {
    pub session_id: Uuid,
    pub session_title: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTokenStats {
    pub date: NaiveDate,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub message_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenAnalytics {
    pub overall: TokenStats,
    pub by_session: Vec<SessionTokenStats>,
    pub by_day: Vec<DailyTokenStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionComparison {
    pub session_id: Uuid,
    pub title: Option<String>,
    pub message_count: usize,
    pub total_tokens: i64,
    pub avg_confidence: Option<f64>,
    pub avg_signal_strength: Option<f64>,
    pub persona_distribution: BTreeMap<String, u64>,
    pub tone_distribution: BTreeMap<String, u64>,
    pub behavior_distribution: BTreeMap<String, u64>,
    pub model_used: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub duration_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub session_1: SessionComparison,
    pub session_2: SessionComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<VersionedMetadata>,
    pub is_mistake: bool,
    pub created_at: DateTime<Utc>,
    /// Time since the previous message, capped at [`MAX_REPLAY_DELAY_MS`].
    pub delay_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReplay {
    pub session_id: Uuid,
    pub title: Option<String>,
    pub messages: Vec<ReplayMessage>,
    /// Sum of the capped delays, not the wall-clock span.
    pub total_duration_ms: i64,
    pub message_count: usize,
}

#[derive(Default)]
struct TokenTally {
    prompt: i64,
    completion: i64,
    count: i64,
}

impl TokenTally {
    fn add(&mut self, row: &TokenUsageRow) {
        self.prompt = self.prompt.saturating_add(row.prompt_tokens.unwrap_or(0));
        self.completion = self.completion.saturating_add(row.completion_tokens.unwrap_or(0));
        self.count += 1;
    }

    fn total(&self) -> i64 {
        self.prompt.saturating_add(self.completion)
    }
}

/// Aggregate assistant token usage overall, per session and per day.
pub fn token_analytics(rows: &[TokenUsageRow]) -> TokenAnalytics {
    let mut overall = TokenTally::default();
    let mut sessions: Vec<(&TokenUsageRow, TokenTally)> = Vec::new();
    let mut days: BTreeMap<NaiveDate, TokenTally> = BTreeMap::new();

    for row in rows {
        overall.add(row);
        match sessions.iter_mut().find(|(first, _)| first.session_id == row.session_id) {
            Some((_, tally)) => tally.add(row),
            None => {
                let mut tally = TokenTally::default();
                tally.add(row);
                sessions.push((row, tally));
            }
        }
        days.entry(row.created_at.date_naive()).or_default().add(row);
    }

    let avg_tokens_per_message = if overall.count > 0 {
        round_to(overall.total() as f64 / overall.count as f64, 2)
    } else {
        0.0
    };

    let mut by_session: Vec<SessionTokenStats> = sessions
        .into_iter()
        .map(|(first, tally)| SessionTokenStats {
            session_id: first.session_id,
            session_title: first.session_title.clone(),
            prompt_tokens: tally.prompt,
            completion_tokens: tally.completion,
            total_tokens: tally.total(),
            message_count: tally.count,
            created_at: first.session_created_at,
        })
        .collect();
    by_session.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens));

    let by_day = days
        .into_iter()
        .rev()
        .take(TOKEN_ANALYTICS_DAYS)
        .map(|(date, tally)| DailyTokenStats {
            date,
            prompt_tokens: tally.prompt,
            completion_tokens: tally.completion,
            total_tokens: tally.total(),
            message_count: tally.count,
        })
        .collect();

    TokenAnalytics {
        overall: TokenStats {
            total_prompt_tokens: overall.prompt,
            total_completion_tokens: overall.completion,
            total_tokens: overall.total(),
            message_count: overall.count,
            avg_tokens_per_message,
        },
        by_session,
        by_day,
    }
}

/// Summarize one session for side-by-side comparison.
///
/// `message_count` and the duration cover every message; token and
/// metadata figures cover assistant messages only.
pub fn compare_session(session: &SessionRecord, messages: &[MessageRecord]) -> SessionComparison {
    let assistant: Vec<&VersionedMetadata> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .filter_map(|m| m.metadata.as_ref())
        .collect();

    let total_tokens = assistant
        .iter()
        .map(|m| m.total_tokens())
        .fold(0i64, i64::saturating_add);
    let avg_confidence = mean(assistant.iter().filter_map(|m| m.confidence));
    let avg_signal_strength = mean(assistant.iter().filter_map(|m| m.signal_strength));

    let persona_distribution = distribution(assistant.iter().filter_map(|m| m.persona_label.as_deref()));
    let tone_distribution = distribution(assistant.iter().filter_map(|m| m.tone.as_deref()));
    let behavior_distribution = distribution(assistant.iter().filter_map(|m| m.behavior.as_deref()));
    let model_used = most_frequent(assistant.iter().filter_map(|m| m.model_name.as_deref()));

    let first = messages.iter().map(|m| m.created_at).min();
    let last = messages.iter().map(|m| m.created_at).max();
    let duration_ms = match (first, last) {
        (Some(first), Some(last)) => (last - first).num_milliseconds(),
        _ => 0,
    };

    SessionComparison {
        session_id: session.id,
        title: session.title.clone(),
        message_count: messages.len(),
        total_tokens,
        avg_confidence,
        avg_signal_strength,
        persona_distribution,
        tone_distribution,
        behavior_distribution,
        model_used,
        created_at: session.created_at,
        duration_ms,
        duration_minutes: round_to(duration_ms as f64 / 60_000.0, 2),
    }
}

/// Rebuild the session timeline with compressed pauses.
///
/// `messages` must already be in creation order.
pub fn replay(session: &SessionRecord, messages: Vec<MessageRecord>) -> SessionReplay {
    let mut previous: Option<DateTime<Utc>> = None;
    let mut total_duration_ms = 0;
    let mut replayed = Vec::with_capacity(messages.len());

    for message in messages {
        let delay_ms = previous
            .map(|prev| {
                (message.created_at - prev)
                    .num_milliseconds()
                    .clamp(0, MAX_REPLAY_DELAY_MS)
            })
            .unwrap_or(0);
        total_duration_ms += delay_ms;
        previous = Some(message.created_at);
        replayed.push(ReplayMessage {
            id: message.id,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            is_mistake: message.is_mistake,
            created_at: message.created_at,
            delay_ms,
        });
    }

    SessionReplay {
        session_id: session.id,
        title: session.title.clone(),
        message_count: replayed.len(),
        messages: replayed,
        total_duration_ms,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| round_to(sum / f64::from(count), 3))
}

fn distribution<'a>(labels: impl Iterator<Item = &'a str>) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Most common value; ties go to the one seen first.
fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, u64)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(&str, u64)> = None;
    for (value, n) in counts {
        if best.is_none_or(|(_, top)| n > top) {
            best = Some((value, n));
        }
    }
    best.map(|(value, _)| value.to_string())
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub struct ReportingService {
    db: Arc<dyn Database>,
}

impl ReportingService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn token_analytics(&self, user: &AuthUser) -> Result<TokenAnalytics, ServiceError> {
        let rows = self.db.list_token_usage(user.user_id()).await?;
        Ok(token_analytics(&rows))
    }

    /// Both sides are ownership-checked independently; the error names the
    /// side that failed.
    pub async fn compare(
        &self,
        user: &AuthUser,
        session_id_1: Uuid,
        session_id_2: Uuid,
    ) -> Result<ComparisonReport, ServiceError> {
        let first = owned_session(self.db.as_ref(), user, session_id_1, "session 1").await?;
        let second = owned_session(self.db.as_ref(), user, session_id_2, "session 2").await?;

        let first_messages = self.db.list_messages(first.id, None).await?;
        let second_messages = self.db.list_messages(second.id, None).await?;

        Ok(ComparisonReport {
            session_1: compare_session(&first, &first_messages),
            session_2: compare_session(&second, &second_messages),
        })
    }

    pub async fn replay(&self, user: &AuthUser, session_id: Uuid) -> Result<SessionReplay, ServiceError> {
        let session = owned_session(self.db.as_ref(), user, session_id, "session").await?;
        let messages = self.db.list_messages(session.id, None).await?;
        Ok(replay(&session, messages))
    }
}
