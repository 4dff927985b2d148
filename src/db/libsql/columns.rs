//! Storage representation of [`VersionedMetadata`].
//!
//! Booleans live in `INTEGER` columns as 0/1 with NULL meaning unknown, and
//! structured values live in JSON text columns. This module is the only
//! place that knows about those encodings.

use libsql::Value;

use crate::db::MessageRole;
use crate::error::DatabaseError;
use crate::metadata::{ContentMetrics, ContractVersion, VersionedMetadata};

use super::{get_opt_f64, get_opt_i64, get_opt_text, opt_f64, opt_i64, opt_text};

/// Metadata column names in read/write order.
pub(super) const METADATA_COLUMNS: &[&str] = &[
    "persona",
    "tone",
    "behavior",
    "context_type",
    "signal_strength",
    "confidence",
    "context_clarity",
    "needs_knowledge",
    "should_refuse",
    "model_name",
    "prompt_tokens",
    "completion_tokens",
    "valid",
    "warnings_json",
    "content_metrics_json",
    "contract_version",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct MetadataColumns {
    persona: Option<String>,
    tone: Option<String>,
    behavior: Option<String>,
    context_type: Option<String>,
    signal_strength: Option<f64>,
    confidence: Option<f64>,
    context_clarity: Option<i64>,
    needs_knowledge: Option<i64>,
    should_refuse: Option<i64>,
    model_name: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    valid: Option<i64>,
    warnings_json: Option<String>,
    content_metrics_json: Option<String>,
    contract_version: Option<String>,
}

impl MetadataColumns {
    pub(super) fn from_domain(meta: Option<&VersionedMetadata>) -> Result<Self, DatabaseError> {
        let Some(meta) = meta else {
            return Ok(Self::default());
        };
        let warnings_json = if meta.warnings.is_empty() {
            None
        } else {
            Some(to_json(&meta.warnings)?)
        };
        let content_metrics_json = meta.content_metrics.as_ref().map(to_json).transpose()?;

        Ok(Self {
            persona: meta.persona_label.clone(),
            tone: meta.tone.clone(),
            behavior: meta.behavior.clone(),
            context_type: meta.context_type.clone(),
            signal_strength: meta.signal_strength,
            confidence: meta.confidence,
            context_clarity: encode_bool(meta.context_clarity),
            needs_knowledge: encode_bool(meta.needs_knowledge),
            should_refuse: encode_bool(meta.should_refuse),
            model_name: meta.model_name.clone(),
            prompt_tokens: meta.prompt_tokens,
            completion_tokens: meta.completion_tokens,
            valid: encode_bool(meta.valid),
            warnings_json,
            content_metrics_json,
            contract_version: meta.contract.map(|c| c.as_str().to_string()),
        })
    }

    /// Read the metadata block starting at column `offset`.
    pub(super) fn read(row: &libsql::Row, offset: i32) -> Self {
        Self {
            persona: get_opt_text(row, offset),
            tone: get_opt_text(row, offset + 1),
            behavior: get_opt_text(row, offset + 2),
            context_type: get_opt_text(row, offset + 3),
            signal_strength: get_opt_f64(row, offset + 4),
            confidence: get_opt_f64(row, offset + 5),
            context_clarity: get_opt_i64(row, offset + 6),
            needs_knowledge: get_opt_i64(row, offset + 7),
            should_refuse: get_opt_i64(row, offset + 8),
            model_name: get_opt_text(row, offset + 9),
            prompt_tokens: get_opt_i64(row, offset + 10),
            completion_tokens: get_opt_i64(row, offset + 11),
            valid: get_opt_i64(row, offset + 12),
            warnings_json: get_opt_text(row, offset + 13),
            content_metrics_json: get_opt_text(row, offset + 14),
            contract_version: get_opt_text(row, offset + 15),
        }
    }

    /// Values in [`METADATA_COLUMNS`] order.
    pub(super) fn values(&self) -> Vec<Value> {
        vec![
            opt_text(self.persona.as_deref()),
            opt_text(self.tone.as_deref()),
            opt_text(self.behavior.as_deref()),
            opt_text(self.context_type.as_deref()),
            opt_f64(self.signal_strength),
            opt_f64(self.confidence),
            opt_i64(self.context_clarity),
            opt_i64(self.needs_knowledge),
            opt_i64(self.should_refuse),
            opt_text(self.model_name.as_deref()),
            opt_i64(self.prompt_tokens),
            opt_i64(self.completion_tokens),
            opt_i64(self.valid),
            opt_text(self.warnings_json.as_deref()),
            opt_text(self.content_metrics_json.as_deref()),
            opt_text(self.contract_version.as_deref()),
        ]
    }

    /// Domain view. User messages never carry metadata.
    pub(super) fn into_domain(self, role: MessageRole) -> Result<Option<VersionedMetadata>, DatabaseError> {
        if role == MessageRole::User {
            return Ok(None);
        }
        let warnings: Vec<String> = match self.warnings_json.as_deref() {
            Some(raw) if !raw.trim().is_empty() => from_json(raw)?,
            _ => Vec::new(),
        };
        let content_metrics: Option<ContentMetrics> = match self.content_metrics_json.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(from_json(raw)?),
            _ => None,
        };
        let contract = match self.contract_version.as_deref() {
            Some(raw) => Some(ContractVersion::from_db_value(raw).ok_or_else(|| {
                DatabaseError::Serialization(format!("invalid contract_version '{}'", raw))
            })?),
            None => None,
        };

        Ok(Some(VersionedMetadata {
            persona_label: self.persona,
            tone: self.tone,
            behavior: self.behavior,
            context_type: self.context_type,
            signal_strength: self.signal_strength,
            confidence: self.confidence,
            context_clarity: decode_bool(self.context_clarity),
            needs_knowledge: decode_bool(self.needs_knowledge),
            should_refuse: decode_bool(self.should_refuse),
            model_name: self.model_name,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            content_metrics,
            valid: decode_bool(self.valid),
            warnings,
            contract,
        }))
    }
}

fn encode_bool(value: Option<bool>) -> Option<i64> {
    value.map(i64::from)
}

fn decode_bool(value: Option<i64>) -> Option<bool> {
    value.map(|n| n != 0)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> VersionedMetadata {
        VersionedMetadata {
            persona_label: Some("Casual + Cautious".into()),
            tone: Some("casual".into()),
            behavior: Some("cautious".into()),
            signal_strength: Some(0.42),
            context_clarity: Some(false),
            needs_knowledge: Some(true),
            prompt_tokens: Some(12),
            content_metrics: Some(ContentMetrics {
                word_count: Some(30),
                ..Default::default()
            }),
            warnings: vec!["short".into()],
            contract: Some(ContractVersion::V2_1),
            ..Default::default()
        }
    }

    #[test]
    fn tri_state_booleans_use_integer_sentinels() {
        let cols = MetadataColumns::from_domain(Some(&sample())).unwrap();
        assert_eq!(cols.context_clarity, Some(0));
        assert_eq!(cols.needs_knowledge, Some(1));
        assert_eq!(cols.should_refuse, None);
        assert_eq!(cols.valid, None);
    }

    #[test]
    fn domain_round_trip_preserves_unknowns() {
        let meta = sample();
        let cols = MetadataColumns::from_domain(Some(&meta)).unwrap();
        let back = cols.into_domain(MessageRole::Assistant).unwrap();
        assert_eq!(back, Some(meta));
    }

    #[test]
    fn legacy_row_reads_as_nulls() {
        let cols = MetadataColumns {
            persona: Some("Friendly".into()),
            confidence: Some(0.8),
            ..Default::default()
        };
        let meta = cols.into_domain(MessageRole::Assistant).unwrap().unwrap();
        assert_eq!(meta.persona_label.as_deref(), Some("Friendly"));
        assert_eq!(meta.signal_strength, None);
        assert_eq!(meta.needs_knowledge, None);
        assert_eq!(meta.contract, None);
        assert!(meta.warnings.is_empty());
    }

    #[test]
    fn user_messages_have_no_metadata() {
        let cols = MetadataColumns::from_domain(Some(&sample())).unwrap();
        assert_eq!(cols.into_domain(MessageRole::User).unwrap(), None);
        assert_eq!(METADATA_COLUMNS.len(), MetadataColumns::default().values().len());
    }
}
