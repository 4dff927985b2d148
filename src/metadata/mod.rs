//! Canonical representation of one assistant turn's AI metadata.
//!
//! AI Core has shipped three generations of its metadata contract:
//!
//! - legacy: `persona`, nested `context.{context_type, confidence}`
//! - v2.0: `tone` / `behavior`
//! - v2.1: `persona_used`, `signal_strength`, `context_clarity`,
//!   `needs_knowledge`, promoted to top-level keys
//!
//! [`VersionedMetadata`] holds the union of all of them. Every field is
//! independently optional: `None` means "upstream did not say", which is
//! never the same as `false`, `0` or an empty string.

mod reconcile;
mod validate;

pub use reconcile::{reconcile, reconcile_payload, title_case};
pub use validate::validate_metadata;

use serde::{Deserialize, Serialize};

/// Contract generation a payload was written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractVersion {
    #[serde(rename = "legacy")]
    Legacy,
    #[serde(rename = "v2.0")]
    V2_0,
    #[serde(rename = "v2.1")]
    V2_1,
}

impl ContractVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::V2_0 => "v2.0",
            Self::V2_1 => "v2.1",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "legacy" => Some(Self::Legacy),
            "v2.0" => Some(Self::V2_0),
            "v2.1" => Some(Self::V2_1),
            _ => None,
        }
    }
}

/// Response shape metrics reported alongside a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetrics {
    pub length: Option<i64>,
    pub word_count: Option<i64>,
    pub estimated_read_time: Option<i64>,
    pub has_code_blocks: Option<bool>,
}

impl ContentMetrics {
    pub fn is_empty(&self) -> bool {
        self.length.is_none()
            && self.word_count.is_none()
            && self.estimated_read_time.is_none()
            && self.has_code_blocks.is_none()
    }
}

/// One assistant message's reconciled metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedMetadata {
    pub persona_label: Option<String>,
    pub tone: Option<String>,
    pub behavior: Option<String>,
    pub context_type: Option<String>,
    /// Keyword-match strength in [0, 1]. Not a probability.
    pub signal_strength: Option<f64>,
    /// Legacy score in [0, 1]. Kept apart from `signal_strength`.
    pub confidence: Option<f64>,
    pub context_clarity: Option<bool>,
    pub needs_knowledge: Option<bool>,
    pub should_refuse: Option<bool>,
    pub model_name: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub content_metrics: Option<ContentMetrics>,
    pub valid: Option<bool>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub contract: Option<ContractVersion>,
}

impl VersionedMetadata {
    /// Prompt plus completion tokens, treating unknown counts as zero.
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens
            .unwrap_or(0)
            .saturating_add(self.completion_tokens.unwrap_or(0))
    }
}
