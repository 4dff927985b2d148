//! Total, pure reconciliation of raw AI Core metadata.
//!
//! Nothing in here fails. Missing keys, unexpected keys and values of the
//! wrong JSON type all collapse to `None`; type errors are rejected earlier
//! by [`super::validate_metadata`] when the caller wants them rejected.

use serde_json::{Map, Value};

use super::{ContentMetrics, ContractVersion, VersionedMetadata};

const V2_1_KEYS: &[&str] = &[
    "persona_used",
    "signal_strength",
    "context_clarity",
    "needs_knowledge",
];

/// Reconcile a payload whose legacy `context` object, if any, is nested inside it.
pub fn reconcile_payload(raw: &Value) -> VersionedMetadata {
    let Some(map) = raw.as_object() else {
        return reconcile(&Map::new(), None);
    };
    let legacy_context = map.get("context").and_then(Value::as_object);
    reconcile(map, legacy_context)
}

/// Build a [`VersionedMetadata`] from a raw top-level mapping plus the
/// optional legacy nested `context` mapping.
///
/// First non-null source wins for every field. `confidence` and
/// `signal_strength` are resolved independently and never fill each other.
pub fn reconcile(raw: &Map<String, Value>, legacy_context: Option<&Map<String, Value>>) -> VersionedMetadata {
    let tone = label(raw, "tone");
    let behavior = label(raw, "behavior");

    let persona_label = label(raw, "persona_used")
        .or_else(|| label(raw, "persona"))
        .or_else(|| match (&tone, &behavior) {
            (Some(t), Some(b)) => Some(format!("{} + {}", title_case(t), title_case(b))),
            _ => None,
        });

    let context_type = label(raw, "context_type").or_else(|| legacy_context.and_then(|c| label(c, "context_type")));
    let signal_strength =
        number(raw, "signal_strength").or_else(|| legacy_context.and_then(|c| number(c, "signal_strength")));
    let confidence = number(raw, "confidence").or_else(|| legacy_context.and_then(|c| number(c, "confidence")));

    let model_info = raw.get("model_info").and_then(Value::as_object);
    let model_name = model_info
        .and_then(|info| label(info, "model_name").or_else(|| label(info, "model")))
        .or_else(|| label(raw, "model"));

    let usage = model_info
        .and_then(|info| info.get("usage"))
        .and_then(Value::as_object)
        .or_else(|| raw.get("usage").and_then(Value::as_object));
    let prompt_tokens = usage.and_then(|u| integer(u, "prompt_tokens"));
    let completion_tokens = usage.and_then(|u| integer(u, "completion_tokens"));

    VersionedMetadata {
        persona_label,
        tone,
        behavior,
        context_type,
        signal_strength,
        confidence,
        context_clarity: tri_state(raw, legacy_context, "context_clarity"),
        needs_knowledge: tri_state(raw, legacy_context, "needs_knowledge"),
        should_refuse: tri_state(raw, legacy_context, "should_refuse"),
        model_name,
        prompt_tokens,
        completion_tokens,
        content_metrics: content_metrics(raw),
        valid: raw.get("valid").and_then(Value::as_bool),
        warnings: warnings(raw),
        contract: Some(detect_contract(raw, legacy_context)),
    }
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_word_start = true;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

fn label(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn integer(map: &Map<String, Value>, key: &str) -> Option<i64> {
    map.get(key).and_then(Value::as_i64)
}

/// Presence check, not null check: a top-level key that exists decides the
/// value even when it is `null`.
fn tri_state(raw: &Map<String, Value>, legacy_context: Option<&Map<String, Value>>, key: &str) -> Option<bool> {
    if let Some(value) = raw.get(key) {
        return value.as_bool();
    }
    legacy_context.and_then(|c| c.get(key)).and_then(Value::as_bool)
}

fn content_metrics(raw: &Map<String, Value>) -> Option<ContentMetrics> {
    let top = ContentMetrics {
        length: integer(raw, "length"),
        word_count: integer(raw, "word_count"),
        estimated_read_time: integer(raw, "estimated_read_time"),
        has_code_blocks: raw.get("has_code_blocks").and_then(Value::as_bool),
    };
    if !top.is_empty() {
        return Some(top);
    }

    let info = raw.get("content_info").and_then(Value::as_object)?;
    let nested = ContentMetrics {
        length: integer(info, "length").or_else(|| integer(info, "char_count")),
        word_count: integer(info, "word_count"),
        estimated_read_time: integer(info, "estimated_read_time"),
        has_code_blocks: info.get("has_code_blocks").and_then(Value::as_bool),
    };
    (!nested.is_empty()).then_some(nested)
}

fn warnings(raw: &Map<String, Value>) -> Vec<String> {
    raw.get("warnings")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn detect_contract(raw: &Map<String, Value>, legacy_context: Option<&Map<String, Value>>) -> ContractVersion {
    let nested_v2_1 = legacy_context.is_some_and(|c| V2_1_KEYS.iter().any(|k| c.contains_key(*k)));
    if nested_v2_1 || V2_1_KEYS.iter().any(|k| raw.contains_key(*k)) {
        ContractVersion::V2_1
    } else if raw.contains_key("tone") || raw.contains_key("behavior") {
        ContractVersion::V2_0
    } else {
        ContractVersion::Legacy
    }
}
