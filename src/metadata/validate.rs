//! Type checks for raw upstream metadata, run before reconciliation.

use serde_json::{Map, Value};

use crate::error::ValidationError;

const LABEL_KEYS: &[&str] = &[
    "persona_used",
    "persona",
    "tone",
    "behavior",
    "context_type",
    "model",
    "response_mode",
];
const UNIT_KEYS: &[&str] = &["signal_strength", "confidence"];
const BOOL_KEYS: &[&str] = &[
    "context_clarity",
    "needs_knowledge",
    "should_refuse",
    "valid",
    "has_code_blocks",
];
/// Upper bound for token and content counts; keeps every stored count
/// summable in `i64` across any realistic number of messages.
pub const MAX_COUNT: i64 = 1_000_000_000;
const COUNT_KEYS: &[&str] = &["length", "word_count", "char_count", "estimated_read_time"];

/// Reject metadata whose known keys carry values of the wrong type.
///
/// `null` is always accepted. Unknown keys are ignored.
pub fn validate_metadata(raw: &Value) -> Result<(), ValidationError> {
    let map = match raw {
        Value::Null => return Ok(()),
        Value::Object(map) => map,
        _ => return Err(ValidationError::new("metadata", "must be an object")),
    };

    check_block(map, "metadata")?;

    if let Some(context) = nested(map, "context", "metadata")? {
        check_block(context, "metadata.context")?;
    }
    if let Some(info) = nested(map, "model_info", "metadata")? {
        for key in ["model_name", "model"] {
            check_label(info, key, "metadata.model_info")?;
        }
        if let Some(usage) = nested(info, "usage", "metadata.model_info")? {
            check_usage(usage, "metadata.model_info.usage")?;
        }
    }
    if let Some(usage) = nested(map, "usage", "metadata")? {
        check_usage(usage, "metadata.usage")?;
    }
    if let Some(info) = nested(map, "content_info", "metadata")? {
        for key in COUNT_KEYS {
            check_count(info, key, "metadata.content_info")?;
        }
        check_bool(info, "has_code_blocks", "metadata.content_info")?;
    }

    match map.get("warnings") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
        Some(_) => return Err(ValidationError::new("metadata.warnings", "must be an array of strings")),
    }

    Ok(())
}

fn check_block(map: &Map<String, Value>, prefix: &str) -> Result<(), ValidationError> {
    for key in LABEL_KEYS {
        check_label(map, key, prefix)?;
    }
    for key in UNIT_KEYS {
        match map.get(*key) {
            None | Some(Value::Null) => {}
            Some(value) => match value.as_f64() {
                Some(n) if (0.0..=1.0).contains(&n) => {}
                Some(_) => return Err(ValidationError::new(path(prefix, key), "must be between 0 and 1")),
                None => return Err(ValidationError::new(path(prefix, key), "must be a number")),
            },
        }
    }
    for key in BOOL_KEYS {
        check_bool(map, key, prefix)?;
    }
    for key in COUNT_KEYS {
        check_count(map, key, prefix)?;
    }
    Ok(())
}

fn check_usage(usage: &Map<String, Value>, prefix: &str) -> Result<(), ValidationError> {
    for key in ["prompt_tokens", "completion_tokens"] {
        check_count(usage, key, prefix)?;
    }
    Ok(())
}

fn nested<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    prefix: &str,
) -> Result<Option<&'a Map<String, Value>>, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(inner)) => Ok(Some(inner)),
        Some(_) => Err(ValidationError::new(path(prefix, key), "must be an object")),
    }
}

fn check_label(map: &Map<String, Value>, key: &str, prefix: &str) -> Result<(), ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ValidationError::new(path(prefix, key), "must be a string")),
    }
}

fn check_bool(map: &Map<String, Value>, key: &str, prefix: &str) -> Result<(), ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(ValidationError::new(path(prefix, key), "must be a boolean")),
    }
}

fn check_count(map: &Map<String, Value>, key: &str, prefix: &str) -> Result<(), ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(value) if value.as_i64().is_some_and(|n| (0..=MAX_COUNT).contains(&n)) => Ok(()),
        Some(_) => Err(ValidationError::new(
            path(prefix, key),
            format!("must be an integer between 0 and {MAX_COUNT}"),
        )),
    }
}

fn path(prefix: &str, key: &str) -> String {
    format!("{prefix}.{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_every_contract_generation() {
        let payloads = [
            json!(null),
            json!({}),
            json!({"persona": "Friendly", "context": {"context_type": "casual", "confidence": 0.8}, "model": "m", "usage": {"prompt_tokens": 3, "completion_tokens": 4}}),
            json!({"tone": "technical", "behavior": "normal", "warnings": []}),
            json!({"persona_used": "Casual + Normal", "signal_strength": 1, "context_clarity": null, "needs_knowledge": false, "valid": true, "unknown_key": {"deep": [1, 2]}}),
        ];
        for payload in payloads {
            assert_eq!(validate_metadata(&payload), Ok(()), "{payload}");
        }
    }

    #[test]
    fn rejects_string_signal_strength() {
        let err = validate_metadata(&json!({"signal_strength": "0.5"})).unwrap_err();
        assert_eq!(err.field, "metadata.signal_strength");
    }

    #[test]
    fn rejects_out_of_range_nested_confidence() {
        let err = validate_metadata(&json!({"context": {"confidence": 1.5}})).unwrap_err();
        assert_eq!(err.field, "metadata.context.confidence");
    }

    #[test]
    fn rejects_non_boolean_tri_state() {
        let err = validate_metadata(&json!({"needs_knowledge": 0})).unwrap_err();
        assert_eq!(err.field, "metadata.needs_knowledge");
    }

    #[test]
    fn rejects_counts_beyond_the_bound() {
        for count in [json!(i64::MAX), json!(u64::MAX), json!(MAX_COUNT + 1)] {
            let err = validate_metadata(&json!({"usage": {"prompt_tokens": count}})).unwrap_err();
            assert_eq!(err.field, "metadata.usage.prompt_tokens");
        }
        assert_eq!(validate_metadata(&json!({"usage": {"completion_tokens": MAX_COUNT}})), Ok(()));

        let err = validate_metadata(&json!({"content_info": {"word_count": u64::MAX}})).unwrap_err();
        assert_eq!(err.field, "metadata.content_info.word_count");
    }

    #[test]
    fn rejects_negative_token_counts() {
        let err = validate_metadata(&json!({"model_info": {"usage": {"prompt_tokens": -1}}})).unwrap_err();
        assert_eq!(err.field, "metadata.model_info.usage.prompt_tokens");
    }

    #[test]
    fn rejects_malformed_shapes() {
        assert!(validate_metadata(&json!("nope")).is_err());
        assert!(validate_metadata(&json!({"context": "casual"})).is_err());
        assert!(validate_metadata(&json!({"warnings": [1]})).is_err());
        assert!(validate_metadata(&json!({"tone": 5})).is_err());
    }
}
