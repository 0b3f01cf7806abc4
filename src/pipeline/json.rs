//! Locating JSON objects inside free-form model output.

use serde::de::DeserializeOwned;

use crate::error::PipelineError;

/// Every balanced `{...}` span in `text`, longest first.
///
/// Braces inside JSON string literals are ignored. Spans that never close are
/// skipped.
pub fn balanced_object_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans: Vec<&str> = Vec::new();

    for (start, _) in text.match_indices('{') {
        if let Some(end) = matching_close(bytes, start) {
            spans.push(&text[start..=end]);
        }
    }

    // Stable sort keeps earlier spans first among equal lengths
    spans.sort_by(|a, b| b.len().cmp(&a.len()));
    spans
}

fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the largest balanced JSON object in `text` that deserializes into `T`.
pub fn parse_largest_object<T: DeserializeOwned>(text: &str) -> Result<T, PipelineError> {
    let spans = balanced_object_spans(text);
    if spans.is_empty() {
        return Err(PipelineError::Stage("no JSON object found in response".to_string()));
    }

    let mut last_error = None;
    for span in spans {
        match serde_json::from_str::<T>(span) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }

    Err(PipelineError::Stage(format!(
        "no parseable JSON object in response: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn finds_object_in_prose() {
        let text = "Sure! Here is the result:\n```json\n{\"area_sqft\": 2400}\n```\nDone.";
        let value: Value = parse_largest_object(text).unwrap();
        assert_eq!(value["area_sqft"], 2400);
    }

    #[test]
    fn prefers_the_largest_object() {
        let text = r#"{"a": 1} and then {"b": {"c": 2}, "d": 3}"#;
        let spans = balanced_object_spans(text);
        assert_eq!(spans[0], r#"{"b": {"c": 2}, "d": 3}"#);
        let value: Value = parse_largest_object(text).unwrap();
        assert_eq!(value["d"], 3);
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let text = r#"note {"label": "closing } brace", "n": 1}"#;
        let value: Value = parse_largest_object(text).unwrap();
        assert_eq!(value["label"], "closing } brace");
    }

    #[test]
    fn falls_back_to_inner_object_when_outer_is_invalid() {
        let text = r#"{ broken, {"ok": true} }"#;
        let value: Value = parse_largest_object(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn no_object_is_a_stage_error() {
        let err = parse_largest_object::<Value>("nothing here {").unwrap_err();
        assert!(matches!(err, PipelineError::Stage(_)));
    }
}
