//! Helpers for turning untrusted generator text into structured data.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::GenerationError;

/// Strip markdown code-fence markers (```json ... ```) from raw output.
pub fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Extract the outermost JSON object or array from generator output.
///
/// Models wrap JSON in prose and fences often enough that we look for the
/// first opening bracket and the matching last closing one instead of
/// parsing the text as-is.
pub fn extract_json(raw: &str) -> Result<Value, GenerationError> {
    let cleaned = strip_code_fences(raw);
    if cleaned.is_empty() {
        return Err(GenerationError::Empty);
    }

    let object = slice_between(&cleaned, '{', '}');
    let array = slice_between(&cleaned, '[', ']');

    // Prefer whichever bracket opens first.
    let candidate = match (object, array) {
        (Some(obj), Some(arr)) => {
            if cleaned.find('{') < cleaned.find('[') {
                obj
            } else {
                arr
            }
        }
        (Some(obj), None) => obj,
        (None, Some(arr)) => arr,
        (None, None) => cleaned.as_str(),
    };

    serde_json::from_str(candidate).map_err(|e| GenerationError::Parse(e.to_string()))
}

/// Extract and deserialize generator output into a concrete shape.
pub fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, GenerationError> {
    let value = extract_json(raw)?;
    serde_json::from_value(value).map_err(|e| GenerationError::Parse(e.to_string()))
}

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}
