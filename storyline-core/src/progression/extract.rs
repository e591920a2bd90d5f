//! Pulls structured directives out of free-form model output.
//!
//! Classifier prompts ask the model to reason in prose and then emit a
//! marker line followed by a payload, e.g.
//!
//! ```text
//! ...reasoning...
//! GOAL CLASSIFICATIONS: {"Find the key": "COMPLETE"}
//! ```
//!
//! Only the text after the *last* occurrence of the marker is considered, so
//! a marker quoted inside the reasoning does not confuse extraction.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Model output could not be turned into a directive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("marker '{marker}' not found in model output")]
    MarkerNotFound { marker: String },

    #[error("malformed payload after '{marker}': {reason}")]
    MalformedPayload { marker: String, reason: String },

    #[error("unknown value '{value}' after '{marker}'")]
    UnknownEnumValue { marker: String, value: String },
}

/// Binary verdict of a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Complete,
    Incomplete,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Complete => "COMPLETE",
            Classification::Incomplete => "INCOMPLETE",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    /// Exact, case-sensitive match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETE" => Ok(Classification::Complete),
            "INCOMPLETE" => Ok(Classification::Incomplete),
            other => Err(other.to_string()),
        }
    }
}

/// What a marker is expected to be followed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    JsonObject,
    Classification,
}

/// An extracted payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Keys keep the order the model wrote them in.
    Object(Map<String, Value>),
    Classification(Classification),
}

/// Extract the payload of `kind` following the last `marker` in `text`.
pub fn extract(text: &str, marker: &str, kind: PayloadKind) -> Result<Payload, ParseError> {
    match kind {
        PayloadKind::JsonObject => extract_object(text, marker).map(Payload::Object),
        PayloadKind::Classification => {
            extract_classification(text, marker).map(Payload::Classification)
        }
    }
}

/// The raw text following the last occurrence of `marker`.
pub fn after_marker<'t>(text: &'t str, marker: &str) -> Result<&'t str, ParseError> {
    text.rfind(marker)
        .map(|at| &text[at + marker.len()..])
        .ok_or_else(|| ParseError::MarkerNotFound {
            marker: marker.to_string(),
        })
}

/// Extract a JSON object.
///
/// If the remainder is not a clean object (trailing prose, a code fence),
/// the substring from the first `{` to the last `}` is parsed instead.
pub fn extract_object(text: &str, marker: &str) -> Result<Map<String, Value>, ParseError> {
    let remainder = after_marker(text, marker)?.trim();
    let malformed = |reason: String| ParseError::MalformedPayload {
        marker: marker.to_string(),
        reason,
    };

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(remainder) {
        return Ok(map);
    }

    let start = remainder
        .find('{')
        .ok_or_else(|| malformed("no JSON object found".to_string()))?;
    let end = remainder
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| malformed("unterminated JSON object".to_string()))?;

    match serde_json::from_str::<Value>(&remainder[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(malformed(format!("expected an object, got {other}"))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

/// Extract a JSON object and deserialize it into `T`.
pub fn extract_json<T: DeserializeOwned>(text: &str, marker: &str) -> Result<T, ParseError> {
    let map = extract_object(text, marker)?;
    serde_json::from_value(Value::Object(map)).map_err(|e| ParseError::MalformedPayload {
        marker: marker.to_string(),
        reason: e.to_string(),
    })
}

/// Extract a `COMPLETE` / `INCOMPLETE` verdict.
///
/// Surrounding whitespace is ignored; anything else must match exactly.
pub fn extract_classification(text: &str, marker: &str) -> Result<Classification, ParseError> {
    let value = after_marker(text, marker)?.trim();
    value
        .parse()
        .map_err(|value| ParseError::UnknownEnumValue {
            marker: marker.to_string(),
            value,
        })
}
