//! Record model: raw rows, validation errors, and the per-record lifecycle
//!
//! A raw record is an opaque mapping from column names to values, produced by
//! a parser collaborator. The engine wraps each raw record in a
//! [`ProcessedRecord`] carrying a stable index, the validation error list,
//! and a status tag that only moves forward through the pipeline stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A parsed row: column name to opaque value
pub type RawRecord = serde_json::Map<String, Value>;

/// Per-record lifecycle status
///
/// Transitions are strictly forward: `pending` -> (`valid` | `invalid`) ->
/// (`processed` | `failed`). A record never moves backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Not yet validated or processed
    Pending,
    /// Passed validation (may still carry warnings)
    Valid,
    /// Carries at least one hard validation error
    Invalid,
    /// Successfully handed to the processor
    Processed,
    /// Processing or a lifecycle hook failed
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Valid => write!(f, "valid"),
            RecordStatus::Invalid => write!(f, "invalid"),
            RecordStatus::Processed => write!(f, "processed"),
            RecordStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Severity of a validation error; absent means hard error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Classification of a validation error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Format,
    Duplicate,
    Custom,
}

/// A single validation finding on one field of one record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ValidationError {
    /// Create a hard error (absent severity counts as `error`)
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: code.into(),
            severity: None,
            category: None,
            suggestion: None,
            metadata: None,
            value: None,
        }
    }

    /// Create a warning; warnings never block processing
    pub fn warning(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            severity: Some(Severity::Warning),
            ..Self::new(field, message, code)
        }
    }

    /// A hard error has severity `error` or no severity at all
    pub fn is_hard(&self) -> bool {
        !matches!(self.severity, Some(Severity::Warning))
    }
}

/// Result of the synchronous validation port
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// Findings in field order; warnings are retained on valid records
    pub errors: Vec<ValidationError>,
    /// Optional transformed projection used for processing when present
    pub parsed: Option<RawRecord>,
}

/// A record travelling through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    /// Monotonic, 0-based, stable across retries and restores
    pub index: u64,
    /// The raw mapping as produced by the parser
    pub raw: RawRecord,
    /// Parsed projection filled in after validation, when the validator
    /// returned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<RawRecord>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ProcessedRecord {
    /// Wrap a raw record at the given stream index
    pub fn pending(index: u64, raw: RawRecord) -> Self {
        Self {
            index,
            raw,
            parsed: None,
            status: RecordStatus::Pending,
            errors: Vec::new(),
            processing_error: None,
            retry_count: 0,
        }
    }

    /// The data handed to hooks and the processor: the parsed projection
    /// when validation produced one, the raw mapping otherwise
    pub fn data(&self) -> &RawRecord {
        self.parsed.as_ref().unwrap_or(&self.raw)
    }

    /// True iff at least one error is hard
    pub fn has_hard_errors(&self) -> bool {
        self.errors.iter().any(ValidationError::is_hard)
    }

    /// First hard error, used for failure messages
    pub fn first_hard_error(&self) -> Option<&ValidationError> {
        self.errors.iter().find(|e| e.is_hard())
    }
}

/// True when every column value is null or an empty string
///
/// An empty mapping counts as an empty row.
pub fn is_empty_row(raw: &RawRecord) -> bool {
    raw.values().all(|value| match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_record_status_serde() {
        assert_eq!(
            serde_json::to_string(&RecordStatus::Processed).unwrap(),
            "\"processed\""
        );
        let status: RecordStatus = serde_json::from_str("\"invalid\"").unwrap();
        assert_eq!(status, RecordStatus::Invalid);
    }

    #[test]
    fn test_hard_errors() {
        let mut record = ProcessedRecord::pending(0, row(&[("name", json!("a"))]));
        assert!(!record.has_hard_errors());

        record
            .errors
            .push(ValidationError::warning("name", "looks odd", "ODD"));
        assert!(!record.has_hard_errors(), "warnings are not hard errors");

        record
            .errors
            .push(ValidationError::new("email", "missing", "REQUIRED"));
        assert!(record.has_hard_errors());
        assert_eq!(record.first_hard_error().unwrap().field, "email");
    }

    #[test]
    fn test_empty_row_detection() {
        assert!(is_empty_row(&row(&[])));
        assert!(is_empty_row(&row(&[
            ("a", Value::Null),
            ("b", json!(""))
        ])));
        assert!(!is_empty_row(&row(&[("a", json!("x")), ("b", json!(""))])));
        assert!(!is_empty_row(&row(&[("a", json!(0))])));
    }

    #[test]
    fn test_data_prefers_parsed_projection() {
        let mut record = ProcessedRecord::pending(3, row(&[("age", json!("42"))]));
        assert_eq!(record.data()["age"], json!("42"));

        record.parsed = Some(row(&[("age", json!(42))]));
        assert_eq!(record.data()["age"], json!(42));
    }
}
