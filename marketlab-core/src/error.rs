//! Error taxonomy for the data layer.
//!
//! Every failure carries a message, a structured context map, and an
//! optional wrapped cause, with a uniform JSON serialization for logging.
//! The kind separates provider, normalization, validation, and storage
//! failures so callers can route them without string matching.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Which layer of the pipeline produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request handed to a provider adapter.
    ProviderRequest,
    /// Provider returned an unusable or inconsistent response.
    ProviderResponse,
    /// Raw payload could not become canonical records.
    Normalization,
    /// Hard validation errors present and not suppressed.
    Validation,
    /// Any filesystem or integrity violation.
    Storage,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProviderRequest => "ProviderRequestError",
            ErrorKind::ProviderResponse => "ProviderResponseError",
            ErrorKind::Normalization => "NormalizationError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Storage => "StorageError",
        }
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error for all data layer operations.
///
/// Context keys are ordered so rendered messages and payloads are stable.
#[derive(Debug, Error)]
#[error("{}", self.render())]
pub struct DataError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<String, Value>,
    #[source]
    pub cause: Option<Cause>,
}

impl DataError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn provider_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderRequest, message)
    }

    pub fn provider_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderResponse, message)
    }

    pub fn normalization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Normalization, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    /// Attach one context entry. Values are anything JSON-representable.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Uniform serialization for structured logging and reports.
    pub fn to_payload(&self) -> Value {
        let mut payload = serde_json::Map::new();
        payload.insert("error_type".into(), Value::String(self.kind.as_str().into()));
        payload.insert("message".into(), Value::String(self.message.clone()));
        if !self.context.is_empty() {
            let context: serde_json::Map<String, Value> = self
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            payload.insert("context".into(), Value::Object(context));
        }
        if let Some(cause) = &self.cause {
            payload.insert("cause".into(), Value::String(cause.to_string()));
        }
        Value::Object(payload)
    }

    fn render(&self) -> String {
        let mut out = self.message.clone();
        if !self.context.is_empty() {
            let rendered: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            out.push_str(&format!(" | context={{{}}}", rendered.join(", ")));
        }
        if let Some(cause) = &self.cause {
            out.push_str(&format!(" | cause={cause}"));
        }
        out
    }
}

/// Convenience wrapper so error text reads as its kind plus the message.
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_context_and_cause() {
        let err = DataError::storage("canonical snapshot already exists")
            .with("dataset_id", "md.equity.eod.bars")
            .with_cause(std::io::Error::other("disk full"));

        let text = err.to_string();
        assert!(text.contains("canonical snapshot already exists"));
        assert!(text.contains("dataset_id"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn payload_carries_error_type() {
        let err = DataError::validation("validation failed").with("count", 3);
        let payload = err.to_payload();
        assert_eq!(payload["error_type"], "ValidationError");
        assert_eq!(payload["context"]["count"], 3);
    }

    #[test]
    fn payload_omits_empty_context() {
        let err = DataError::normalization("payload must be utf-8");
        let payload = err.to_payload();
        assert!(payload.get("context").is_none());
        assert!(payload.get("cause").is_none());
    }
}
