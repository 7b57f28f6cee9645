//! Structured error descriptors carried inside `failure.*` events.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Stable codes for failures detected by this crate rather than by an
/// external library. Values are part of the embedder-facing ABI and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MmdbEnoent = 1,
    MmdbEnodatafortype = 2,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MmdbEnoent => "mmdb_enoent",
            ErrorCode::MmdbEnodatafortype => "mmdb_enodatafortype",
        }
    }
}

/// Descriptor for a failed I/O operation, suitable for direct inclusion in
/// a `failure.*` event payload.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{library_name}: {reason} (code {code})")]
pub struct ErrContext {
    /// Nonzero by default so that a forgotten assignment cannot read as success.
    pub code: i64,
    pub library_name: String,
    pub library_version: String,
    pub reason: String,
}

impl Default for ErrContext {
    fn default() -> Self {
        Self {
            code: 1,
            library_name: String::new(),
            library_version: String::new(),
            reason: String::new(),
        }
    }
}

impl ErrContext {
    /// An error propagated from an external library.
    pub fn library(name: &str, version: &str, reason: impl Into<String>) -> Self {
        Self {
            code: 1,
            library_name: name.to_string(),
            library_version: version.to_string(),
            reason: reason.into(),
        }
    }

    /// An error originated by this crate, identified by a stable code.
    pub fn own(code: ErrorCode) -> Self {
        Self {
            code: code as i64,
            library_name: crate::default_engine_name().to_string(),
            library_version: crate::version().to_string(),
            reason: code.as_str().to_string(),
        }
    }

    /// An error reported by the JSON machinery.
    pub fn json(reason: impl Into<String>) -> Self {
        Self::library("serde_json", "", reason)
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }
}

/// The canonical `failure.*` payload for a library error.
pub(crate) fn library_failure(err: &ErrContext) -> Value {
    json!({
        "failure": "library_error",
        "library_error_context": err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_code_is_nonzero() {
        assert_ne!(ErrContext::default().code, 0);
    }

    #[test]
    fn own_errors_carry_engine_identity() {
        let err = ErrContext::own(ErrorCode::MmdbEnoent);
        assert_eq!(err.code, 1);
        assert_eq!(err.library_name, crate::default_engine_name());
        assert_eq!(err.reason, "mmdb_enoent");
    }

    #[test]
    fn failure_payload_shape() {
        let err = ErrContext::library("reqwest", "", "connection refused").with_code(7);
        let payload = library_failure(&err);
        assert_eq!(payload["failure"], "library_error");
        assert_eq!(payload["library_error_context"]["code"], 7);
        assert_eq!(payload["library_error_context"]["library_name"], "reqwest");
        assert_eq!(
            payload["library_error_context"]["reason"],
            "connection refused"
        );
    }
}
