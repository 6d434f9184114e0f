use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Canonical wire codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaInvalid,
    PolicyBlocked,
    DualControlRequired,
    PlanConflict,
    LeaseExpired,
    IdemDuplicate,
    WorkerUnavailable,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SchemaInvalid => "SCHEMA_INVALID",
            ErrorCode::PolicyBlocked => "POLICY_BLOCKED",
            ErrorCode::DualControlRequired => "DUAL_CONTROL_REQUIRED",
            ErrorCode::PlanConflict => "PLAN_CONFLICT",
            ErrorCode::LeaseExpired => "LEASE_EXPIRED",
            ErrorCode::IdemDuplicate => "IDEM_DUPLICATE",
            ErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::SchemaInvalid => 422,
            ErrorCode::PolicyBlocked | ErrorCode::DualControlRequired => 403,
            ErrorCode::PlanConflict | ErrorCode::LeaseExpired => 409,
            ErrorCode::IdemDuplicate => 200,
            ErrorCode::WorkerUnavailable => 503,
            ErrorCode::NotFound => 404,
            ErrorCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlatformError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("canonicalization failed: {0}")]
    Canonical(String),

    #[error("schema invalid: {message}")]
    SchemaInvalid {
        message: String,
        detail: Option<serde_json::Value>,
    },

    #[error("unknown action {schema_id}:{version}")]
    UnknownAction { schema_id: String, version: u32 },

    #[error("blocked by policy rule '{rule}': {reason}")]
    PolicyBlocked { rule: String, reason: String },

    #[error("confirmation phrase required for topic '{topic}'")]
    DualControlRequired { topic: String },

    #[error("no live preview for plan {0}")]
    PlanConflict(String),

    #[error("lease on {work_id} is not held by {worker_id} or has expired")]
    LeaseExpired { work_id: String, worker_id: String },

    #[error("work item {work_id} exhausted {attempts} lease attempts")]
    WorkerUnavailable { work_id: String, attempts: u32 },

    #[error("work not found: {0}")]
    WorkNotFound(String),

    #[error("receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("anchor not found: {0}")]
    AnchorNotFound(String),

    #[error("signing key not found: {0}")]
    KeyNotFound(String),

    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PlatformError {
    /// The canonical code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            PlatformError::Canonical(_)
            | PlatformError::SchemaInvalid { .. }
            | PlatformError::UnknownAction { .. } => ErrorCode::SchemaInvalid,
            PlatformError::PolicyBlocked { .. } => ErrorCode::PolicyBlocked,
            PlatformError::DualControlRequired { .. } => ErrorCode::DualControlRequired,
            PlatformError::PlanConflict(_) => ErrorCode::PlanConflict,
            PlatformError::LeaseExpired { .. } => ErrorCode::LeaseExpired,
            PlatformError::WorkerUnavailable { .. } => ErrorCode::WorkerUnavailable,
            PlatformError::WorkNotFound(_)
            | PlatformError::ReceiptNotFound(_)
            | PlatformError::AnchorNotFound(_)
            | PlatformError::KeyNotFound(_)
            | PlatformError::SchemaNotFound(_) => ErrorCode::NotFound,
            PlatformError::KeyMaterial(_)
            | PlatformError::InvalidConfig(_)
            | PlatformError::Storage(_)
            | PlatformError::Internal(_)
            | PlatformError::Io(_)
            | PlatformError::Yaml(_)
            | PlatformError::Json(_) => ErrorCode::Internal,
        }
    }

    /// Structured detail for the error envelope, if any.
    pub fn detail(&self) -> Option<serde_json::Value> {
        match self {
            PlatformError::SchemaInvalid { detail, .. } => detail.clone(),
            PlatformError::PolicyBlocked { rule, reason } => {
                Some(serde_json::json!({ "rule": rule, "reason": reason }))
            }
            PlatformError::DualControlRequired { topic } => {
                Some(serde_json::json!({ "topic": topic }))
            }
            PlatformError::WorkerUnavailable { work_id, attempts } => {
                Some(serde_json::json!({ "work_id": work_id, "attempts": attempts }))
            }
            _ => None,
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        PlatformError::SchemaInvalid {
            message: message.into(),
            detail: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_status() {
        assert_eq!(ErrorCode::SchemaInvalid.http_status(), 422);
        assert_eq!(ErrorCode::DualControlRequired.http_status(), 403);
        assert_eq!(ErrorCode::LeaseExpired.http_status(), 409);
        assert_eq!(ErrorCode::WorkerUnavailable.http_status(), 503);
    }

    #[test]
    fn storage_errors_surface_as_internal() {
        let err = PlatformError::Storage("disk gone".into());
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.code().as_str(), "INTERNAL");
    }

    #[test]
    fn canonical_failures_are_schema_errors() {
        let err = PlatformError::Canonical("NaN".into());
        assert_eq!(err.code(), ErrorCode::SchemaInvalid);
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let s = serde_json::to_string(&ErrorCode::PlanConflict).unwrap();
        assert_eq!(s, "\"PLAN_CONFLICT\"");
    }
}
