use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use veriq_core::error::{ErrorCode, PlatformError};

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses. Renders the standard envelope
/// `{ "error": { "code", "message", "detail"? } }`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// A malformed request body or query; surfaces as SCHEMA_INVALID.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self(
            PlatformError::SchemaInvalid {
                message: msg.into(),
                detail: None,
            }
            .into(),
        )
    }
}

fn envelope(code: ErrorCode, message: String, detail: Option<serde_json::Value>) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut error = serde_json::json!({ "code": code, "message": message });
    if let Some(detail) = detail {
        error["detail"] = detail;
    }
    (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let Some(e) = self.0.downcast_ref::<PlatformError>() else {
            tracing::error!(error = %format!("{:#}", self.0), "unhandled server error");
            return envelope(ErrorCode::Internal, "internal error".into(), None);
        };
        let code = e.code();
        if code == ErrorCode::Internal {
            // Storage and key faults stay in the log.
            tracing::error!(error = %e, "internal platform error");
            return envelope(code, "internal error".into(), None);
        }
        envelope(code, e.to_string(), e.detail())
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    fn status_of(err: PlatformError) -> StatusCode {
        AppError(err.into()).into_response().status()
    }

    #[test]
    fn schema_invalid_maps_to_422() {
        assert_eq!(
            status_of(PlatformError::SchemaInvalid {
                message: "x".into(),
                detail: None
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn dual_control_maps_to_403() {
        assert_eq!(
            status_of(PlatformError::DualControlRequired {
                topic: "vcx:commit".into()
            }),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn plan_conflict_and_lease_expired_map_to_409() {
        assert_eq!(
            status_of(PlatformError::PlanConflict("p".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PlatformError::LeaseExpired {
                work_id: "w".into(),
                worker_id: "x".into()
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn missing_records_map_to_404() {
        assert_eq!(
            status_of(PlatformError::ReceiptNotFound("c".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(PlatformError::WorkNotFound("w".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn worker_unavailable_maps_to_503() {
        let err = AppError(
            PlatformError::WorkerUnavailable {
                work_id: "w".into(),
                attempts: 3,
            }
            .into(),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn storage_errors_map_to_500() {
        assert_eq!(
            status_of(PlatformError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn foreign_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_is_json() {
        let response = AppError::invalid("bad body").into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
