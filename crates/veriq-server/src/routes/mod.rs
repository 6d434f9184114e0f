pub mod anchors;
pub mod intent;
pub mod leases;
pub mod receipts;
pub mod registry;
pub mod stream;
pub mod work;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use veriq_core::Platform;

use crate::error::AppError;
use crate::state::AppState;

/// Run a platform call on the blocking pool; redb transactions block.
pub(crate) async fn blocking<T, F>(app: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce(&Platform) -> veriq_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let platform = app.platform.clone();
    let result = tokio::task::spawn_blocking(move || f(&platform))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(result)
}

/// JSON body extractor whose rejections render the error envelope as
/// SCHEMA_INVALID instead of axum's plain-text reply.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(AppError::invalid(rejection.body_text())),
        }
    }
}
