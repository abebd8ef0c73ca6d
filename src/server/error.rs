use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::maskflow_core::EngineError;

/// Wire-level wrapper mapping the engine taxonomy onto HTTP status codes.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InvalidArgument(_) | EngineError::NothingToPropagate => {
                StatusCode::BAD_REQUEST
            }
            EngineError::SessionNotFound(_)
            | EngineError::ObjectNotFound(_)
            | EngineError::JobNotFound(_)
            | EngineError::VideoUnreadable(_) => StatusCode::NOT_FOUND,
            EngineError::VideoTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            EngineError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Segmenter(_)
            | EngineError::Cancelled
            | EngineError::SessionGone
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the log; the client gets the typed
        // message only.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
