//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so failures become a
//! `{"detail": "..."}` body with the matching status code. This is the only
//! place pipeline errors are mapped to HTTP statuses.

use axum::extract::FromRequest;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_core::{CoreError, RuntimeError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// All errors that can occur in the parley-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from a chat or transcription pipeline.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The caller sent an invalid or malformed request.
    #[error("{0}")]
    BadRequest(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Core(e) => match e {
                CoreError::InvalidRequest(_)
                | CoreError::Inference(RuntimeError::PromptTooLong { .. }) => {
                    StatusCode::BAD_REQUEST
                }
                CoreError::ModelUnavailable { .. } | CoreError::Busy { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                CoreError::ModelLoad { .. }
                | CoreError::Prompt(_)
                | CoreError::Inference(_)
                | CoreError::Io { .. }
                | CoreError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %detail, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %detail, "request rejected");
        }
        (status, axum::Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for ServerError {
    fn from(rejection: MultipartRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartError> for ServerError {
    fn from(e: MultipartError) -> Self {
        ServerError::BadRequest(format!("invalid multipart body: {}", e.body_text()))
    }
}

/// `axum::Json` whose rejections render as [`ServerError`].
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ServerError))]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}
