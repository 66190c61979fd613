use std::time::Duration;

use thiserror::Error;

use crate::registry::{ModelKind, StateError};
use crate::runtime::RuntimeError;

/// Every failure a pipeline can report to its caller.
///
/// The gateway maps these to HTTP statuses in exactly one place, so a new
/// variant only needs a new arm there.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request is well-formed JSON but semantically unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model never became ready and will not for this process lifetime.
    #[error("{kind} model '{model_id}' is unavailable: {reason}")]
    ModelUnavailable {
        kind: ModelKind,
        model_id: String,
        reason: String,
    },

    /// A lazy load failed; the next request retries.
    #[error("failed to load {kind} model '{model_id}': {source}")]
    ModelLoad {
        kind: ModelKind,
        model_id: String,
        #[source]
        source: RuntimeError,
    },

    /// The admission queue in front of the model is full.
    #[error("{kind} model is busy ({waiting} requests already waiting)")]
    Busy { kind: ModelKind, waiting: usize },

    /// Queue wait plus inference exceeded the per-request deadline.
    #[error("{kind} request timed out after {}s", .after.as_secs())]
    Timeout { kind: ModelKind, after: Duration },

    /// The chat template could not be rendered.
    #[error("failed to build prompt: {0}")]
    Prompt(String),

    #[error(transparent)]
    Inference(#[from] RuntimeError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl CoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::Io {
            context: context.into(),
            source,
        }
    }
}
