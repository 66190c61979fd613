//! Model identities and readiness states.
//!
//! The registry is the single source of truth for "which model is
//! configured" and "can it serve requests right now".  Loading itself lives
//! in [`crate::lifecycle`]; the registry only validates and records the
//! transitions:
//!
//! ```text
//! Unloaded ──► Loading ──► Ready
//!                 │
//!                 └──► Failed { retryable } ──(retryable only)──► Loading
//! ```
//!
//! Language-model failures are permanent; speech-model failures are
//! retryable.  Nothing ever leaves `Ready`.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Which of the two process-wide models an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Language,
    Speech,
}

impl ModelKind {
    /// Whether a failed load may be attempted again.
    pub fn retries_after_failure(self) -> bool {
        matches!(self, ModelKind::Speech)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Language => f.write_str("language"),
            ModelKind::Speech => f.write_str("speech"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed { reason: String, retryable: bool },
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready)
    }

    fn name(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Failed { retryable: true, .. } => "failed_transient",
            ModelState::Failed { retryable: false, .. } => "failed",
        }
    }

    fn can_become(&self, next: &ModelState) -> bool {
        matches!(
            (self, next),
            (ModelState::Unloaded, ModelState::Loading)
                | (ModelState::Loading, ModelState::Ready)
                | (ModelState::Loading, ModelState::Failed { .. })
                | (ModelState::Failed { retryable: true, .. }, ModelState::Loading)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {kind} model transition: {from} -> {to}")]
pub struct StateError {
    pub kind: ModelKind,
    pub from: &'static str,
    pub to: &'static str,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub kind: ModelKind,
    #[serde(flatten)]
    pub state: ModelState,
}

#[derive(Debug)]
struct ModelEntry {
    id: String,
    kind: ModelKind,
    state: RwLock<ModelState>,
}

impl ModelEntry {
    fn new(kind: ModelKind, id: String) -> Self {
        Self {
            id,
            kind,
            state: RwLock::new(ModelState::Unloaded),
        }
    }

    fn state(&self) -> ModelState {
        // The guarded value is a plain enum; a panic elsewhere cannot leave
        // it half-written.
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, next: ModelState) -> Result<(), StateError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.can_become(&next) {
            return Err(StateError {
                kind: self.kind,
                from: state.name(),
                to: next.name(),
            });
        }
        *state = next;
        Ok(())
    }
}

/// Identity and readiness of the language and speech models.
#[derive(Debug)]
pub struct ModelRegistry {
    language: ModelEntry,
    speech: ModelEntry,
}

impl ModelRegistry {
    pub fn new(language_id: impl Into<String>, speech_id: impl Into<String>) -> Self {
        Self {
            language: ModelEntry::new(ModelKind::Language, language_id.into()),
            speech: ModelEntry::new(ModelKind::Speech, speech_id.into()),
        }
    }

    fn entry(&self, kind: ModelKind) -> &ModelEntry {
        match kind {
            ModelKind::Language => &self.language,
            ModelKind::Speech => &self.speech,
        }
    }

    /// The configured identifier, independent of load state.
    pub fn id(&self, kind: ModelKind) -> &str {
        &self.entry(kind).id
    }

    pub fn state(&self, kind: ModelKind) -> ModelState {
        self.entry(kind).state()
    }

    pub fn begin_loading(&self, kind: ModelKind) -> Result<(), StateError> {
        let entry = self.entry(kind);
        entry.transition(ModelState::Loading)?;
        info!(model = %entry.id, %kind, "loading model");
        Ok(())
    }

    pub fn mark_ready(&self, kind: ModelKind) -> Result<(), StateError> {
        let entry = self.entry(kind);
        entry.transition(ModelState::Ready)?;
        info!(model = %entry.id, %kind, "model ready");
        Ok(())
    }

    /// Record a failed load.  Retryability follows the model kind.
    pub fn mark_failed(&self, kind: ModelKind, reason: impl Into<String>) -> Result<(), StateError> {
        let entry = self.entry(kind);
        let reason = reason.into();
        let retryable = kind.retries_after_failure();
        warn!(model = %entry.id, %kind, retryable, reason = %reason, "model load failed");
        entry.transition(ModelState::Failed { reason, retryable })
    }

    pub fn snapshot(&self) -> Vec<ModelStatus> {
        [&self.language, &self.speech]
            .into_iter()
            .map(|entry| ModelStatus {
                id: entry.id.clone(),
                kind: entry.kind,
                state: entry.state(),
            })
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
