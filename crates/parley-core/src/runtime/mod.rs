//! Narrow interfaces to the inference runtimes, plus the shipped
//! implementations.
//!
//! The pipelines never see a concrete runtime: they hold
//! `Arc<dyn LanguageModel>` / `Arc<dyn SpeechModel>` handed out by the
//! loaders at startup (language) or on first use (speech).

#[cfg(feature = "candle")]
pub mod candle;
pub mod source;
pub mod whisper_cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::prompt::ChatTemplate;

/// Sampling knobs forwarded verbatim from the chat request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    /// `0.0` selects greedy decoding.
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model emitted an end-of-turn token.
    Stop,
    /// The token budget (or the model context) ran out.
    Length,
}

/// Complete output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub finish_reason: FinishReason,
}

/// Read side of a cancellation flag; becomes `true` once the request that
/// owns the call is gone (client disconnect or timeout).
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelSignal(rx)
    }
}

/// Write side of a [`CancelSignal`]; fires when dropped.
#[derive(Debug)]
pub struct CancelOnDrop(watch::Sender<bool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        // No receivers left means the call already finished.
        let _ = self.0.send(true);
    }
}

pub fn cancel_pair() -> (CancelOnDrop, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelOnDrop(tx), CancelSignal(rx))
}

/// Errors produced by the runtimes themselves.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("model '{model_id}' could not be resolved: {source}")]
    Resolve {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load model from {path}: {source}")]
    LoadModel {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load tokenizer from {path}: {message}")]
    LoadTokenizer { path: PathBuf, message: String },

    #[error("tokenizer error: {message}")]
    Tokenize { message: String },

    #[error("prompt is {prompt_tokens} tokens but the model context holds {context_length}")]
    PromptTooLong {
        prompt_tokens: usize,
        context_length: usize,
    },

    #[error("generation failed: {source}")]
    Generation {
        #[source]
        source: anyhow::Error,
    },

    #[error("generation cancelled")]
    Cancelled,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// A loaded language model together with its tokenizer.
///
/// Implementations may assume calls are serialized by the caller's
/// admission gate; `generate` runs on the blocking pool.
pub trait LanguageModel: Send + Sync {
    /// The model's own chat format, when the tokenizer ships one.
    fn chat_template(&self) -> Option<&ChatTemplate>;

    /// Produce the full continuation of `prompt`.  Should poll `cancel`
    /// between tokens and return [`RuntimeError::Cancelled`] once it fires.
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Generation, RuntimeError>;
}

/// `load(modelId) -> (model, tokenizer)`.  Blocking.
pub trait LanguageModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn LanguageModel>, RuntimeError>;
}

/// A loaded speech-recognition model.
#[async_trait]
pub trait SpeechModel: Send + Sync {
    /// Transcribe the audio file at `audio`.  Scratch files go under
    /// `workdir`, which the caller removes afterwards.  Dropping the returned
    /// future must abort the work.
    async fn transcribe(&self, audio: &Path, workdir: &Path) -> Result<String, RuntimeError>;
}

/// Resolves a speech model identifier to a ready model.  Blocking.
pub trait SpeechModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn SpeechModel>, RuntimeError>;
}
