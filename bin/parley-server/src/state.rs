//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use parley_core::{ChatPipeline, ModelManager, TranscriptionPipeline};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Registry and handles of the language and speech models.
    pub models: Arc<ModelManager>,
    pub chat: ChatPipeline,
    pub transcription: TranscriptionPipeline,
}

impl AppState {
    pub fn new(config: Config, models: Arc<ModelManager>) -> Self {
        let chat = ChatPipeline::new(Arc::clone(&models), config.request_timeout);
        let transcription = TranscriptionPipeline::new(
            Arc::clone(&models),
            config.upload_dir.clone(),
            config.request_timeout,
        );
        Self {
            config: Arc::new(config),
            models,
            chat,
            transcription,
        }
    }
}
