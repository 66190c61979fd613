pub mod audio;
pub mod chat;
pub mod models;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::config::Config;
use crate::state::AppState;

/// Routes nested under `/v1` (OpenAI-compatible).
pub fn router(config: &Config) -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(audio::router(config.max_upload_bytes))
        .merge(models::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut spec = V1Api::openapi();
    spec.merge(audio::AudioApi::openapi());
    spec.merge(chat::ChatApi::openapi());
    spec.merge(models::ModelsApi::openapi());
    spec
}
