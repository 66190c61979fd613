//! Model listing (`GET /v1/models`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parley_core::ModelKind;
use utoipa::OpenApi;

use crate::schemas::v1::models::{ModelInfo, ModelListResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelInfo, ModelListResponse)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// List the configured language model.
///
/// Answers regardless of whether the model has finished (or failed) loading.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Configured models", body = ModelListResponse)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelListResponse> {
    let id = state.models.registry().id(ModelKind::Language).to_owned();
    Json(ModelListResponse {
        object: "list".into(),
        data: vec![ModelInfo {
            id,
            object: "model".into(),
            owned_by: "parley".into(),
        }],
    })
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parley_core::testing::{
        FakeLanguageModel, FakeSpeechLoader, FakeSpeechModel, LANGUAGE_MODEL_ID, ready_manager,
    };

    use super::*;
    use crate::routes::test_support::{app, config, send, unavailable_manager};

    fn speech() -> Arc<FakeSpeechLoader> {
        Arc::new(FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing(""))))
    }

    fn request() -> Request<Body> {
        Request::get("/v1/models").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn lists_the_language_model() {
        let models = ready_manager(Arc::new(FakeLanguageModel::replying("hi")), speech(), 16).await;
        let (status, _, body) = send(app(config(), models), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], LANGUAGE_MODEL_ID);
        assert_eq!(body["data"][0]["object"], "model");
        assert_eq!(body["data"][0]["owned_by"], "parley");
    }

    #[tokio::test]
    async fn lists_even_when_the_model_failed_to_load() {
        let models = unavailable_manager(speech()).await;
        let (status, _, body) = send(app(config(), models), request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], LANGUAGE_MODEL_ID);
    }
}
