//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional OpenAPI document endpoint (disable with `PARLEY_ENABLE_DOCS=false`)
//! - Health / heartbeat route
//! - OpenAI-compatible `/v1` routes

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware};

use crate::middleware::{cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router(&state.config));

    if state.config.enable_docs {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || {
                let api_doc = api_doc.clone();
                async move { Json(api_doc) }
            }),
        );
    }

    app
        // Outermost layers execute first on the way in.
        .layer(cors::cors_layer(&state.config))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode, header};
    use parley_core::ModelManager;
    use parley_core::testing::{
        FakeLanguageLoader, FakeLanguageModel, FakeSpeechLoader, LANGUAGE_MODEL_ID,
        SPEECH_MODEL_ID, ready_manager,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::state::AppState;

    pub const BOUNDARY: &str = "parley-test-boundary";

    pub fn config() -> Config {
        Config {
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    pub async fn ready_state(
        language: Arc<FakeLanguageModel>,
        speech: Arc<FakeSpeechLoader>,
    ) -> Arc<AppState> {
        Arc::new(AppState::new(config(), ready_manager(language, speech, 16).await))
    }

    /// A manager whose language model failed to load.
    pub async fn unavailable_manager(speech: Arc<FakeSpeechLoader>) -> Arc<ModelManager> {
        let manager = Arc::new(ModelManager::new(
            LANGUAGE_MODEL_ID,
            SPEECH_MODEL_ID,
            speech,
            16,
        ));
        let loaded = manager
            .load_language_model(Arc::new(FakeLanguageLoader::failing("no such file")))
            .await;
        assert!(loaded.is_err());
        manager
    }

    pub fn app(config: Config, models: Arc<ModelManager>) -> Router {
        super::build(Arc::new(AppState::new(config, models)))
    }

    pub fn json_request(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// One multipart form field.
    pub struct Part {
        name: &'static str,
        filename: Option<&'static str>,
        bytes: Vec<u8>,
    }

    pub fn file_part(name: &'static str, filename: &'static str, bytes: impl AsRef<[u8]>) -> Part {
        Part {
            name,
            filename: Some(filename),
            bytes: bytes.as_ref().to_vec(),
        }
    }

    pub fn text_part(name: &'static str, value: &str) -> Part {
        Part {
            name,
            filename: None,
            bytes: value.as_bytes().to_vec(),
        }
    }

    pub fn multipart_request(uri: &str, parts: &[Part]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match part.filename {
                Some(filename) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name
                ),
                None => format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(&part.bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, headers, value)
    }
}
