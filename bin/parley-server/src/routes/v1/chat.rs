//! OpenAI-compatible chat-completion route.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::post;
use tracing::debug;
use utoipa::OpenApi;

use crate::error::{Json, ServerError};
use crate::schemas::v1::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, ChatUsage,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(chat_completions),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        ChatMessage,
        ChatRole,
        ChatChoice,
        ChatUsage
    ))
)]
pub struct ChatApi;

/// Register chat-completion routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// OpenAI chat completions (`POST /v1/chat/completions`).
///
/// The whole conversation is rendered through the model's chat template and
/// answered in one response. Requests queue FIFO behind the single
/// generation slot.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "chat",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion generated", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Generation failed"),
        (status = 503, description = "Model unavailable or queue full"),
        (status = 504, description = "Request timed out"),
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, ServerError> {
    debug!(
        messages = req.messages.len(),
        model = req.model.as_deref().unwrap_or_default(),
        "received chat completion request"
    );
    if req.stream {
        return Err(ServerError::BadRequest(
            "streaming responses are not supported; omit \"stream\" or set it to false".into(),
        ));
    }

    let completion = state.chat.complete(req.into()).await?;
    Ok(Json(completion.into()))
}
