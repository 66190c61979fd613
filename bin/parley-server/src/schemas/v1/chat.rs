//! OpenAI-compatible chat request / response types.
//!
//! Kept wire-compatible with the OpenAI REST API so existing SDK clients work
//! without modification.

use parley_core::chat::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use parley_core::{ChatCompletion, ChatRequest, FinishReason, Role};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Chat Completions ─────────────────────────────────────────────────────────

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<ChatRole> for Role {
    fn from(role: ChatRole) -> Self {
        match role {
            ChatRole::System => Role::System,
            ChatRole::User => Role::User,
            ChatRole::Assistant => Role::Assistant,
        }
    }
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => ChatRole::System,
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    /// The role of the message author (`"system"`, `"user"`, `"assistant"`).
    pub role: ChatRole,
    /// The content of the message.
    pub content: String,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// Accepted for client compatibility; the configured model always answers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    /// Conversation history, rendered through the model's chat template.
    pub messages: Vec<ChatMessage>,
    /// Streaming is not supported; `true` is rejected.
    #[serde(default)]
    pub stream: bool,
    /// Maximum tokens to generate (default 1000).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature; `0` is greedy (default 0.7).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
}

impl From<ChatCompletionRequest> for ChatRequest {
    fn from(request: ChatCompletionRequest) -> Self {
        let messages = request
            .messages
            .into_iter()
            .map(|m| parley_core::ChatMessage::new(m.role.into(), m.content))
            .collect();
        ChatRequest::new(messages)
            .with_temperature(request.temperature.unwrap_or(DEFAULT_TEMPERATURE))
            .with_max_tokens(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS))
    }
}

/// A single choice in the completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    /// Zero-based index of this choice.
    pub index: u32,
    /// The generated message.
    pub message: ChatMessage,
    /// Why generation stopped (`"stop"` or `"length"`).
    pub finish_reason: String,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatUsage {
    /// Tokens in the rendered prompt.
    pub prompt_tokens: usize,
    /// Tokens generated.
    pub completion_tokens: usize,
    /// Sum of the two.
    pub total_tokens: usize,
}

/// Response body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    /// Unique identifier for this completion.
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp of when the response was created.
    pub created: i64,
    /// Model that produced the completion.
    pub model: String,
    /// Generated choices; always exactly one.
    pub choices: Vec<ChatChoice>,
    /// Token usage for the request.
    pub usage: ChatUsage,
}

impl From<ChatCompletion> for ChatCompletionResponse {
    fn from(completion: ChatCompletion) -> Self {
        let finish_reason = match completion.finish_reason {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        };
        Self {
            id: completion.id,
            object: "chat.completion".into(),
            created: completion.created,
            model: completion.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: completion.message.role.into(),
                    content: completion.message.content,
                },
                finish_reason: finish_reason.into(),
            }],
            usage: ChatUsage {
                prompt_tokens: completion.usage.prompt_tokens,
                completion_tokens: completion.usage.completion_tokens,
                total_tokens: completion.usage.total_tokens,
            },
        }
    }
}
