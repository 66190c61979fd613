//! Chat completion: validated request in, one generation, envelope out.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::CoreError;
use crate::lifecycle::ModelManager;
use crate::prompt::{build_prompt, ChatMessage, Role};
use crate::runtime::{FinishReason, GenerationParams};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.messages.is_empty() {
            return Err(CoreError::InvalidRequest(
                "messages must contain at least one message".into(),
            ));
        }
        if let Some(index) = self.messages.iter().position(|m| m.content.is_empty()) {
            return Err(CoreError::InvalidRequest(format!(
                "messages[{index}].content must not be empty"
            )));
        }
        if self.max_tokens == 0 {
            return Err(CoreError::InvalidRequest(
                "max_tokens must be at least 1".into(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(CoreError::InvalidRequest(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    /// `chatcmpl-<uuid>`.
    pub id: String,
    /// Unix seconds.
    pub created: i64,
    pub model: String,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct ChatPipeline {
    models: Arc<ModelManager>,
    timeout: Duration,
}

impl ChatPipeline {
    /// `timeout` bounds the admission wait plus generation of each request.
    pub fn new(models: Arc<ModelManager>, timeout: Duration) -> Self {
        Self { models, timeout }
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, CoreError> {
        request.validate()?;
        let handle = self.models.language()?;

        let prompt = build_prompt(&request.messages, handle.chat_template())
            .inspect_err(|e| error!(error = %e, "failed to build prompt"))?;
        let params = request.params();
        let generation = handle
            .generate(prompt, params, self.timeout)
            .await
            .inspect_err(|e| error!(error = %e, "chat generation failed"))?;

        info!(
            messages = request.messages.len(),
            max_tokens = params.max_tokens,
            prompt_tokens = generation.prompt_tokens,
            completion_tokens = generation.completion_tokens,
            finish_reason = ?generation.finish_reason,
            "chat completion finished"
        );

        Ok(ChatCompletion {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: handle.model_id().to_owned(),
            message: ChatMessage::new(Role::Assistant, generation.text),
            finish_reason: generation.finish_reason,
            usage: Usage {
                prompt_tokens: generation.prompt_tokens,
                completion_tokens: generation.completion_tokens,
                total_tokens: generation.prompt_tokens + generation.completion_tokens,
            },
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::ModelKind;
    use crate::testing::{
        ready_manager, FakeLanguageLoader, FakeLanguageModel, FakeSpeechLoader, FakeSpeechModel,
        LANGUAGE_MODEL_ID, SPEECH_MODEL_ID,
    };
    use crate::ChatTemplate;
    use tracing_test::traced_test;

    fn speech() -> Arc<FakeSpeechLoader> {
        Arc::new(FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing(""))))
    }

    async fn pipeline(model: Arc<FakeLanguageModel>) -> ChatPipeline {
        ChatPipeline::new(
            ready_manager(model, speech(), 16).await,
            Duration::from_secs(5),
        )
    }

    fn user(text: &str) -> ChatMessage {
        ChatMessage::new(Role::User, text)
    }

    #[test]
    fn request_defaults_apply_when_omitted() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(request.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
        request.validate().unwrap();
    }

    #[test]
    fn unknown_role_is_a_shape_error() {
        let parsed: Result<ChatRequest, _> =
            serde_json::from_str(r#"{"messages":[{"role":"tool","content":"hi"}]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn validation_rejects_unusable_requests() {
        let cases = [
            ChatRequest::new(vec![]),
            ChatRequest::new(vec![user("hi"), user("")]),
            ChatRequest::new(vec![user("hi")]).with_max_tokens(0),
            ChatRequest::new(vec![user("hi")]).with_temperature(-0.1),
            ChatRequest::new(vec![user("hi")]).with_temperature(f32::NAN),
        ];
        for request in cases {
            assert!(
                matches!(request.validate(), Err(CoreError::InvalidRequest(_))),
                "{request:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn completion_comes_from_one_generation_with_unchanged_params() {
        let model = Arc::new(FakeLanguageModel::replying("Hello there."));
        let chat = pipeline(model.clone()).await;

        let completion = chat
            .complete(
                ChatRequest::new(vec![user("hi")])
                    .with_temperature(0.25)
                    .with_max_tokens(42),
            )
            .await
            .unwrap();

        assert_eq!(completion.message.role, Role::Assistant);
        assert_eq!(completion.message.content, "Hello there.");
        assert_eq!(completion.model, LANGUAGE_MODEL_ID);
        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        // The fake counts whitespace-separated words.
        assert_eq!(completion.usage.prompt_tokens, 3);
        assert_eq!(completion.usage.total_tokens, 3 + 2);

        let calls = model.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, "user: hi\nassistant: ");
        assert_eq!(
            calls[0].params,
            GenerationParams {
                max_tokens: 42,
                temperature: 0.25
            }
        );
    }

    #[tokio::test]
    async fn model_template_is_used_when_present() {
        let template = ChatTemplate::new(
            "{% for m in messages %}[{{ m.role }}]{{ m.content }}{% endfor %}{% if add_generation_prompt %}[assistant]{% endif %}",
            None,
            None,
        )
        .unwrap();
        let model = Arc::new(FakeLanguageModel::replying("ok").with_template(template));
        let chat = pipeline(model.clone()).await;

        chat.complete(ChatRequest::new(vec![
            ChatMessage::new(Role::System, "terse"),
            user("hi"),
        ]))
        .await
        .unwrap();
        assert_eq!(model.calls()[0].prompt, "[system]terse[user]hi[assistant]");
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_the_model() {
        let model = Arc::new(FakeLanguageModel::replying("unused"));
        let chat = pipeline(model.clone()).await;
        let err = chat.complete(ChatRequest::new(vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn generation_failure_is_logged_and_returned() {
        let chat = pipeline(Arc::new(FakeLanguageModel::failing("device lost"))).await;
        let err = chat
            .complete(ChatRequest::new(vec![user("hi")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device lost"));
        assert!(logs_contain("chat generation failed"));
    }

    #[tokio::test]
    async fn unavailable_model_is_reported() {
        let models = Arc::new(ModelManager::new(
            LANGUAGE_MODEL_ID,
            SPEECH_MODEL_ID,
            speech(),
            16,
        ));
        let _ = models
            .load_language_model(Arc::new(FakeLanguageLoader::failing("corrupt gguf")))
            .await;
        let chat = ChatPipeline::new(models, Duration::from_secs(5));

        let err = chat
            .complete(ChatRequest::new(vec![user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ModelUnavailable {
                kind: ModelKind::Language,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_overlap_and_run_in_order() {
        let model =
            Arc::new(FakeLanguageModel::replying("ok").with_delay(Duration::from_millis(20)));
        let chat = Arc::new(pipeline(model.clone()).await);
        let gate = chat.models().language().unwrap().gate().clone();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let chat = Arc::clone(&chat);
            tasks.push(tokio::spawn(async move {
                chat.complete(ChatRequest::new(vec![user(&format!("request {i}"))]))
                    .await
            }));
            // Request i holds the slot or is queued before i + 1 is sent.
            while model.calls().len() + gate.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        // Validation is not gated: a bad request fails fast while the
        // others are still generating or queued.
        let err = chat.complete(ChatRequest::new(vec![])).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
        assert!(!gate.is_idle());

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(model.max_concurrent(), 1);
        let prompts: Vec<String> = model.calls().into_iter().map(|c| c.prompt).collect();
        let expected: Vec<String> = (0..4)
            .map(|i| format!("user: request {i}\nassistant: "))
            .collect();
        assert_eq!(prompts, expected);
    }

    #[tokio::test]
    async fn full_queue_is_busy() {
        let model = Arc::new(FakeLanguageModel::hanging());
        let chat = Arc::new(ChatPipeline::new(
            ready_manager(model.clone(), speech(), 1).await,
            Duration::from_millis(300),
        ));
        let gate = chat.models().language().unwrap().gate().clone();

        let running = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.complete(ChatRequest::new(vec![user("a")])).await })
        };
        while !model.is_running() {
            tokio::task::yield_now().await;
        }
        let queued = {
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { chat.complete(ChatRequest::new(vec![user("b")])).await })
        };
        while gate.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        let err = chat
            .complete(ChatRequest::new(vec![user("c")]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy { .. }), "{err}");

        assert!(matches!(
            running.await.unwrap(),
            Err(CoreError::Timeout { .. })
        ));
        assert!(queued.await.unwrap().is_err());
    }
}
