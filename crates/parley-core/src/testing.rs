//! In-process fake runtimes for exercising the pipelines and the gateway
//! without model files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::lifecycle::ModelManager;
use crate::prompt::ChatTemplate;
use crate::runtime::{
    CancelSignal, FinishReason, Generation, GenerationParams, LanguageModel, LanguageModelLoader,
    RuntimeError, SpeechModel, SpeechModelLoader,
};

pub const LANGUAGE_MODEL_ID: &str = "test/llm-GGUF:llm.Q4_K_M.gguf";
pub const SPEECH_MODEL_ID: &str = "test/whisper:ggml-tiny.bin";

const POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
enum Behaviour {
    Reply(String),
    Fail(String),
    /// Runs until the caller cancels.
    Hang,
}

/// One recorded `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCall {
    pub prompt: String,
    pub params: GenerationParams,
}

pub struct FakeLanguageModel {
    behaviour: Behaviour,
    delay: Duration,
    template: Option<ChatTemplate>,
    calls: Mutex<Vec<GenerateCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    cancelled: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLanguageModel {
    fn with_behaviour(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            template: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_behaviour(Behaviour::Reply(text.into()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behaviour(Behaviour::Fail(message.into()))
    }

    pub fn hanging() -> Self {
        Self::with_behaviour(Behaviour::Hang)
    }

    /// Spend at least `delay` inside `generate`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Highest number of `generate` calls ever observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Calls that stopped because their cancel signal fired.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl LanguageModel for FakeLanguageModel {
    fn chat_template(&self) -> Option<&ChatTemplate> {
        self.template.as_ref()
    }

    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Generation, RuntimeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(GenerateCall {
                prompt: prompt.to_owned(),
                params: *params,
            });

        let deadline = Instant::now() + self.delay;
        loop {
            if cancel.is_cancelled() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(RuntimeError::Cancelled);
            }
            let hanging = matches!(self.behaviour, Behaviour::Hang);
            if !hanging && Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL);
        }

        match &self.behaviour {
            Behaviour::Reply(text) => Ok(Generation {
                text: text.clone(),
                prompt_tokens: prompt.split_whitespace().count(),
                completion_tokens: text.split_whitespace().count(),
                finish_reason: FinishReason::Stop,
            }),
            Behaviour::Fail(message) => Err(RuntimeError::Generation {
                source: anyhow::anyhow!("{message}"),
            }),
            Behaviour::Hang => Err(RuntimeError::Cancelled),
        }
    }
}

pub struct FakeLanguageLoader {
    outcome: Result<Arc<FakeLanguageModel>, String>,
}

impl FakeLanguageLoader {
    pub fn ok(model: Arc<FakeLanguageModel>) -> Self {
        Self { outcome: Ok(model) }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }
}

impl LanguageModelLoader for FakeLanguageLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn LanguageModel>, RuntimeError> {
        match &self.outcome {
            Ok(model) => Ok(Arc::clone(model) as Arc<dyn LanguageModel>),
            Err(message) => Err(RuntimeError::LoadModel {
                path: PathBuf::from(model_id),
                source: anyhow::anyhow!("{message}"),
            }),
        }
    }
}

/// What a fake transcription saw of its input.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeCall {
    pub audio: PathBuf,
    pub bytes: Vec<u8>,
}

pub struct FakeSpeechModel {
    outcome: Result<String, String>,
    delay: Duration,
    calls: Mutex<Vec<TranscribeCall>>,
}

impl FakeSpeechModel {
    pub fn transcribing(text: impl Into<String>) -> Self {
        Self {
            outcome: Ok(text.into()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<TranscribeCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SpeechModel for FakeSpeechModel {
    async fn transcribe(&self, audio: &Path, workdir: &Path) -> Result<String, RuntimeError> {
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: "fake-whisper".into(),
                source,
            })?;
        // Derived files land in the job directory like the real runtime's.
        tokio::fs::write(workdir.join("audio-16k.wav"), &bytes)
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: "fake-whisper".into(),
                source,
            })?;
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TranscribeCall {
                audio: audio.to_path_buf(),
                bytes,
            });

        tokio::time::sleep(self.delay).await;
        match &self.outcome {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(RuntimeError::ProcessFailed {
                program: "fake-whisper".into(),
                status: "exit status: 1".into(),
                stderr: message.clone(),
            }),
        }
    }
}

pub struct FakeSpeechLoader {
    model: Arc<FakeSpeechModel>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    delay: Duration,
}

impl FakeSpeechLoader {
    pub fn new(model: Arc<FakeSpeechModel>) -> Self {
        Self {
            model,
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Fail the first `n` load attempts.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Block inside `load` for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SpeechModelLoader for FakeSpeechLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn SpeechModel>, RuntimeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RuntimeError::Resolve {
                model_id: model_id.to_owned(),
                source: anyhow::anyhow!("hf-hub download failed: connection reset"),
            });
        }
        Ok(Arc::clone(&self.model) as Arc<dyn SpeechModel>)
    }
}

/// A manager with the fake speech loader attached and the fake language
/// model already loaded.
pub async fn ready_manager(
    language: Arc<FakeLanguageModel>,
    speech: Arc<FakeSpeechLoader>,
    max_queue: usize,
) -> Arc<ModelManager> {
    let manager = Arc::new(ModelManager::new(
        LANGUAGE_MODEL_ID,
        SPEECH_MODEL_ID,
        speech,
        max_queue,
    ));
    if let Err(e) = manager
        .load_language_model(Arc::new(FakeLanguageLoader::ok(language)))
        .await
    {
        panic!("fake language model failed to load: {e}");
    }
    manager
}
