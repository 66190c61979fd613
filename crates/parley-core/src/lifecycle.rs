//! Ownership and loading of the process-wide models.
//!
//! [`ModelManager`] is created once by the binary and shared as
//! `Arc<ModelManager>`.  The language model is loaded eagerly (before the
//! listener binds) and never changes afterwards; the speech model is loaded
//! on the first transcription request and cached.  Every inference call goes
//! through the handle's [`AdmissionGate`], so the model itself never sees two
//! concurrent calls.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::admission::AdmissionGate;
use crate::error::CoreError;
use crate::prompt::ChatTemplate;
use crate::registry::{ModelKind, ModelRegistry, ModelState, ModelStatus};
use crate::runtime::{
    cancel_pair, Generation, GenerationParams, LanguageModel, LanguageModelLoader, RuntimeError,
    SpeechModel, SpeechModelLoader,
};

/// The loaded language model plus its admission gate.
pub struct LanguageModelHandle {
    model_id: String,
    model: Arc<dyn LanguageModel>,
    gate: AdmissionGate,
}

impl std::fmt::Debug for LanguageModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelHandle")
            .field("model_id", &self.model_id)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl LanguageModelHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn chat_template(&self) -> Option<&ChatTemplate> {
        self.model.chat_template()
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Run one generation under the admission gate.
    ///
    /// `timeout` covers the queue wait and the generation itself.  The
    /// permit travels into the blocking task: when the caller goes away
    /// (timeout or dropped future) the cancel signal fires, but the slot
    /// stays taken until the model has actually returned.
    pub async fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
        timeout: Duration,
    ) -> Result<Generation, CoreError> {
        let run = async {
            let permit = self.gate.acquire().await?;
            let (_cancel_on_drop, cancel) = cancel_pair();
            let model = Arc::clone(&self.model);
            let started = Instant::now();

            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                model.generate(&prompt, &params, &cancel)
            })
            .await;

            let generation = match joined {
                Ok(result) => result?,
                Err(e) => {
                    return Err(CoreError::Inference(RuntimeError::Generation {
                        source: anyhow::anyhow!("generation task failed: {e}"),
                    }));
                }
            };
            debug!(
                prompt_tokens = generation.prompt_tokens,
                completion_tokens = generation.completion_tokens,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "generation finished"
            );
            Ok::<_, CoreError>(generation)
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| CoreError::Timeout {
                kind: ModelKind::Language,
                after: timeout,
            })?
    }
}

/// The loaded speech model plus its admission gate.
pub struct SpeechModelHandle {
    model_id: String,
    model: Arc<dyn SpeechModel>,
    gate: AdmissionGate,
}

impl std::fmt::Debug for SpeechModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechModelHandle")
            .field("model_id", &self.model_id)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl SpeechModelHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Transcribe `audio` under the admission gate.  Dropping the future
    /// (timeout included) aborts the runtime's work.
    pub async fn transcribe(
        &self,
        audio: &Path,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<String, CoreError> {
        let run = async {
            let _permit = self.gate.acquire().await?;
            Ok::<_, CoreError>(self.model.transcribe(audio, workdir).await?)
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| CoreError::Timeout {
                kind: ModelKind::Speech,
                after: timeout,
            })?
    }
}

/// Returns a `Loading` entry to `Failed` if the load future is dropped
/// before the loader reports back.
struct LoadingGuard<'a> {
    registry: &'a ModelRegistry,
    kind: ModelKind,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.registry.mark_failed(self.kind, "load abandoned");
        }
    }
}

pub struct ModelManager {
    registry: ModelRegistry,
    language: OnceLock<Arc<LanguageModelHandle>>,
    speech_loader: Arc<dyn SpeechModelLoader>,
    speech: OnceLock<Arc<SpeechModelHandle>>,
    /// Serializes lazy speech loads; callers queue here like inference calls.
    speech_load_gate: AdmissionGate,
    max_queue: usize,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("registry", &self.registry)
            .field("max_queue", &self.max_queue)
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    /// `max_queue` bounds how many requests may wait on each model's gate.
    pub fn new(
        language_id: impl Into<String>,
        speech_id: impl Into<String>,
        speech_loader: Arc<dyn SpeechModelLoader>,
        max_queue: usize,
    ) -> Self {
        Self {
            registry: ModelRegistry::new(language_id, speech_id),
            language: OnceLock::new(),
            speech_loader,
            speech: OnceLock::new(),
            speech_load_gate: AdmissionGate::new(ModelKind::Speech, max_queue),
            max_queue,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Identifiers and readiness of both models.
    pub fn status(&self) -> Vec<ModelStatus> {
        self.registry.snapshot()
    }

    /// Run `load` on the blocking pool, recording the state transitions.
    async fn load_blocking<T, F>(&self, kind: ModelKind, load: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&str) -> Result<T, RuntimeError> + Send + 'static,
    {
        self.registry.begin_loading(kind)?;
        let mut guard = LoadingGuard {
            registry: &self.registry,
            kind,
            armed: true,
        };

        let model_id = self.registry.id(kind).to_owned();
        let id = model_id.clone();
        let started = Instant::now();
        let outcome = match tokio::task::spawn_blocking(move || load(&id)).await {
            Ok(result) => result,
            Err(e) => Err(RuntimeError::LoadModel {
                path: PathBuf::from(&model_id),
                source: anyhow::anyhow!("loader task failed: {e}"),
            }),
        };
        guard.armed = false;

        match outcome {
            Ok(model) => {
                self.registry.mark_ready(kind)?;
                info!(
                    model = %model_id,
                    %kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                Ok(model)
            }
            Err(source) => {
                self.registry.mark_failed(kind, source.to_string())?;
                Err(CoreError::ModelLoad {
                    kind,
                    model_id,
                    source,
                })
            }
        }
    }

    /// Load the configured language model.  Called once at startup; a
    /// failure is permanent for the process.
    pub async fn load_language_model(
        &self,
        loader: Arc<dyn LanguageModelLoader>,
    ) -> Result<Arc<LanguageModelHandle>, CoreError> {
        let model = self
            .load_blocking(ModelKind::Language, move |id| loader.load(id))
            .await?;
        let handle = Arc::new(LanguageModelHandle {
            model_id: self.registry.id(ModelKind::Language).to_owned(),
            model,
            gate: AdmissionGate::new(ModelKind::Language, self.max_queue),
        });
        // `begin_loading` only succeeds once, so the cell is always empty here.
        let _ = self.language.set(Arc::clone(&handle));
        Ok(handle)
    }

    /// The language model, or [`CoreError::ModelUnavailable`] if it never
    /// loaded.
    pub fn language(&self) -> Result<Arc<LanguageModelHandle>, CoreError> {
        if let Some(handle) = self.language.get() {
            return Ok(Arc::clone(handle));
        }
        let reason = match self.registry.state(ModelKind::Language) {
            ModelState::Failed { reason, .. } => reason,
            ModelState::Loading => "model is still loading".to_owned(),
            ModelState::Unloaded | ModelState::Ready => "model was not loaded".to_owned(),
        };
        Err(CoreError::ModelUnavailable {
            kind: ModelKind::Language,
            model_id: self.registry.id(ModelKind::Language).to_owned(),
            reason,
        })
    }

    /// Get or load the speech model.  Concurrent first calls share one load;
    /// a failed load is retried by the next call.
    ///
    /// Callers waiting for a load count against `max_queue` and get
    /// [`CoreError::Busy`] beyond it.  Dropping the future (e.g. on a request
    /// timeout) abandons the load.
    pub async fn speech_model(&self) -> Result<Arc<SpeechModelHandle>, CoreError> {
        if let Some(handle) = self.speech.get() {
            return Ok(Arc::clone(handle));
        }

        let _permit = self.speech_load_gate.acquire().await?;
        // The previous permit holder may have finished the load.
        if let Some(handle) = self.speech.get() {
            return Ok(Arc::clone(handle));
        }

        let loader = Arc::clone(&self.speech_loader);
        let model = self
            .load_blocking(ModelKind::Speech, move |id| loader.load(id))
            .await?;
        let handle = Arc::new(SpeechModelHandle {
            model_id: self.registry.id(ModelKind::Speech).to_owned(),
            model,
            gate: AdmissionGate::new(ModelKind::Speech, self.max_queue),
        });
        // Loads are serialized by the gate, so the cell is still empty here.
        let _ = self.speech.set(Arc::clone(&handle));
        Ok(handle)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{
        ready_manager, FakeLanguageLoader, FakeLanguageModel, FakeSpeechLoader, FakeSpeechModel,
        LANGUAGE_MODEL_ID, SPEECH_MODEL_ID,
    };

    fn params() -> GenerationParams {
        GenerationParams {
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    fn speech_loader() -> Arc<FakeSpeechLoader> {
        Arc::new(FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing(
            "hello",
        ))))
    }

    #[tokio::test]
    async fn language_model_is_ready_after_load() {
        let manager = ready_manager(
            Arc::new(FakeLanguageModel::replying("ok")),
            speech_loader(),
            4,
        )
        .await;

        let handle = manager.language().unwrap();
        assert_eq!(handle.model_id(), LANGUAGE_MODEL_ID);
        assert!(manager.registry().state(ModelKind::Language).is_ready());
        assert_eq!(
            manager.registry().state(ModelKind::Speech),
            ModelState::Unloaded
        );
    }

    #[tokio::test]
    async fn failed_language_load_makes_chat_unavailable() {
        let manager = ModelManager::new(LANGUAGE_MODEL_ID, SPEECH_MODEL_ID, speech_loader(), 4);
        let err = manager
            .load_language_model(Arc::new(FakeLanguageLoader::failing("no such file")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ModelLoad { kind: ModelKind::Language, .. }));

        match manager.language().unwrap_err() {
            CoreError::ModelUnavailable { model_id, reason, .. } => {
                assert_eq!(model_id, LANGUAGE_MODEL_ID);
                assert!(reason.contains("no such file"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Permanent: a second attempt is refused by the registry.
        let again = manager
            .load_language_model(Arc::new(FakeLanguageLoader::ok(Arc::new(
                FakeLanguageModel::replying("late"),
            ))))
            .await
            .unwrap_err();
        assert!(matches!(again, CoreError::State(_)));
    }

    #[tokio::test]
    async fn speech_model_loads_lazily_once() {
        let loader = Arc::new(
            FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing("hi")))
                .with_delay(Duration::from_millis(30)),
        );
        let manager = Arc::new(ModelManager::new(
            LANGUAGE_MODEL_ID,
            SPEECH_MODEL_ID,
            loader.clone(),
            4,
        ));
        assert_eq!(loader.attempts(), 0);

        let (a, b) = tokio::join!(manager.speech_model(), manager.speech_model());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(loader.attempts(), 1);

        manager.speech_model().await.unwrap();
        assert_eq!(loader.attempts(), 1);
        assert!(manager.registry().state(ModelKind::Speech).is_ready());
    }

    #[tokio::test]
    async fn speech_load_failure_is_retried() {
        let loader = Arc::new(
            FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing("hi"))).failing_first(1),
        );
        let manager = ModelManager::new(LANGUAGE_MODEL_ID, SPEECH_MODEL_ID, loader.clone(), 4);

        let err = manager.speech_model().await.unwrap_err();
        assert!(matches!(err, CoreError::ModelLoad { kind: ModelKind::Speech, .. }));
        assert!(matches!(
            manager.registry().state(ModelKind::Speech),
            ModelState::Failed { retryable: true, .. }
        ));

        manager.speech_model().await.expect("second attempt loads");
        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test]
    async fn abandoned_speech_load_can_be_retried() {
        let loader = Arc::new(
            FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing("hi")))
                .with_delay(Duration::from_millis(50)),
        );
        let manager = ModelManager::new(LANGUAGE_MODEL_ID, SPEECH_MODEL_ID, loader.clone(), 4);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), manager.speech_model()).await;
        assert!(abandoned.is_err());
        assert!(matches!(
            manager.registry().state(ModelKind::Speech),
            ModelState::Failed { .. }
        ));

        manager.speech_model().await.expect("retry after abandon");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn speech_load_waiters_are_bounded() {
        let loader = Arc::new(
            FakeSpeechLoader::new(Arc::new(FakeSpeechModel::transcribing("hi")))
                .with_delay(Duration::from_millis(200)),
        );
        let manager = Arc::new(ModelManager::new(
            LANGUAGE_MODEL_ID,
            SPEECH_MODEL_ID,
            loader.clone(),
            1,
        ));

        let loading = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.speech_model().await.map(|_| ()) }
        });
        while loader.attempts() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let queued = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.speech_model().await.map(|_| ()) }
        });
        while manager.speech_load_gate.waiting() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = manager.speech_model().await.unwrap_err();
        assert!(
            matches!(err, CoreError::Busy { kind: ModelKind::Speech, .. }),
            "unexpected error: {err}"
        );

        loading.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
        assert_eq!(loader.attempts(), 1);
    }

    #[tokio::test]
    async fn generation_timeout_cancels_and_keeps_slot_until_stopped() {
        let model = Arc::new(FakeLanguageModel::hanging());
        let manager = ready_manager(model.clone(), speech_loader(), 4).await;
        let handle = manager.language().unwrap();

        let err = handle
            .generate("hi".into(), params(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { kind: ModelKind::Language, .. }));

        // The blocking task notices the cancel signal and releases the slot.
        for _ in 0..500 {
            if handle.gate().is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(handle.gate().is_idle());
        assert_eq!(model.cancelled(), 1);
        assert!(!model.is_running());
    }

    #[tokio::test]
    async fn runtime_errors_surface_as_inference_errors() {
        let manager = ready_manager(
            Arc::new(FakeLanguageModel::failing("tensor shape mismatch")),
            speech_loader(),
            4,
        )
        .await;
        let err = manager
            .language()
            .unwrap()
            .generate("hi".into(), params(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Inference(RuntimeError::Generation { .. })));
        assert!(err.to_string().contains("tensor shape mismatch"));
    }
}
