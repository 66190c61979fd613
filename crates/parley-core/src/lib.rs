//! parley-core: model lifecycle, admission control and the two inference
//! pipelines behind the parley gateway.
//!
//! The HTTP layer only ever talks to [`ChatPipeline`] and
//! [`TranscriptionPipeline`].  Both borrow their models from a shared
//! [`ModelManager`], which owns every loaded model and the single-slot
//! [`AdmissionGate`] attached to it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use parley_core::{ChatPipeline, ChatRequest, ModelManager, Role, ChatMessage};
//! # async fn run(
//! #     language: Arc<dyn parley_core::runtime::LanguageModelLoader>,
//! #     speech: Arc<dyn parley_core::runtime::SpeechModelLoader>,
//! # ) -> Result<(), parley_core::CoreError> {
//! let models = Arc::new(ModelManager::new("my/model:q4.gguf", "my/whisper:tiny.bin", speech, 16));
//! models.load_language_model(language).await?;
//!
//! let chat = ChatPipeline::new(Arc::clone(&models), Duration::from_secs(300));
//! let completion = chat
//!     .complete(ChatRequest::new(vec![ChatMessage::new(Role::User, "Say hi")]))
//!     .await?;
//! println!("{}", completion.message.content);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod chat;
pub mod error;
pub mod lifecycle;
pub mod prompt;
pub mod registry;
pub mod runtime;
pub mod transcription;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use admission::{AdmissionGate, Permit};
pub use chat::{ChatCompletion, ChatPipeline, ChatRequest, Usage};
pub use error::CoreError;
pub use lifecycle::{LanguageModelHandle, ModelManager, SpeechModelHandle};
pub use prompt::{build_prompt, ChatMessage, ChatTemplate, Role};
pub use registry::{ModelKind, ModelRegistry, ModelState, ModelStatus};
pub use runtime::{FinishReason, Generation, GenerationParams, RuntimeError};
pub use transcription::{Transcription, TranscriptionJob, TranscriptionPipeline, Upload};
