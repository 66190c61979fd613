//! Speech-to-text for uploaded audio.
//!
//! Each upload becomes a [`TranscriptionJob`]: a private directory
//! `<upload_dir>/parley-<uuid>/` holding the uploaded bytes and whatever the
//! runtime derives from them.  The directory is removed when the job is
//! dropped, so it never outlives the request on any exit path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::lifecycle::ModelManager;
use crate::registry::ModelKind;

const FALLBACK_FILENAME: &str = "upload";
const MAX_FILENAME_CHARS: usize = 128;

/// One uploaded audio file as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcription {
    pub text: String,
}

/// Keep only characters that are safe in a single path component.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .take(MAX_FILENAME_CHARS)
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        FALLBACK_FILENAME.to_owned()
    } else {
        cleaned
    }
}

/// Temporary on-disk copy of one upload.
#[derive(Debug)]
pub struct TranscriptionJob {
    source_filename: String,
    dir: PathBuf,
    audio_path: PathBuf,
    len: usize,
}

impl TranscriptionJob {
    /// Write `upload` into a fresh job directory under `upload_dir`.
    pub async fn create(upload_dir: &Path, upload: &Upload) -> Result<Self, CoreError> {
        let source_filename = upload.filename.clone().unwrap_or_default();
        let dir = upload_dir.join(format!("parley-{}", Uuid::new_v4().simple()));
        let audio_path = dir.join(sanitize_filename(&source_filename));
        // Constructed first so a failed write is cleaned up by `Drop` too.
        let job = Self {
            source_filename,
            dir,
            audio_path,
            len: upload.bytes.len(),
        };

        tokio::fs::create_dir_all(&job.dir).await.map_err(|e| {
            CoreError::io(format!("failed to create {}", job.dir.display()), e)
        })?;
        tokio::fs::write(&job.audio_path, &upload.bytes)
            .await
            .map_err(|e| {
                CoreError::io(format!("failed to write {}", job.audio_path.display()), e)
            })?;
        debug!(path = %job.audio_path.display(), bytes = job.len, "upload written");
        Ok(job)
    }

    /// The filename the client sent, unsanitised.
    pub fn source_filename(&self) -> &str {
        &self.source_filename
    }

    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    /// Scratch directory for derived files; removed with the job.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for TranscriptionJob {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "job directory removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to remove job directory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionPipeline {
    models: Arc<ModelManager>,
    upload_dir: PathBuf,
    timeout: Duration,
}

impl TranscriptionPipeline {
    pub fn new(models: Arc<ModelManager>, upload_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            models,
            upload_dir: upload_dir.into(),
            timeout,
        }
    }

    pub async fn transcribe(&self, upload: Upload) -> Result<Transcription, CoreError> {
        if upload.bytes.is_empty() {
            return Err(CoreError::InvalidRequest("uploaded file is empty".into()));
        }

        // One budget covers the lazy model load and the transcription.
        let deadline = tokio::time::Instant::now() + self.timeout;

        let job = TranscriptionJob::create(&self.upload_dir, &upload)
            .await
            .inspect_err(|e| error!(error = %e, "failed to store upload"))?;
        drop(upload);

        let handle = match tokio::time::timeout_at(deadline, self.models.speech_model()).await {
            Ok(loaded) => loaded,
            Err(_) => Err(CoreError::Timeout {
                kind: ModelKind::Speech,
                after: self.timeout,
            }),
        }
        .inspect_err(|e| error!(error = %e, "speech model unavailable"))?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let raw = handle
            .transcribe(job.audio_path(), job.dir(), remaining)
            .await
            .inspect_err(|e| {
                error!(error = %e, filename = %job.source_filename(), "transcription failed")
            })?;

        let text = raw.trim().to_owned();
        info!(
            filename = %job.source_filename(),
            bytes = job.len(),
            chars = text.chars().count(),
            "transcription finished"
        );
        Ok(Transcription { text })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
