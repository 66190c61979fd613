//! Audio transcription route (Whisper).
//!
//! Accepts an audio/video file via multipart/form-data, stages it in a
//! per-request job directory and runs ffmpeg → whisper-cli on it. The job
//! directory is removed before the response is sent, whatever the outcome.

use std::sync::Arc;

use axum::Router;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use bytes::BytesMut;
use parley_core::Upload;
use tracing::debug;
use utoipa::OpenApi;

use crate::error::{Json, ServerError};
use crate::schemas::v1::audio::{TranscriptionForm, TranscriptionResponse};
use crate::state::AppState;

/// Room for multipart boundaries and the small non-file fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(transcribe_upload),
    components(schemas(TranscriptionForm, TranscriptionResponse))
)]
pub struct AudioApi;

/// Register audio routes.
pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new().route(
        "/audio/transcriptions",
        post(transcribe_upload)
            .layer(DefaultBodyLimit::max(max_upload_bytes.saturating_add(MULTIPART_OVERHEAD))),
    )
}

/// Speech-to-text transcription via file upload (`POST /v1/audio/transcriptions`).
///
/// The file is taken from the `file` field, or failing that from the first
/// part that carries a filename. Other form fields (`model`, `language`,
/// `response_format`, ...) are accepted and ignored.
#[utoipa::path(
    post,
    path = "/v1/audio/transcriptions",
    tag = "audio",
    request_body(content = TranscriptionForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Transcribed text", body = TranscriptionResponse),
        (status = 400, description = "Missing, empty or oversized file"),
        (status = 500, description = "Decoding or transcription failed"),
        (status = 503, description = "Speech model queue full"),
        (status = 504, description = "Request timed out"),
    )
)]
pub async fn transcribe_upload(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TranscriptionResponse>, ServerError> {
    let upload = read_upload(multipart?, state.config.max_upload_bytes).await?;
    debug!(
        filename = upload.filename.as_deref().unwrap_or_default(),
        bytes = upload.bytes.len(),
        "received transcription upload"
    );

    let transcription = state.transcription.transcribe(upload).await?;
    Ok(Json(TranscriptionResponse {
        text: transcription.text,
    }))
}

async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<Upload, ServerError> {
    let mut named: Option<Upload> = None;
    let mut fallback: Option<Upload> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let is_file_field = field.name() == Some("file");
        if named.is_some() || (!is_file_field && (fallback.is_some() || field.file_name().is_none())) {
            continue;
        }

        let filename = field.file_name().map(str::to_owned);
        let mut bytes = BytesMut::new();
        while let Some(chunk) = field.chunk().await? {
            if bytes.len() + chunk.len() > limit {
                return Err(ServerError::BadRequest(format!(
                    "file too large: exceeds the {} upload limit",
                    describe_limit(limit)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        let upload = Upload {
            filename,
            bytes: bytes.freeze(),
        };
        if is_file_field {
            named = Some(upload);
        } else {
            fallback = Some(upload);
        }
    }

    named.or(fallback).ok_or_else(|| {
        ServerError::BadRequest("missing audio file: send it in the multipart field \"file\"".into())
    })
}

/// Whole mebibytes when the limit is an exact multiple, bytes otherwise.
fn describe_limit(limit: usize) -> String {
    const MIB: usize = 1024 * 1024;
    if limit >= MIB && limit % MIB == 0 {
        format!("{} MB", limit / MIB)
    } else {
        format!("{limit} byte")
    }
}

#[cfg(test)]
mod test {
    use axum::http::StatusCode;
    use parley_core::testing::{FakeLanguageModel, FakeSpeechLoader, FakeSpeechModel, ready_manager};
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::routes::test_support::{
        Part, app, config, file_part, json_request, multipart_request, send, text_part,
    };

    const URI: &str = "/v1/audio/transcriptions";

    struct Fixture {
        router: Router,
        speech: Arc<FakeSpeechModel>,
        loader: Arc<FakeSpeechLoader>,
        upload_dir: TempDir,
    }

    async fn fixture(speech: FakeSpeechModel, config: Config) -> Fixture {
        let upload_dir = tempfile::tempdir().unwrap();
        let speech = Arc::new(speech);
        let loader = Arc::new(FakeSpeechLoader::new(Arc::clone(&speech)));
        let models = ready_manager(
            Arc::new(FakeLanguageModel::replying("unused")),
            Arc::clone(&loader),
            16,
        )
        .await;
        let config = Config {
            upload_dir: upload_dir.path().to_path_buf(),
            ..config
        };
        Fixture {
            router: app(config, models),
            speech,
            loader,
            upload_dir,
        }
    }

    fn leftovers(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    async fn upload(fixture: &Fixture, parts: &[Part]) -> (StatusCode, Value) {
        let (status, _, body) = send(fixture.router.clone(), multipart_request(URI, parts)).await;
        (status, body)
    }

    #[tokio::test]
    async fn returns_trimmed_text() {
        let fx = fixture(FakeSpeechModel::transcribing("  Hello world.\n"), config()).await;
        let (status, body) = upload(&fx, &[file_part("file", "clip.wav", b"RIFF....WAVE")]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "Hello world.");
        let calls = fx.speech.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bytes, b"RIFF....WAVE");
        assert!(calls[0].audio.ends_with("clip.wav"));
        assert_eq!(leftovers(&fx.upload_dir), 0);
    }

    #[tokio::test]
    async fn other_form_fields_are_ignored() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        let (status, body) = upload(
            &fx,
            &[
                text_part("model", "whisper-1"),
                text_part("language", "en"),
                file_part("file", "a.mp3", b"ID3audio"),
                text_part("response_format", "json"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "hi");
        assert_eq!(fx.speech.calls()[0].bytes, b"ID3audio");
    }

    #[tokio::test]
    async fn any_part_with_a_filename_is_accepted() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        let (status, _) = upload(&fx, &[file_part("audio", "take.ogg", b"OggS")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fx.speech.calls()[0].bytes, b"OggS");
    }

    #[tokio::test]
    async fn corrupt_audio_is_500_and_leaves_no_files() {
        let fx = fixture(
            FakeSpeechModel::failing("Invalid data found when processing input"),
            config(),
        )
        .await;
        let (status, body) = upload(&fx, &[file_part("file", "clip.wav", b"not audio")]).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("Invalid data"));
        assert_eq!(leftovers(&fx.upload_dir), 0);
    }

    #[tokio::test]
    async fn missing_file_is_400() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        let (status, body) = upload(&fx, &[text_part("model", "whisper-1")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("file"));
        assert_eq!(fx.loader.attempts(), 0);
    }

    #[tokio::test]
    async fn empty_file_is_400() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        let (status, _) = upload(&fx, &[file_part("file", "clip.wav", b"")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(fx.speech.calls().is_empty());
        assert_eq!(leftovers(&fx.upload_dir), 0);
    }

    #[tokio::test]
    async fn oversized_file_is_400() {
        let config = Config {
            max_upload_bytes: 16,
            ..config()
        };
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config).await;
        let (status, body) = upload(&fx, &[file_part("file", "clip.wav", [0u8; 64])]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("too large"), "{detail}");
        assert!(detail.contains("16 byte upload limit"), "{detail}");
        assert!(fx.speech.calls().is_empty());
    }

    #[test]
    fn limits_are_described_in_readable_units() {
        assert_eq!(describe_limit(100 * 1024 * 1024), "100 MB");
        assert_eq!(describe_limit(512 * 1024), "524288 byte");
        assert_eq!(describe_limit(1024 * 1024 + 1), "1048577 byte");
    }

    #[tokio::test]
    async fn non_multipart_body_is_400() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        let request = json_request(URI, &serde_json::json!({}));
        let (status, _, body) = send(fx.router.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body["detail"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn speech_model_loads_lazily_once() {
        let fx = fixture(FakeSpeechModel::transcribing("hi"), config()).await;
        assert_eq!(fx.loader.attempts(), 0);
        for _ in 0..2 {
            let (status, _) = upload(&fx, &[file_part("file", "clip.wav", b"audio")]).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(fx.loader.attempts(), 1);
    }
}
