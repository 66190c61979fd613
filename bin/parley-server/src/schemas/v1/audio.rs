use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Multipart form accepted by `POST /v1/audio/transcriptions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranscriptionForm {
    /// The audio file to transcribe, in any format ffmpeg can decode.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// Accepted for client compatibility and ignored.
    pub model: Option<String>,
}

/// Response body for `POST /v1/audio/transcriptions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranscriptionResponse {
    /// Recognised text with surrounding whitespace trimmed.
    pub text: String,
}
