//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "PARLEY_";

/// Runtime configuration for parley-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind (default: `"127.0.0.1"`).
    pub host: String,

    /// TCP port to bind (default: `8080`).
    pub port: u16,

    /// Language model id: `repo:file.gguf` on the Hub or a local path.
    pub llm_model: String,

    /// Where `tokenizer.json` and `tokenizer_config.json` live. `None` looks
    /// next to the weights.
    pub llm_tokenizer: Option<String>,

    /// Speech model id, resolved like [`Config::llm_model`].
    pub whisper_model: String,

    pub whisper_bin: String,
    pub ffmpeg_bin: String,
    pub whisper_threads: usize,

    /// Hugging Face cache directory; `None` uses the hf-hub default.
    pub hf_cache: Option<PathBuf>,

    /// Parent directory for per-upload job directories.
    pub upload_dir: PathBuf,

    pub max_upload_bytes: usize,

    /// Queue wait plus inference budget for a single request.
    pub request_timeout: Duration,

    /// Requests allowed to wait behind each model.
    pub max_queue: usize,

    /// Abort startup when the language model fails to load.
    pub require_chat_model: bool,

    pub seed: u64,
    pub repeat_penalty: f32,

    /// Comma-separated list of allowed CORS origins. `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Serve `/api-docs/openapi.json`.
    pub enable_docs: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(lookup);
        Self {
            host: env.env_or("HOST", "127.0.0.1"),
            port: env.parse_env("PORT", 8080),
            llm_model: env.env_or(
                "LLM_MODEL",
                "bartowski/Llama-3.2-3B-Instruct-GGUF:Llama-3.2-3B-Instruct-Q4_K_M.gguf",
            ),
            llm_tokenizer: env.env_optional("LLM_TOKENIZER", Some("unsloth/Llama-3.2-3B-Instruct")),
            whisper_model: env.env_or("WHISPER_MODEL", "ggerganov/whisper.cpp:ggml-tiny.bin"),
            whisper_bin: env.env_or("WHISPER_BIN", "whisper-cli"),
            ffmpeg_bin: env.env_or("FFMPEG_BIN", "ffmpeg"),
            whisper_threads: env.parse_env("WHISPER_THREADS", 4),
            hf_cache: env.env_optional("HF_CACHE", None).map(PathBuf::from),
            upload_dir: env
                .env_optional("UPLOAD_DIR", None)
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_upload_bytes: env.parse_env::<usize>("MAX_UPLOAD_MB", 100).saturating_mul(1024 * 1024),
            request_timeout: Duration::from_secs(env.parse_env("REQUEST_TIMEOUT_SECS", 300)),
            max_queue: env.parse_env("MAX_QUEUE", 16),
            require_chat_model: env.env_flag("REQUIRE_CHAT_MODEL", true),
            seed: env.parse_env("SEED", 299_792_458),
            repeat_penalty: env.parse_env("REPEAT_PENALTY", 1.1),
            cors_allowed_origins: env.env_optional("CORS_ORIGINS", None),
            enable_docs: env.env_flag("ENABLE_DOCS", true),
            log_level: env.env_or("LOG", "info"),
            log_json: env.env_flag("LOG_JSON", false),
        }
    }

    pub fn bind_address(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("{ENV_PREFIX}{key}"))
    }

    fn env_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    /// An empty value counts as unset.
    fn env_optional(&self, key: &str, default: Option<&str>) -> Option<String> {
        match self.get(key) {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => default.map(str::to_owned),
        }
    }

    fn parse_env<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn env_flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| {
                let v = v.trim();
                v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
            })
            .unwrap_or(default)
    }
}
