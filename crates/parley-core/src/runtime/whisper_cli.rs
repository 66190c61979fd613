//! Speech recognition through the whisper.cpp command line.
//!
//! Each transcription runs two child processes: `ffmpeg` normalises the
//! upload to 16 kHz mono PCM, then `whisper-cli` prints the transcript to
//! stdout.  Both are spawned with `kill_on_drop`, so dropping the future
//! (timeout, client disconnect) stops them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::source::Resolver;
use super::{RuntimeError, SpeechModel, SpeechModelLoader};

const NORMALISED_WAV: &str = "audio-16k.wav";
/// Keep error bodies readable when a tool dumps a long log.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct WhisperCliLoader {
    resolver: Resolver,
    whisper_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    threads: usize,
}

impl WhisperCliLoader {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            whisper_bin: PathBuf::from("whisper-cli"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            threads: 4,
        }
    }

    pub fn with_binaries(mut self, whisper: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>) -> Self {
        self.whisper_bin = whisper.into();
        self.ffmpeg_bin = ffmpeg.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

/// Fails only when the program cannot be started at all.
fn ensure_runnable(program: &Path) -> Result<(), RuntimeError> {
    std::process::Command::new(program)
        .arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|source| RuntimeError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

impl SpeechModelLoader for WhisperCliLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn SpeechModel>, RuntimeError> {
        let model_path = self.resolver.resolve_file(model_id)?;
        ensure_runnable(&self.ffmpeg_bin)?;
        ensure_runnable(&self.whisper_bin)?;
        info!(
            model = %model_path.display(),
            whisper = %self.whisper_bin.display(),
            ffmpeg = %self.ffmpeg_bin.display(),
            threads = self.threads,
            "speech model ready"
        );
        Ok(Arc::new(WhisperCli {
            model_path,
            whisper_bin: self.whisper_bin.clone(),
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            threads: self.threads,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct WhisperCli {
    model_path: PathBuf,
    whisper_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    threads: usize,
}

impl WhisperCli {
    pub fn new(
        model_path: impl Into<PathBuf>,
        whisper_bin: impl Into<PathBuf>,
        ffmpeg_bin: impl Into<PathBuf>,
        threads: usize,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            whisper_bin: whisper_bin.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
            threads: threads.max(1),
        }
    }
}

/// Run `program` to completion and return its stdout.
async fn run(program: &Path, args: &[&std::ffi::OsStr]) -> Result<String, RuntimeError> {
    let name = program.display().to_string();
    debug!(program = %name, ?args, "spawning");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| RuntimeError::Spawn {
            program: name.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
            Some((cut, _)) => &stderr[cut..],
            None => stderr,
        };
        return Err(RuntimeError::ProcessFailed {
            program: name,
            status: output.status.to_string(),
            stderr: tail.to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl SpeechModel for WhisperCli {
    async fn transcribe(&self, audio: &Path, workdir: &Path) -> Result<String, RuntimeError> {
        let wav = workdir.join(NORMALISED_WAV);

        run(
            &self.ffmpeg_bin,
            &[
                "-nostdin".as_ref(),
                "-hide_banner".as_ref(),
                "-loglevel".as_ref(),
                "error".as_ref(),
                "-y".as_ref(),
                "-i".as_ref(),
                audio.as_os_str(),
                "-ar".as_ref(),
                "16000".as_ref(),
                "-ac".as_ref(),
                "1".as_ref(),
                "-c:a".as_ref(),
                "pcm_s16le".as_ref(),
                wav.as_os_str(),
            ],
        )
        .await?;

        let threads = self.threads.to_string();
        let stdout = run(
            &self.whisper_bin,
            &[
                "-m".as_ref(),
                self.model_path.as_os_str(),
                "-f".as_ref(),
                wav.as_os_str(),
                "-nt".as_ref(),
                "-np".as_ref(),
                "-l".as_ref(),
                "auto".as_ref(),
                "-t".as_ref(),
                threads.as_ref(),
            ],
        )
        .await?;

        // One segment per line; rejoin into running text.
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }
}
