//! Model identifier resolution.
//!
//! An identifier is either a filesystem path or a Hugging Face reference of
//! the form `repo/name:file`.  A bare `repo/name` only works where companion
//! files (tokenizer, config) are looked up by name.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};

use super::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub { repo: String, file: Option<String> },
}

impl ModelSource {
    pub fn parse(id: &str) -> Self {
        let path = Path::new(id);
        if path.is_absolute() || id.starts_with('.') || path.exists() {
            return ModelSource::Local(path.to_path_buf());
        }
        match id.split_once(':') {
            Some((repo, file)) if !file.is_empty() => ModelSource::Hub {
                repo: repo.to_owned(),
                file: Some(file.to_owned()),
            },
            Some((repo, _)) => ModelSource::Hub {
                repo: repo.to_owned(),
                file: None,
            },
            None => ModelSource::Hub {
                repo: id.to_owned(),
                file: None,
            },
        }
    }
}

/// Downloads (or finds in the local cache) files referenced by model ids.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    cache_dir: Option<PathBuf>,
}

impl Resolver {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }

    fn api(&self) -> Result<Api, hf_hub::api::sync::ApiError> {
        match &self.cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()).build(),
            None => Api::new(),
        }
    }

    /// Resolve `model_id` to the one local file it names.
    pub fn resolve_file(&self, model_id: &str) -> Result<PathBuf, RuntimeError> {
        match ModelSource::parse(model_id) {
            ModelSource::Local(path) if path.is_file() => Ok(path),
            ModelSource::Local(path) => Err(resolve_err(
                model_id,
                anyhow::anyhow!("{} is not a file", path.display()),
            )),
            ModelSource::Hub {
                repo,
                file: Some(file),
            } => self.fetch(model_id, repo, &file),
            ModelSource::Hub { repo, file: None } => Err(resolve_err(
                model_id,
                anyhow::anyhow!("'{repo}' names a repository; use '{repo}:<file>'"),
            )),
        }
    }

    /// Resolve `file` next to the model `model_id` points at: in the same
    /// directory for local paths, in the same repository for hub ids.
    pub fn resolve_companion(&self, model_id: &str, file: &str) -> Result<PathBuf, RuntimeError> {
        match ModelSource::parse(model_id) {
            ModelSource::Local(path) => {
                let dir = if path.is_dir() {
                    path
                } else {
                    path.parent().map(Path::to_path_buf).unwrap_or_default()
                };
                let candidate = dir.join(file);
                if candidate.is_file() {
                    Ok(candidate)
                } else {
                    Err(resolve_err(
                        model_id,
                        anyhow::anyhow!("{} does not exist", candidate.display()),
                    ))
                }
            }
            ModelSource::Hub { repo, .. } => self.fetch(model_id, repo, file),
        }
    }

    fn fetch(&self, model_id: &str, repo: String, file: &str) -> Result<PathBuf, RuntimeError> {
        let api = self
            .api()
            .map_err(|e| resolve_err(model_id, anyhow::anyhow!("hf-hub init failed: {e}")))?;
        tracing::info!(%repo, %file, "fetching model file");
        api.model(repo)
            .get(file)
            .map_err(|e| resolve_err(model_id, anyhow::anyhow!("hf-hub download failed: {e}")))
    }
}

fn resolve_err(model_id: &str, source: anyhow::Error) -> RuntimeError {
    RuntimeError::Resolve {
        model_id: model_id.to_owned(),
        source,
    }
}
