//! GGUF-quantized llama-family models on candle.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::{ModelWeights, MAX_SEQ_LEN};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::source::Resolver;
use super::{
    CancelSignal, FinishReason, Generation, GenerationParams, LanguageModel, LanguageModelLoader,
    RuntimeError,
};
use crate::prompt::{ChatTemplate, TokenizerConfig};

/// End-of-turn markers used by the common instruct model families.  Any
/// that exist in the vocabulary stop generation.
const STOP_TOKENS: &[&str] = &[
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|endoftext|>",
    "</s>",
];

const GGUF_TEMPLATE_KEY: &str = "tokenizer.chat_template";

impl From<candle_core::Error> for RuntimeError {
    fn from(e: candle_core::Error) -> Self {
        RuntimeError::Generation { source: e.into() }
    }
}

/// Loads a GGUF weights file plus a Hugging Face tokenizer.
#[derive(Debug, Clone)]
pub struct CandleLoader {
    resolver: Resolver,
    tokenizer_source: Option<String>,
    seed: u64,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl CandleLoader {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            tokenizer_source: None,
            seed: 299_792_458,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }

    /// Where `tokenizer.json` / `tokenizer_config.json` live when they are
    /// not next to the weights (GGUF repos rarely ship them).
    pub fn with_tokenizer(mut self, source: impl Into<String>) -> Self {
        self.tokenizer_source = Some(source.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = penalty;
        self
    }
}

fn select_device() -> Device {
    if cfg!(feature = "cuda") {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(e) => warn!(error = %e, "CUDA unavailable, falling back"),
        }
    }
    if cfg!(feature = "metal") {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(e) => warn!(error = %e, "Metal unavailable, falling back"),
        }
    }
    Device::Cpu
}

fn load_tokenizer_config(path: &Path) -> Result<TokenizerConfig, RuntimeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RuntimeError::LoadTokenizer {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    TokenizerConfig::parse(&raw).map_err(|e| RuntimeError::LoadTokenizer {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl LanguageModelLoader for CandleLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn LanguageModel>, RuntimeError> {
        let weights_path = self.resolver.resolve_file(model_id)?;
        let device = select_device();
        let load_err = |source: anyhow::Error| RuntimeError::LoadModel {
            path: weights_path.clone(),
            source,
        };

        let mut file = File::open(&weights_path).map_err(|e| load_err(e.into()))?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| load_err(e.into()))?;
        let gguf_template = content
            .metadata
            .get(GGUF_TEMPLATE_KEY)
            .and_then(|v| v.to_string().ok())
            .cloned();
        let weights =
            ModelWeights::from_gguf(content, &mut file, &device).map_err(|e| load_err(e.into()))?;

        let tokenizer_id = self.tokenizer_source.as_deref().unwrap_or(model_id);
        let tokenizer_path = self
            .resolver
            .resolve_companion(tokenizer_id, "tokenizer.json")?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| RuntimeError::LoadTokenizer {
                path: tokenizer_path.clone(),
                message: e.to_string(),
            })?;

        let config = match self
            .resolver
            .resolve_companion(tokenizer_id, "tokenizer_config.json")
        {
            Ok(path) => load_tokenizer_config(&path)?,
            Err(e) => {
                debug!(error = %e, "no tokenizer_config.json");
                TokenizerConfig::default()
            }
        };

        let template = match config.chat_template().map(str::to_owned).or(gguf_template) {
            Some(source) => match ChatTemplate::new(
                source,
                config.bos_token().map(str::to_owned),
                config.eos_token().map(str::to_owned),
            ) {
                Ok(template) => Some(template),
                Err(e) => {
                    warn!(error = %e, "chat template does not compile; using plain prompts");
                    None
                }
            },
            None => None,
        };

        let mut stop_tokens: Vec<u32> = config
            .eos_token()
            .into_iter()
            .chain(STOP_TOKENS.iter().copied())
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        stop_tokens.sort_unstable();
        stop_tokens.dedup();

        info!(
            weights = %weights_path.display(),
            tokenizer = %tokenizer_path.display(),
            device = ?device,
            context_length = MAX_SEQ_LEN,
            has_template = template.is_some(),
            stop_tokens = stop_tokens.len(),
            "language model loaded"
        );

        Ok(Arc::new(CandleLlama {
            weights: Mutex::new(weights),
            tokenizer,
            template,
            stop_tokens,
            device,
            seed: self.seed,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
        }))
    }
}

pub struct CandleLlama {
    /// The KV cache lives inside the weights, hence the lock.
    weights: Mutex<ModelWeights>,
    tokenizer: Tokenizer,
    template: Option<ChatTemplate>,
    stop_tokens: Vec<u32>,
    device: Device,
    seed: u64,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl LanguageModel for CandleLlama {
    fn chat_template(&self) -> Option<&ChatTemplate> {
        self.template.as_ref()
    }

    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Generation, RuntimeError> {
        let prompt_ids = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| RuntimeError::Tokenize {
                message: e.to_string(),
            })?
            .get_ids()
            .to_vec();
        let prompt_tokens = prompt_ids.len();
        if prompt_tokens == 0 {
            return Err(RuntimeError::Tokenize {
                message: "prompt encodes to zero tokens".into(),
            });
        }
        if prompt_tokens >= MAX_SEQ_LEN {
            return Err(RuntimeError::PromptTooLong {
                prompt_tokens,
                context_length: MAX_SEQ_LEN,
            });
        }
        let budget = (params.max_tokens as usize).min(MAX_SEQ_LEN - prompt_tokens);

        // index_pos 0 on the first forward resets the KV cache, so a poisoned
        // lock never carries stale state into the next request.
        let mut weights = self.weights.lock().unwrap_or_else(PoisonError::into_inner);
        let temperature = (params.temperature > 0.0).then_some(f64::from(params.temperature));
        let mut sampler = LogitsProcessor::new(self.seed, temperature, None);

        let mut all_ids = prompt_ids;
        let mut generated = Vec::with_capacity(budget);
        let mut finish_reason = FinishReason::Length;

        for step in 0..budget {
            if cancel.is_cancelled() {
                debug!(step, "generation cancelled");
                return Err(RuntimeError::Cancelled);
            }
            let (context, index_pos) = if step == 0 {
                (&all_ids[..], 0)
            } else {
                (&all_ids[all_ids.len() - 1..], all_ids.len() - 1)
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = weights
                .forward(&input, index_pos)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let logits = if self.repeat_penalty == 1.0 {
                logits
            } else {
                let start = all_ids.len().saturating_sub(self.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.repeat_penalty,
                    &all_ids[start..],
                )?
            };

            let next = sampler.sample(&logits)?;
            all_ids.push(next);
            if self.stop_tokens.contains(&next) {
                finish_reason = FinishReason::Stop;
                break;
            }
            generated.push(next);
        }

        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| RuntimeError::Tokenize {
                message: e.to_string(),
            })?;

        Ok(Generation {
            text,
            prompt_tokens,
            completion_tokens: generated.len(),
            finish_reason,
        })
    }
}
