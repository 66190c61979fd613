//! Chat messages to model prompt text.
//!
//! Models trained on a chat format ship it as a Jinja template in their
//! `tokenizer_config.json` (or in GGUF metadata).  When one is available it
//! is rendered exactly as Hugging Face `apply_chat_template(...,
//! add_generation_prompt=True, tokenize=False)` would; otherwise a plain
//! `role: content` transcript is produced.

use std::fmt::{self, Write as _};

use minijinja::value::Value;
use minijinja::{context, Environment, Error as JinjaError, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::CoreError;

const TEMPLATE_NAME: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid tokenizer config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid chat template: {0}")]
    Compile(#[source] JinjaError),

    #[error("failed to render chat template: {0}")]
    Render(#[source] JinjaError),
}

// ── tokenizer_config.json ─────────────────────────────────────────────────────

/// `chat_template` is either one template or a list of named ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Debug, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

/// Special tokens appear as plain strings or as added-token objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    fn as_str(&self) -> &str {
        match self {
            SpecialToken::Text(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

/// The parts of a Hugging Face `tokenizer_config.json` prompt building needs.
#[derive(Debug, Default, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<TemplateField>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

impl TokenizerConfig {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn chat_template(&self) -> Option<&str> {
        match self.chat_template.as_ref()? {
            TemplateField::Single(source) => Some(source),
            TemplateField::Named(list) => list
                .iter()
                .find(|t| t.name == "default")
                .or_else(|| list.first())
                .map(|t| t.template.as_str()),
        }
    }

    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_ref().map(SpecialToken::as_str)
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_ref().map(SpecialToken::as_str)
    }
}

// ── Template ──────────────────────────────────────────────────────────────────

fn raise_exception(message: String) -> Result<String, JinjaError> {
    Err(JinjaError::new(ErrorKind::InvalidOperation, message))
}

fn strftime_now(format: String) -> Result<String, JinjaError> {
    let mut out = String::new();
    write!(out, "{}", chrono::Local::now().format(&format)).map_err(|_| {
        JinjaError::new(
            ErrorKind::InvalidOperation,
            format!("invalid strftime format {format:?}"),
        )
    })?;
    Ok(out)
}

/// The handful of Python string methods chat templates call on message
/// content.
fn string_method(value: &Value, method: &str, args: &[Value]) -> Result<Value, JinjaError> {
    let unknown = || {
        JinjaError::new(
            ErrorKind::InvalidOperation,
            format!("unknown method {method}()"),
        )
    };
    let s = value.as_str().ok_or_else(unknown)?;
    let arg = || args.first().and_then(Value::as_str).unwrap_or("");
    Ok(match method {
        "strip" => Value::from(s.trim()),
        "lstrip" => Value::from(s.trim_start()),
        "rstrip" => Value::from(s.trim_end()),
        "lower" => Value::from(s.to_lowercase()),
        "upper" => Value::from(s.to_uppercase()),
        "startswith" => Value::from(s.starts_with(arg())),
        "endswith" => Value::from(s.ends_with(arg())),
        _ => return Err(unknown()),
    })
}

/// A compiled model chat template plus the special tokens it references.
pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        // Same whitespace handling as transformers' jinja environment.
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", raise_exception);
        env.add_function("strftime_now", strftime_now);
        env.set_unknown_method_callback(|_state, value, method, args| {
            string_method(value, method, args)
        });
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .map_err(TemplateError::Compile)?;

        Ok(Self {
            env,
            bos_token: bos_token.unwrap_or_default(),
            eos_token: eos_token.unwrap_or_default(),
        })
    }

    /// Build a template from raw `tokenizer_config.json` text.  `Ok(None)`
    /// when the config carries no template.
    pub fn from_tokenizer_config(raw: &str) -> Result<Option<Self>, TemplateError> {
        let config = TokenizerConfig::parse(raw)?;
        config
            .chat_template()
            .map(|source| {
                Self::new(
                    source,
                    config.bos_token().map(str::to_owned),
                    config.eos_token().map(str::to_owned),
                )
            })
            .transpose()
    }

    pub fn render(&self, messages: &[ChatMessage]) -> Result<String, TemplateError> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(TemplateError::Render)?;
        template
            .render(context! {
                messages => messages,
                add_generation_prompt => true,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            })
            .map_err(TemplateError::Render)
    }
}

// ── Prompt building ───────────────────────────────────────────────────────────

fn plain_transcript(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

/// Turn the conversation into the exact text handed to the tokenizer.
pub fn build_prompt(
    messages: &[ChatMessage],
    template: Option<&ChatTemplate>,
) -> Result<String, CoreError> {
    match template {
        Some(template) => template
            .render(messages)
            .map_err(|e| CoreError::Prompt(e.to_string())),
        None => {
            warn!(
                messages = messages.len(),
                "model has no chat template; using plain role-prefixed prompt"
            );
            Ok(plain_transcript(messages))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
