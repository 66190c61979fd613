//! parley-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Load the language model; the speech model loads on first use.
//! 4. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::sync::Arc;

use anyhow::Context;
use parley_core::ModelManager;
use parley_core::runtime::candle::CandleLoader;
use parley_core::runtime::source::Resolver;
use parley_core::runtime::whisper_cli::WhisperCliLoader;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PARLEY_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "parley-server starting");

    // ── 3. Models ──────────────────────────────────────────────────────────────
    let resolver = Resolver::new(cfg.hf_cache.clone());
    let speech_loader = WhisperCliLoader::new(resolver.clone())
        .with_binaries(&cfg.whisper_bin, &cfg.ffmpeg_bin)
        .with_threads(cfg.whisper_threads);
    let models = Arc::new(ModelManager::new(
        cfg.llm_model.clone(),
        cfg.whisper_model.clone(),
        Arc::new(speech_loader),
        cfg.max_queue,
    ));

    let mut language_loader = CandleLoader::new(resolver)
        .with_seed(cfg.seed)
        .with_repeat_penalty(cfg.repeat_penalty);
    if let Some(tokenizer) = &cfg.llm_tokenizer {
        language_loader = language_loader.with_tokenizer(tokenizer.clone());
    }

    info!(model = %cfg.llm_model, "loading chat model");
    match models.load_language_model(Arc::new(language_loader)).await {
        Ok(handle) => info!(model = %handle.model_id(), "chat model ready"),
        Err(e) if cfg.require_chat_model => {
            return Err(anyhow::Error::new(e).context("failed to load chat model"));
        }
        Err(e) => warn!(
            error = %e,
            "chat model failed to load; chat requests will return 503"
        ),
    }

    tokio::fs::create_dir_all(&cfg.upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", cfg.upload_dir.display()))?;

    // ── 4. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState::new(cfg.clone(), models));
    let app = routes::build(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(cfg.bind_address())
        .await
        .with_context(|| format!("failed to bind {}:{}", cfg.host, cfg.port))?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("parley-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c   => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
