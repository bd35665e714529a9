use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vivit::classifier::{FixedLabelClassifier, VideoClassifier, VivitClassifier};
use vivit::config::{ClassifierBackend, Config};
use vivit::{AppState, build_app};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vivit=info,tower_http=info"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn load_classifier(config: &Config) -> Result<Arc<dyn VideoClassifier>> {
    match &config.classifier {
        ClassifierBackend::Vivit => {
            let repo = config.model_repo.clone();
            let revision = config.model_revision.clone();
            // hf-hub's sync API blocks on network I/O
            let classifier = tokio::task::spawn_blocking(move || {
                VivitClassifier::from_hub(&repo, revision.as_deref())
            })
            .await?
            .with_context(|| format!("failed to load model {}", config.model_repo))?;
            Ok(Arc::new(classifier))
        }
        ClassifierBackend::Fixed { label } => {
            tracing::warn!(%label, "using fixed-label classifier, no model loaded");
            Ok(Arc::new(FixedLabelClassifier::new(label.clone())))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    tracing::info!(
        clip_len = config.clip.clip_len,
        frame_sample_rate = config.clip.frame_sample_rate,
        seed = config.default_seed,
        "starting vivit"
    );

    let classifier = load_classifier(&config).await?;
    if let Some(expected) = classifier.expected_frames() {
        if expected != config.clip.clip_len {
            bail!(
                "CLIP_LEN is {} but the model was trained on {}-frame clips",
                config.clip.clip_len,
                expected
            );
        }
    }

    let state = Arc::new(AppState::new(&config, classifier)?);
    let app = build_app(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("Listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}
