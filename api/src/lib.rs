//! ViViT video classification service
//!
//! `POST /vivit {"file_path": url}` downloads the video, samples a clip of
//! frames and answers `{"result": label}` from a pretrained ViViT model.

pub mod classifier;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod routes;
pub mod sampler;
pub mod video;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use std::any::Any;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::classifier::VideoClassifier;
use crate::config::Config;
use crate::error::VivitError;
use crate::pipeline::ClassificationPipeline;
use crate::video::FfmpegDecoder;

/// The body only carries a URL
const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

pub struct AppState {
    pub pipeline: ClassificationPipeline,
}

impl AppState {
    pub fn new(config: &Config, classifier: Arc<dyn VideoClassifier>) -> anyhow::Result<Self> {
        let http = fetch::build_client(config.download_timeout)?;
        let decoder = FfmpegDecoder::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
            config.ffmpeg_threads,
        );

        let pipeline = ClassificationPipeline::new(http, Arc::new(decoder), classifier, config.clip)
            .with_default_seed(config.default_seed)
            .with_max_download_bytes(config.max_download_bytes);

        Ok(Self { pipeline })
    }
}

/// Router with every route and the shared middleware stack
pub fn build_app(state: Arc<AppState>) -> Router {
    routes::build_routes()
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(panic_response)),
        )
        .with_state(state)
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    VivitError::Internal(format!("request handler panicked: {detail}")).into_response()
}
