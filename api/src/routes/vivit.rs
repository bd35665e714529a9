//! POST /vivit - classify the video behind a URL

use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    routing::post,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::AppState;
use crate::error::{VivitError, VivitResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/vivit", post(classify_video))
}

#[derive(Debug, Deserialize)]
struct RawVivitRequest {
    file_path: Option<String>,
    seed: Option<u64>,
}

/// Validated request body
#[derive(Debug, Clone, PartialEq)]
pub struct VivitRequest {
    pub file_path: Url,
    /// Sampler seed for this request only
    pub seed: Option<u64>,
}

impl VivitRequest {
    /// Parse and validate before anything touches the network
    pub fn parse(body: &[u8]) -> VivitResult<Self> {
        let raw: RawVivitRequest = serde_json::from_slice(body)
            .map_err(|e| VivitError::invalid_request(format!("malformed JSON body: {e}")))?;

        let file_path = raw
            .file_path
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VivitError::invalid_request("file_path is required"))?;

        let url = Url::parse(&file_path)
            .map_err(|e| VivitError::invalid_request(format!("file_path is not a valid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VivitError::invalid_request(format!(
                "file_path must be an http(s) URL, got scheme {:?}",
                url.scheme()
            )));
        }

        Ok(Self {
            file_path: url,
            seed: raw.seed,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct VivitResponse {
    pub result: String,
}

async fn classify_video(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> VivitResult<Json<VivitResponse>> {
    let body = body.map_err(|e| VivitError::invalid_request(e.body_text()))?;
    let request = VivitRequest::parse(&body)?;
    tracing::info!(url = %request.file_path, seed = ?request.seed, "classifying video");

    let prediction = state
        .pipeline
        .classify(&request.file_path, request.seed)
        .await?;

    Ok(Json(VivitResponse {
        result: prediction.label,
    }))
}
