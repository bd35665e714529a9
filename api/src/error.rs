//! Error type for the classification pipeline and its HTTP rendering

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::sampler::SamplingError;

pub type VivitResult<T> = Result<T, VivitError>;

#[derive(Debug, Error)]
pub enum VivitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VivitError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Wrap an `anyhow` chain from the decoder, keeping every context layer.
    pub fn decode(err: anyhow::Error) -> Self {
        Self::Decode(format!("{err:#}"))
    }

    pub fn inference(err: anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VivitError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            VivitError::Download(_) => StatusCode::BAD_GATEWAY,
            VivitError::Decode(_) | VivitError::Sampling(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VivitError::Inference(_) | VivitError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for VivitError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest's Display drops the source chain ("error sending request")
        let mut msg = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Download(msg)
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for VivitError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(%status, "{}", self);
        } else {
            tracing::warn!(%status, "{}", self);
        }

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_renders_json_body() {
        let response = VivitError::invalid_request("file_path is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid request: file_path is required");
    }

    #[test]
    fn test_status_per_kind() {
        assert_eq!(VivitError::download("x").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            VivitError::decode(anyhow::anyhow!("bad container")).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            VivitError::from(SamplingError::InvalidClipSpec {
                clip_len: 0,
                frame_sample_rate: 4
            })
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            VivitError::inference(anyhow::anyhow!("shape mismatch")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_anyhow_context_is_kept() {
        let err = anyhow::anyhow!("moov atom not found").context("ffprobe failed");
        let msg = VivitError::decode(err).to_string();
        assert_eq!(msg, "decode failed: ffprobe failed: moov atom not found");
    }
}
