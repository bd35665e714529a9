//! Service configuration, read from the environment (and `.env` via dotenvy)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::sampler::{ClipSpec, DEFAULT_CLIP_LEN, DEFAULT_FRAME_SAMPLE_RATE};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_MODEL_REPO: &str = "ltkien2003/vit";
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;
const DEFAULT_FFMPEG_THREADS: usize = 1;

/// Which classifier backend serves requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierBackend {
    /// Pretrained ViViT weights from the Hugging Face Hub
    Vivit,
    /// Always answers with `label`; no weights needed
    Fixed { label: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub model_repo: String,
    pub model_revision: Option<String>,
    pub classifier: ClassifierBackend,
    pub clip: ClipSpec,
    /// Seed for requests that don't bring their own
    pub default_seed: u64,
    pub max_download_bytes: u64,
    pub download_timeout: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub ffmpeg_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            model_repo: DEFAULT_MODEL_REPO.to_string(),
            model_revision: None,
            classifier: ClassifierBackend::Vivit,
            clip: ClipSpec::default(),
            default_seed: 0,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            ffmpeg_threads: DEFAULT_FFMPEG_THREADS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let classifier = match env::var("VIVIT_CLASSIFIER").as_deref() {
            Ok("fixed") => ClassifierBackend::Fixed {
                label: env::var("VIVIT_FIXED_LABEL").unwrap_or_else(|_| "unknown".to_string()),
            },
            _ => ClassifierBackend::Vivit,
        };

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_positive("PORT").unwrap_or(DEFAULT_PORT),
            model_repo: env::var("VIVIT_MODEL_REPO")
                .unwrap_or_else(|_| DEFAULT_MODEL_REPO.to_string()),
            model_revision: env::var("VIVIT_MODEL_REVISION")
                .ok()
                .filter(|v| !v.is_empty()),
            classifier,
            clip: ClipSpec {
                clip_len: parse_positive("CLIP_LEN").unwrap_or(DEFAULT_CLIP_LEN),
                frame_sample_rate: parse_positive("FRAME_SAMPLE_RATE")
                    .unwrap_or(DEFAULT_FRAME_SAMPLE_RATE),
            },
            default_seed: env::var("SAMPLER_SEED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            max_download_bytes: parse_positive("MAX_DOWNLOAD_BYTES")
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES),
            download_timeout: Duration::from_secs(
                parse_positive("DOWNLOAD_TIMEOUT_SECS").unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
            ffmpeg_threads: parse_positive("FFMPEG_THREADS").unwrap_or(DEFAULT_FFMPEG_THREADS),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a numeric env var, ignoring junk and zero.
fn parse_positive<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialEq + Default,
{
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|v| *v != T::default())
}
