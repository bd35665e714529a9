//! One classification, end to end: download -> probe -> sample -> decode -> classify

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::classifier::{Prediction, VideoClassifier};
use crate::error::{VivitError, VivitResult};
use crate::fetch;
use crate::sampler::ClipSpec;
use crate::video::VideoDecoder;

pub struct ClassificationPipeline {
    http: reqwest::Client,
    decoder: Arc<dyn VideoDecoder>,
    classifier: Arc<dyn VideoClassifier>,
    clip: ClipSpec,
    default_seed: u64,
    max_download_bytes: u64,
}

impl ClassificationPipeline {
    pub fn new(
        http: reqwest::Client,
        decoder: Arc<dyn VideoDecoder>,
        classifier: Arc<dyn VideoClassifier>,
        clip: ClipSpec,
    ) -> Self {
        Self {
            http,
            decoder,
            classifier,
            clip,
            default_seed: 0,
            max_download_bytes: u64::MAX,
        }
    }

    pub fn with_default_seed(mut self, seed: u64) -> Self {
        self.default_seed = seed;
        self
    }

    pub fn with_max_download_bytes(mut self, max_bytes: u64) -> Self {
        self.max_download_bytes = max_bytes;
        self
    }

    pub fn clip(&self) -> ClipSpec {
        self.clip
    }

    /// Each call samples with its own generator, seeded from `seed` or the
    /// configured default, so identical requests pick identical frames.
    pub async fn classify(&self, url: &Url, seed: Option<u64>) -> VivitResult<Prediction> {
        let started = Instant::now();
        let video = fetch::download_video(&self.http, url, self.max_download_bytes).await?;
        let downloaded = started.elapsed();

        let decoder = Arc::clone(&self.decoder);
        let classifier = Arc::clone(&self.classifier);
        let clip = self.clip;
        let seed = seed.unwrap_or(self.default_seed);

        let prediction = tokio::task::spawn_blocking(move || -> VivitResult<Prediction> {
            let info = decoder.probe(video.path()).map_err(VivitError::decode)?;

            let mut rng = StdRng::seed_from_u64(seed);
            let indices = clip.sample(&mut rng, info.frame_count)?;

            let decode_start = Instant::now();
            let frames = decoder
                .read_frames(video.path(), &info, &indices)
                .map_err(VivitError::decode)?;
            let decoded = decode_start.elapsed();

            let infer_start = Instant::now();
            let prediction = classifier.classify(&frames).map_err(VivitError::inference)?;

            tracing::info!(
                frames = info.frame_count,
                width = info.width,
                height = info.height,
                first = indices.first().copied(),
                last = indices.last().copied(),
                decode_ms = decoded.as_millis() as u64,
                infer_ms = infer_start.elapsed().as_millis() as u64,
                "clip classified as {:?}",
                prediction.label
            );
            Ok(prediction)
        })
        .await
        .map_err(|e| VivitError::Internal(format!("classification task failed: {e}")))??;

        tracing::debug!(
            download_ms = downloaded.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(prediction)
    }
}
