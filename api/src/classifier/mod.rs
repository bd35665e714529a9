use anyhow::Result;

use crate::video::Frame;

/// Top-1 prediction for a clip
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    /// Softmax probability of `class_index`
    pub score: f32,
}

/// Pluggable video classification backend
pub trait VideoClassifier: Send + Sync {
    /// Number of frames per clip the model expects, if it is fixed
    fn expected_frames(&self) -> Option<usize>;

    /// Classify one clip of decoded frames
    fn classify(&self, frames: &[Frame]) -> Result<Prediction>;
}

mod fixed;
mod preprocess;
mod vivit;

pub use fixed::FixedLabelClassifier;
pub use preprocess::PreprocessorConfig;
pub use vivit::{VivitClassifier, VivitConfig};
