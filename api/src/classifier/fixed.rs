use anyhow::{Result, bail};

use super::{Prediction, VideoClassifier};
use crate::video::Frame;

/// Classifier that answers with the same label for every clip - for smoke
/// runs without model weights, and for tests
pub struct FixedLabelClassifier {
    label: String,
    expected_frames: Option<usize>,
}

impl FixedLabelClassifier {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expected_frames: None,
        }
    }

    /// Also insist on a specific clip length, like a real model would
    pub fn with_expected_frames(mut self, frames: usize) -> Self {
        self.expected_frames = Some(frames);
        self
    }
}

impl VideoClassifier for FixedLabelClassifier {
    fn expected_frames(&self) -> Option<usize> {
        self.expected_frames
    }

    fn classify(&self, frames: &[Frame]) -> Result<Prediction> {
        if frames.is_empty() {
            bail!("cannot classify an empty clip");
        }
        if let Some(expected) = self.expected_frames {
            if frames.len() != expected {
                bail!("expected {} frames, got {}", expected, frames.len());
            }
        }

        Ok(Prediction {
            label: self.label.clone(),
            class_index: 0,
            score: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            rgb: vec![0; 12],
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn test_returns_configured_label() {
        let classifier = FixedLabelClassifier::new("playing guitar");
        let prediction = classifier.classify(&[frame(), frame()]).unwrap();
        assert_eq!(prediction.label, "playing guitar");
        assert_eq!(classifier.expected_frames(), None);
    }

    #[test]
    fn test_rejects_empty_and_wrong_length_clips() {
        let classifier = FixedLabelClassifier::new("x").with_expected_frames(3);
        assert!(classifier.classify(&[]).is_err());
        assert!(classifier.classify(&[frame()]).is_err());
        assert!(classifier.classify(&[frame(), frame(), frame()]).is_ok());
    }
}
