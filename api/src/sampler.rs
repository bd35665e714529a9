//! Frame index sampling for video clips
//!
//! Picks a random window of `clip_len * frame_sample_rate` frames inside the
//! source video and spreads `clip_len` indices evenly across it. The generator
//! is always passed in by the caller, so a request that owns a seeded `StdRng`
//! gets the same indices every time regardless of what other requests do.

use rand::Rng;
use thiserror::Error;

/// Clip length the ViViT checkpoints are trained on.
pub const DEFAULT_CLIP_LEN: usize = 32;
/// Stride multiplier between sampled frames.
pub const DEFAULT_FRAME_SAMPLE_RATE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingError {
    #[error(
        "invalid sampling window: clip needs {converted_len} frames \
         ({clip_len} x {frame_sample_rate}) but the video has {seg_len}"
    )]
    InvalidSamplingWindow {
        clip_len: usize,
        frame_sample_rate: usize,
        converted_len: usize,
        seg_len: usize,
    },

    #[error("invalid clip spec: clip_len={clip_len}, frame_sample_rate={frame_sample_rate} (both must be > 0)")]
    InvalidClipSpec {
        clip_len: usize,
        frame_sample_rate: usize,
    },
}

/// Shape of the clip handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipSpec {
    pub clip_len: usize,
    pub frame_sample_rate: usize,
}

impl Default for ClipSpec {
    fn default() -> Self {
        Self {
            clip_len: DEFAULT_CLIP_LEN,
            frame_sample_rate: DEFAULT_FRAME_SAMPLE_RATE,
        }
    }
}

impl ClipSpec {
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        seg_len: usize,
    ) -> Result<Vec<usize>, SamplingError> {
        sample_frame_indices(rng, self.clip_len, self.frame_sample_rate, seg_len)
    }
}

/// Select `clip_len` sorted frame indices from a video with `seg_len` frames.
///
/// Fails with [`SamplingError::InvalidSamplingWindow`] when the video is not
/// strictly longer than `clip_len * frame_sample_rate`.
pub fn sample_frame_indices<R: Rng>(
    rng: &mut R,
    clip_len: usize,
    frame_sample_rate: usize,
    seg_len: usize,
) -> Result<Vec<usize>, SamplingError> {
    if clip_len == 0 || frame_sample_rate == 0 {
        return Err(SamplingError::InvalidClipSpec {
            clip_len,
            frame_sample_rate,
        });
    }

    let window_error = |converted_len| SamplingError::InvalidSamplingWindow {
        clip_len,
        frame_sample_rate,
        converted_len,
        seg_len,
    };

    let converted_len = clip_len
        .checked_mul(frame_sample_rate)
        .ok_or_else(|| window_error(usize::MAX))?;
    if converted_len >= seg_len {
        return Err(window_error(converted_len));
    }

    let end_idx = rng.random_range(converted_len..seg_len);
    Ok(window_indices(clip_len, converted_len, end_idx))
}

/// Spread `clip_len` indices over the window ending at `end_idx`.
///
/// Points are linearly spaced over `[end_idx - converted_len, end_idx]`
/// inclusive, clamped to `end_idx - 1` and truncated.
pub(crate) fn window_indices(clip_len: usize, converted_len: usize, end_idx: usize) -> Vec<usize> {
    debug_assert!(converted_len >= 1 && converted_len <= end_idx);

    let start_idx = end_idx - converted_len;
    let (start, end) = (start_idx as f64, end_idx as f64);
    let last = (end_idx - 1) as f64;

    linspace(start, end, clip_len)
        .map(|point| point.clamp(start, last) as usize)
        .collect()
}

fn linspace(start: f64, stop: f64, num: usize) -> impl Iterator<Item = f64> {
    let step = if num > 1 {
        (stop - start) / (num - 1) as f64
    } else {
        0.0
    };

    (0..num).map(move |i| {
        if num > 1 && i == num - 1 {
            stop
        } else {
            start + i as f64 * step
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    #[test]
    fn test_window_indices_small_clip() {
        // end_idx = 5, converted_len = 4 -> start_idx = 1
        assert_eq!(window_indices(4, 4, 5), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_window_indices_clamps_last_point() {
        let indices = window_indices(32, 128, 150);
        assert_eq!(indices.len(), 32);
        assert_eq!(indices[0], 22);
        assert_eq!(*indices.last().unwrap(), 149);
    }

    #[test]
    fn test_window_indices_allows_duplicates() {
        // 8 points over a 2 frame window
        let indices = window_indices(8, 2, 10);
        assert_eq!(indices.len(), 8);
        assert!(indices.iter().all(|&i| (8..=9).contains(&i)));
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_single_frame_clip_starts_at_window() {
        assert_eq!(window_indices(1, 3, 7), vec![4]);
    }

    #[test]
    fn test_sample_bounds_and_order() {
        let mut rng = StdRng::seed_from_u64(0);
        for (clip_len, rate, seg_len) in [(32, 4, 200), (4, 1, 10), (16, 2, 33), (1, 1, 2), (8, 3, 1000)] {
            let converted_len = clip_len * rate;
            for _ in 0..50 {
                // same draw the sampler is about to make
                let end_idx = rng.clone().random_range(converted_len..seg_len);
                let start_idx = end_idx - converted_len;

                let indices = sample_frame_indices(&mut rng, clip_len, rate, seg_len).unwrap();
                assert_eq!(indices.len(), clip_len);
                assert!(
                    indices.iter().all(|&i| (start_idx..end_idx).contains(&i)),
                    "{indices:?} outside [{start_idx}, {end_idx})"
                );
                assert_eq!(indices[0], start_idx);
                assert!(indices.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }

    #[test]
    fn test_sample_is_reproducible_for_fixed_seed() {
        let first = sample_frame_indices(&mut StdRng::seed_from_u64(0), 32, 4, 200).unwrap();
        let second = sample_frame_indices(&mut StdRng::seed_from_u64(0), 32, 4, 200).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sample_rejects_short_video() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = sample_frame_indices(&mut rng, 32, 4, 128).unwrap_err();
        assert_eq!(
            err,
            SamplingError::InvalidSamplingWindow {
                clip_len: 32,
                frame_sample_rate: 4,
                converted_len: 128,
                seg_len: 128,
            }
        );
        assert!(sample_frame_indices(&mut rng, 32, 4, 10).is_err());
    }

    #[test]
    fn test_sample_rejects_overflowing_window() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = sample_frame_indices(&mut rng, usize::MAX, 2, 100).unwrap_err();
        assert!(matches!(err, SamplingError::InvalidSamplingWindow { .. }));
    }

    #[test]
    fn test_sample_rejects_zero_clip_spec() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sample_frame_indices(&mut rng, 0, 4, 100),
            Err(SamplingError::InvalidClipSpec { .. })
        ));
        assert!(matches!(
            ClipSpec { clip_len: 4, frame_sample_rate: 0 }.sample(&mut rng, 100),
            Err(SamplingError::InvalidClipSpec { .. })
        ));
    }
}
