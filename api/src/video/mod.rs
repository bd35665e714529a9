use anyhow::Result;
use std::path::Path;

mod ffmpeg;

pub use ffmpeg::FfmpegDecoder;

/// One decoded RGB24 frame, row-major, `width * height * 3` bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Primary video stream properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: usize,
}

impl VideoInfo {
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Pluggable video backend
pub trait VideoDecoder: Send + Sync {
    /// Dimensions and total frame count of the first video stream
    fn probe(&self, path: &Path) -> Result<VideoInfo>;

    /// Decode the frames at `indices`, returned in the same order.
    /// Repeated indices repeat the frame.
    fn read_frames(&self, path: &Path, info: &VideoInfo, indices: &[usize]) -> Result<Vec<Frame>>;
}
