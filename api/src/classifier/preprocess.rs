//! Frame preprocessing matching the ViViT image processor:
//! resize, center crop, rescale with offset, normalise, stack as (1, T, C, H, W).

use anyhow::{Result, anyhow, bail};
use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use serde::Deserialize;

use crate::video::Frame;

const CHANNELS: usize = 3;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizeSpec {
    pub shortest_edge: Option<u32>,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropSize {
    pub height: u32,
    pub width: u32,
}

/// Subset of `preprocessor_config.json` the model needs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub do_resize: bool,
    pub size: SizeSpec,
    /// PIL resampling filter id (0 nearest, 2 bilinear, 3 bicubic)
    pub resample: u8,
    pub do_center_crop: bool,
    pub crop_size: CropSize,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub offset: bool,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: SizeSpec {
                shortest_edge: Some(256),
                ..SizeSpec::default()
            },
            resample: 2,
            do_center_crop: true,
            crop_size: CropSize {
                height: 224,
                width: 224,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 127.5,
            offset: true,
            do_normalize: true,
            image_mean: [0.5; 3],
            image_std: [0.5; 3],
        }
    }
}

impl PreprocessorConfig {
    /// Final (height, width) of every preprocessed frame
    pub fn output_size(&self) -> (u32, u32) {
        (self.crop_size.height, self.crop_size.width)
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            3 => FilterType::CatmullRom,
            1 => FilterType::Lanczos3,
            _ => FilterType::Triangle,
        }
    }

    /// Target size for the resize step, as (width, height)
    fn resize_target(&self, width: u32, height: u32) -> (u32, u32) {
        match (&self.size.shortest_edge, self.size.height, self.size.width) {
            (Some(edge), _, _) => {
                let edge = *edge;
                if width <= height {
                    let long = (edge as u64 * height as u64 / width as u64) as u32;
                    (edge, long)
                } else {
                    let long = (edge as u64 * width as u64 / height as u64) as u32;
                    (long, edge)
                }
            }
            (None, Some(h), Some(w)) => (w, h),
            _ => (width, height),
        }
    }

    /// Preprocess one frame into CHW float values
    pub fn frame_to_chw(&self, frame: &Frame) -> Result<Vec<f32>> {
        if frame.width == 0 || frame.height == 0 {
            bail!("frame has no pixels");
        }
        let mut img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.rgb.clone())
                .ok_or_else(|| anyhow!("invalid frame dimensions {}x{}", frame.width, frame.height))?;

        if self.do_resize {
            let (w, h) = self.resize_target(img.width(), img.height());
            if (w, h) != img.dimensions() {
                img = imageops::resize(&img, w, h, self.filter());
            }
        }

        let (crop_h, crop_w) = self.output_size();
        if self.do_center_crop || img.dimensions() != (crop_w, crop_h) {
            if img.width() < crop_w || img.height() < crop_h {
                img = imageops::resize(&img, crop_w.max(img.width()), crop_h.max(img.height()), self.filter());
            }
            let left = (img.width() - crop_w) / 2;
            let top = (img.height() - crop_h) / 2;
            img = imageops::crop_imm(&img, left, top, crop_w, crop_h).to_image();
        }

        let plane = (crop_h * crop_w) as usize;
        let mut chw = vec![0f32; CHANNELS * plane];
        for (i, pixel) in img.pixels().enumerate() {
            for c in 0..CHANNELS {
                let mut v = pixel[c] as f32;
                if self.do_rescale {
                    v *= self.rescale_factor;
                    if self.offset {
                        v -= 1.0;
                    }
                }
                if self.do_normalize {
                    v = (v - self.image_mean[c]) / self.image_std[c];
                }
                chw[c * plane + i] = v;
            }
        }

        Ok(chw)
    }

    /// Stack a clip into a `(1, T, C, H, W)` tensor
    pub fn clip_to_tensor(&self, frames: &[Frame], device: &Device) -> Result<Tensor> {
        if frames.is_empty() {
            bail!("cannot preprocess an empty clip");
        }
        let (h, w) = self.output_size();
        let frame_len = CHANNELS * (h * w) as usize;

        let mut data = Vec::with_capacity(frames.len() * frame_len);
        for frame in frames {
            data.extend(self.frame_to_chw(frame)?);
        }

        let tensor = Tensor::from_vec(
            data,
            vec![1, frames.len(), CHANNELS, h as usize, w as usize],
            device,
        )?;
        Ok(tensor)
    }
}
