//! ViViT video classifier on candle
//!
//! Loads `VivitForVideoClassification` checkpoints from the Hugging Face Hub
//! (weights under `vivit.*` plus a linear `classifier` head). This is the
//! joint spatio-temporal attention variant: one transformer over all tubelet
//! tokens, classification from the CLS token.

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, layer_norm, linear, linear_b};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{PreprocessorConfig, Prediction, VideoClassifier};
use crate::video::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    /// Exact erf GELU
    Gelu,
    /// tanh approximation
    #[serde(alias = "gelu_new", alias = "gelu_pytorch_tanh")]
    GeluFast,
    Relu,
}

impl HiddenAct {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            HiddenAct::Gelu => xs.gelu_erf(),
            HiddenAct::GeluFast => xs.gelu(),
            HiddenAct::Relu => xs.relu(),
        }
    }
}

/// `config.json` of a ViViT checkpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VivitConfig {
    pub image_size: usize,
    pub num_frames: usize,
    /// (time, height, width) extent of one tubelet
    pub tubelet_size: [usize; 3],
    pub num_channels: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    pub layer_norm_eps: f64,
    pub qkv_bias: bool,
    pub id2label: HashMap<String, String>,
}

impl Default for VivitConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            num_frames: 32,
            tubelet_size: [2, 16, 16],
            num_channels: 3,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: HiddenAct::GeluFast,
            layer_norm_eps: 1e-6,
            qkv_bias: true,
            id2label: HashMap::new(),
        }
    }
}

impl VivitConfig {
    pub fn num_labels(&self) -> usize {
        self.id2label.len()
    }

    pub fn num_patches(&self) -> usize {
        let [t, h, w] = self.tubelet_size;
        (self.num_frames / t) * (self.image_size / h) * (self.image_size / w)
    }

    pub fn label(&self, class_index: usize) -> String {
        self.id2label
            .get(&class_index.to_string())
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{class_index}"))
    }
}

/// Non-overlapping 3D patches projected to `hidden_size`.
/// Equivalent to a Conv3d whose kernel equals its stride.
struct TubeletEmbeddings {
    projection: Linear,
    tubelet_size: [usize; 3],
}

impl TubeletEmbeddings {
    fn new(cfg: &VivitConfig, vb: VarBuilder) -> Result<Self> {
        let [t, h, w] = cfg.tubelet_size;
        let patch_dim = cfg.num_channels * t * h * w;
        let weight = vb
            .get(vec![cfg.hidden_size, cfg.num_channels, t, h, w], "weight")?
            .reshape((cfg.hidden_size, patch_dim))?;
        let bias = vb.get(cfg.hidden_size, "bias")?;

        Ok(Self {
            projection: Linear::new(weight, Some(bias)),
            tubelet_size: cfg.tubelet_size,
        })
    }

    /// (B, T, C, H, W) -> (B, num_patches, hidden)
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b, frames, c, height, width) = pixel_values.dims5()?;
        let [t, ph, pw] = self.tubelet_size;
        if frames % t != 0 || height % ph != 0 || width % pw != 0 {
            bail!(
                "clip of {}x{}x{} does not tile into {}x{}x{} tubelets",
                frames, height, width, t, ph, pw
            );
        }
        let (nt, nh, nw) = (frames / t, height / ph, width / pw);

        // patch order is (t, h, w), pixel order inside a patch is (c, t, h, w)
        let patches = pixel_values
            .permute(vec![0, 2, 1, 3, 4])?
            .reshape(vec![b, c, nt, t, nh, ph, nw, pw])?
            .permute(vec![0, 2, 4, 6, 1, 3, 5, 7])?
            .contiguous()?
            .reshape((b, nt * nh * nw, c * t * ph * pw))?;

        Ok(self.projection.forward(&patches)?)
    }
}

struct Embeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_embeddings: TubeletEmbeddings,
}

impl Embeddings {
    fn new(cfg: &VivitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            cls_token: vb.get((1, 1, hidden), "cls_token")?,
            position_embeddings: vb.get((1, cfg.num_patches() + 1, hidden), "position_embeddings")?,
            patch_embeddings: TubeletEmbeddings::new(cfg, vb.pp("patch_embeddings").pp("projection"))?,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let patches = self.patch_embeddings.forward(pixel_values)?;
        let (b, n, hidden) = patches.dims3()?;

        let expected = self.position_embeddings.dim(1)?;
        if n + 1 != expected {
            bail!(
                "clip produced {} tokens but the model has {} position embeddings",
                n + 1,
                expected
            );
        }

        let cls = self.cls_token.broadcast_as((b, 1, hidden))?.contiguous()?;
        let tokens = Tensor::cat(&[&cls, &patches], 1)?;
        Ok(tokens.broadcast_add(&self.position_embeddings)?)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(cfg: &VivitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        if hidden % cfg.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                hidden,
                cfg.num_attention_heads
            );
        }

        let attn = vb.pp("attention");
        Ok(Self {
            query: linear_b(hidden, hidden, cfg.qkv_bias, attn.pp("query"))?,
            key: linear_b(hidden, hidden, cfg.qkv_bias, attn.pp("key"))?,
            value: linear_b(hidden, hidden, cfg.qkv_bias, attn.pp("value"))?,
            output: linear(hidden, hidden, vb.pp("output").pp("dense"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: hidden / cfg.num_attention_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, n, hidden))?;
        Ok(self.output.forward(&context)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    intermediate: Linear,
    output: Linear,
    layernorm_before: LayerNorm,
    layernorm_after: LayerNorm,
    act: HiddenAct,
}

impl EncoderLayer {
    fn new(cfg: &VivitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::new(cfg, vb.pp("attention"))?,
            intermediate: linear(hidden, cfg.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(cfg.intermediate_size, hidden, vb.pp("output").pp("dense"))?,
            layernorm_before: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("layernorm_before"))?,
            layernorm_after: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("layernorm_after"))?,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(&self.layernorm_before.forward(xs)?)?;
        let xs = (attended + xs)?;

        let mlp = self.intermediate.forward(&self.layernorm_after.forward(&xs)?)?;
        let mlp = self.output.forward(&self.act.forward(&mlp)?)?;
        Ok((mlp + xs)?)
    }
}

/// `VivitForVideoClassification` forward pass, returns logits `(B, num_labels)`
pub struct VivitModel {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    layernorm: LayerNorm,
    classifier: Linear,
}

impl VivitModel {
    pub fn new(cfg: &VivitConfig, vb: VarBuilder) -> Result<Self> {
        let vivit = vb.pp("vivit");
        let encoder = vivit.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::new(cfg, encoder.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embeddings: Embeddings::new(cfg, vivit.pp("embeddings"))?,
            layers,
            layernorm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vivit.pp("layernorm"))?,
            classifier: linear(cfg.hidden_size, cfg.num_labels(), vb.pp("classifier"))?,
        })
    }

    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        let xs = self.layernorm.forward(&xs)?;
        let cls = xs.narrow(1, 0, 1)?.squeeze(1)?;
        Ok(self.classifier.forward(&cls)?)
    }
}

fn select_device() -> Device {
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0).unwrap_or(Device::Cpu);
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    let device = Device::new_cuda(0).unwrap_or(Device::Cpu);
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    let device = Device::Cpu;
    device
}

/// Pretrained ViViT model plus its image processor settings
pub struct VivitClassifier {
    model: Mutex<VivitModel>,
    config: VivitConfig,
    preprocess: PreprocessorConfig,
    device: Device,
}

impl VivitClassifier {
    /// Download (or reuse the cached) checkpoint and build the model
    pub fn from_hub(repo_id: &str, revision: Option<&str>) -> Result<Self> {
        let device = select_device();
        tracing::info!(repo = repo_id, ?revision, ?device, "loading ViViT model");

        let api = Api::new()?;
        let repo = match revision {
            Some(rev) => Repo::with_revision(repo_id.to_string(), RepoType::Model, rev.to_string()),
            None => Repo::new(repo_id.to_string(), RepoType::Model),
        };
        let repo = api.repo(repo);

        let config_path = repo.get("config.json").context("fetching config.json")?;
        let config: VivitConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)
            .context("parsing config.json")?;

        let preprocess = match repo.get("preprocessor_config.json") {
            Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)
                .context("parsing preprocessor_config.json")?,
            Err(e) => {
                tracing::warn!("no preprocessor_config.json ({e}), using ViViT defaults");
                PreprocessorConfig::default()
            }
        };

        let vb = match repo.get("model.safetensors") {
            Ok(path) => unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? },
            Err(e) => {
                tracing::warn!("no model.safetensors ({e}), trying pytorch_model.bin");
                let path = repo
                    .get("pytorch_model.bin")
                    .context("checkpoint has neither model.safetensors nor pytorch_model.bin")?;
                VarBuilder::from_pth(path, DType::F32, &device)?
            }
        };

        let classifier = Self::new(config, preprocess, vb, device)?;
        tracing::info!(
            labels = classifier.config.num_labels(),
            frames = classifier.config.num_frames,
            "ViViT model loaded"
        );
        Ok(classifier)
    }

    pub fn new(
        config: VivitConfig,
        preprocess: PreprocessorConfig,
        vb: VarBuilder,
        device: Device,
    ) -> Result<Self> {
        if config.num_labels() == 0 {
            bail!("model config has no id2label mapping");
        }
        let (h, w) = preprocess.output_size();
        if (h as usize, w as usize) != (config.image_size, config.image_size) {
            bail!(
                "preprocessor crops to {}x{} but the model expects {}x{}",
                h, w, config.image_size, config.image_size
            );
        }

        let model = VivitModel::new(&config, vb)?;
        Ok(Self {
            model: Mutex::new(model),
            config,
            preprocess,
            device,
        })
    }
}

impl VideoClassifier for VivitClassifier {
    fn expected_frames(&self) -> Option<usize> {
        Some(self.config.num_frames)
    }

    fn classify(&self, frames: &[Frame]) -> Result<Prediction> {
        if frames.len() != self.config.num_frames {
            bail!(
                "model expects {} frames per clip, got {}",
                self.config.num_frames,
                frames.len()
            );
        }

        let input = self.preprocess.clip_to_tensor(frames, &self.device)?;
        let logits = {
            let model = self.model.lock().map_err(|e| anyhow!("Lock error: {}", e))?;
            model.forward(&input)?
        };

        let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&logits)?
            .squeeze(0)?
            .to_vec1()?;
        let (class_index, score) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow!("model returned no logits"))?;

        let label = self.config.label(class_index);
        tracing::debug!(class_index, score, %label, "clip classified");

        Ok(Prediction {
            label,
            class_index,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> VivitConfig {
        VivitConfig {
            image_size: 8,
            num_frames: 4,
            tubelet_size: [2, 4, 4],
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            id2label: HashMap::from([
                ("0".to_string(), "archery".to_string()),
                ("1".to_string(), "bowling".to_string()),
                ("2".to_string(), "juggling".to_string()),
            ]),
            ..VivitConfig::default()
        }
    }

    fn tiny_preprocess() -> PreprocessorConfig {
        serde_json::from_str(
            r#"{"size": {"shortest_edge": 10}, "crop_size": {"height": 8, "width": 8}}"#,
        )
        .unwrap()
    }

    fn frame(width: u32, height: u32, seed: u8) -> Frame {
        Frame {
            rgb: (0..width * height * 3).map(|i| (i as u8).wrapping_mul(seed)).collect(),
            width,
            height,
        }
    }

    #[test]
    fn test_config_parses_hub_json() {
        let json = r#"{
            "architectures": ["VivitForVideoClassification"],
            "hidden_act": "gelu_fast",
            "hidden_size": 768,
            "id2label": {"0": "LABEL_0", "1": "fight"},
            "image_size": 224,
            "num_frames": 32,
            "tubelet_size": [2, 16, 16],
            "qkv_bias": true
        }"#;
        let config: VivitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hidden_act, HiddenAct::GeluFast);
        assert_eq!(config.num_labels(), 2);
        assert_eq!(config.num_patches(), 16 * 14 * 14);
        assert_eq!(config.label(1), "fight");
        assert_eq!(config.label(7), "LABEL_7");
    }

    #[test]
    fn test_hidden_act_aliases() {
        let act: HiddenAct = serde_json::from_str(r#""gelu_new""#).unwrap();
        assert_eq!(act, HiddenAct::GeluFast);
        let act: HiddenAct = serde_json::from_str(r#""gelu""#).unwrap();
        assert_eq!(act, HiddenAct::Gelu);
    }

    #[test]
    fn test_forward_produces_logits_per_label() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VivitModel::new(&config, vb).unwrap();

        let input = Tensor::zeros((1, 4, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[1, 3]);
    }

    #[test]
    fn test_forward_rejects_wrong_clip_shape() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VivitModel::new(&config, vb).unwrap();

        // odd frame count does not tile into 2-frame tubelets
        let odd = Tensor::zeros((1, 3, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&odd).is_err());

        // too many tubelets for the position table
        let long = Tensor::zeros((1, 8, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let err = model.forward(&long).unwrap_err();
        assert!(err.to_string().contains("position embeddings"));
    }

    #[test]
    fn test_classifier_resolves_label() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let classifier =
            VivitClassifier::new(tiny_config(), tiny_preprocess(), vb, Device::Cpu).unwrap();
        assert_eq!(classifier.expected_frames(), Some(4));

        let frames: Vec<Frame> = (1..=4).map(|s| frame(20, 12, s)).collect();
        let prediction = classifier.classify(&frames).unwrap();
        assert!(["archery", "bowling", "juggling"].contains(&prediction.label.as_str()));
        assert!(prediction.class_index < 3);
        assert!(prediction.score > 0.0 && prediction.score <= 1.0);

        assert!(classifier.classify(&frames[..3]).is_err());
    }

    #[test]
    fn test_classifier_requires_labels_and_matching_crop() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let no_labels = VivitConfig {
            id2label: HashMap::new(),
            ..tiny_config()
        };
        assert!(VivitClassifier::new(no_labels, tiny_preprocess(), vb.clone(), Device::Cpu).is_err());

        let err = VivitClassifier::new(tiny_config(), PreprocessorConfig::default(), vb, Device::Cpu)
            .err()
            .unwrap();
        assert!(err.to_string().contains("224x224"));
    }

    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    #[test]
    fn test_default_build_runs_on_cpu() {
        assert!(matches!(select_device(), Device::Cpu));
    }
}
