use candle::bail;
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::ClipVisionConfig;
use candle_transformers::models::llama::{Config as LlamaConfig, LlamaEosToks};
use serde::{Deserialize, Serialize};

use crate::constants::{IGNORE_INDEX, IMAGE_TOKEN_INDEX};

/// Direction used when padding fused samples to a common batch length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

/// Text decoder architectures this crate knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmArch {
    Llama,
}

impl LlmArch {
    pub fn from_name(name: &str) -> candle::Result<Self> {
        let name = name.to_lowercase();
        if name.contains("llama") || name.contains("vicuna") {
            Ok(Self::Llama)
        } else {
            bail!("unsupported language model {name:?}")
        }
    }
}

/// Vision encoder architectures this crate knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionArch {
    Clip,
}

impl VisionArch {
    pub fn from_name(name: &str) -> candle::Result<Self> {
        let name = name.to_lowercase();
        if name.contains("clip") {
            Ok(Self::Clip)
        } else {
            bail!("unsupported vision tower {name:?}")
        }
    }
}

/// Connector (projection) flavors, parsed from the `connector_type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Linear,
    /// `mlp{depth}x_gelu`: `depth` linear layers with gelu between them.
    MlpGelu { depth: usize },
}

impl ConnectorKind {
    pub fn from_type(connector_type: &str) -> candle::Result<Self> {
        if connector_type == "linear" {
            return Ok(Self::Linear);
        }
        if let Some(depth) = connector_type
            .strip_prefix("mlp")
            .and_then(|s| s.strip_suffix("x_gelu"))
            .and_then(|s| s.parse::<usize>().ok())
        {
            if depth == 0 {
                bail!("connector type {connector_type:?} must have at least one layer")
            }
            return Ok(Self::MlpGelu { depth });
        }
        bail!("unsupported connector type {connector_type:?}")
    }
}

/// How to select features from the vision tower's chosen hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSelectStrategy {
    /// Drop the CLS slot, keep patch features only.
    Patch,
    /// Keep CLS and patch features.
    ClsPatch,
}

impl FeatureSelectStrategy {
    pub fn from_name(name: &str) -> candle::Result<Self> {
        match name {
            "default" | "patch" => Ok(Self::Patch),
            "full" | "cls_patch" => Ok(Self::ClsPatch),
            _ => bail!("unsupported vision feature select strategy {name:?}"),
        }
    }
}

/// Architecture tags resolved from the config's free-form name strings.
///
/// Resolution happens once at configuration-validation time so that an
/// unknown name fails before any weight is read.
#[derive(Debug, Clone, Copy)]
pub struct ComponentKinds {
    pub llm: LlmArch,
    pub vision: VisionArch,
    pub connector: ConnectorKind,
    pub feature_select: FeatureSelectStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TinyLlavaConfig {
    pub llm_model_name_or_path: String,
    #[serde(default = "default_vision_model")]
    pub vision_model_name_or_path: String,
    #[serde(default = "default_connector_type")]
    pub connector_type: String,

    // Text decoder geometry.
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    // Vision tower geometry. Defaults match clip-vit-large-patch14-336.
    /// Hidden size of the vision tower, which is also the connector input.
    pub mm_hidden_size: usize,
    #[serde(default = "default_vision_intermediate_size")]
    pub vision_intermediate_size: usize,
    #[serde(default = "default_vision_num_hidden_layers")]
    pub vision_num_hidden_layers: usize,
    #[serde(default = "default_vision_num_attention_heads")]
    pub vision_num_attention_heads: usize,
    #[serde(default = "default_vision_projection_dim")]
    pub vision_projection_dim: usize,
    #[serde(default = "default_vision_image_size")]
    pub vision_image_size: usize,
    #[serde(default = "default_vision_patch_size")]
    pub vision_patch_size: usize,
    #[serde(default = "default_vision_feature_layer")]
    pub vision_feature_layer: isize,
    #[serde(default = "default_vision_feature_select_strategy")]
    pub vision_feature_select_strategy: String,

    // Fusion.
    #[serde(default = "default_image_token_index")]
    pub image_token_index: i64,
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    #[serde(default)]
    pub tokenizer_model_max_length: Option<usize>,
    #[serde(default)]
    pub tokenizer_padding_side: PaddingSide,

    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_vision_model() -> String {
    "openai/clip-vit-large-patch14-336".to_string()
}
fn default_connector_type() -> String {
    "mlp2x_gelu".to_string()
}
fn default_rms_norm_eps() -> f64 {
    1e-5
}
fn default_rope_theta() -> f32 {
    10_000.0
}
fn default_max_position_embeddings() -> usize {
    4096
}
fn default_vision_intermediate_size() -> usize {
    4096
}
fn default_vision_num_hidden_layers() -> usize {
    24
}
fn default_vision_num_attention_heads() -> usize {
    16
}
fn default_vision_projection_dim() -> usize {
    768
}
fn default_vision_image_size() -> usize {
    336
}
fn default_vision_patch_size() -> usize {
    14
}
fn default_vision_feature_layer() -> isize {
    -2
}
fn default_vision_feature_select_strategy() -> String {
    "patch".to_string()
}
fn default_image_token_index() -> i64 {
    IMAGE_TOKEN_INDEX
}
fn default_ignore_index() -> i64 {
    IGNORE_INDEX
}
fn default_use_cache() -> bool {
    true
}

impl TinyLlavaConfig {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> candle::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&data).map_err(candle::Error::wrap)
    }

    /// Resolve the free-form name strings into architecture tags.
    pub fn validate(&self) -> candle::Result<ComponentKinds> {
        Ok(ComponentKinds {
            llm: LlmArch::from_name(&self.llm_model_name_or_path)?,
            vision: VisionArch::from_name(&self.vision_model_name_or_path)?,
            connector: ConnectorKind::from_type(&self.connector_type)?,
            feature_select: FeatureSelectStrategy::from_name(
                &self.vision_feature_select_strategy,
            )?,
        })
    }

    pub fn to_llama_config(&self) -> LlamaConfig {
        LlamaConfig {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads,
            use_flash_attn: false,
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id.map(LlamaEosToks::Single),
            rope_scaling: None,
            max_position_embeddings: self.max_position_embeddings,
            tie_word_embeddings: self.tie_word_embeddings,
        }
    }

    pub fn to_clip_config(&self) -> ClipVisionConfig {
        ClipVisionConfig {
            embed_dim: self.mm_hidden_size,
            activation: Activation::QuickGelu,
            intermediate_size: self.vision_intermediate_size,
            num_hidden_layers: self.vision_num_hidden_layers,
            num_attention_heads: self.vision_num_attention_heads,
            projection_dim: self.vision_projection_dim,
            num_channels: 3,
            image_size: self.vision_image_size,
            patch_size: self.vision_patch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_kind_parsing() -> candle::Result<()> {
        assert_eq!(ConnectorKind::from_type("linear")?, ConnectorKind::Linear);
        assert_eq!(
            ConnectorKind::from_type("mlp2x_gelu")?,
            ConnectorKind::MlpGelu { depth: 2 }
        );
        assert_eq!(
            ConnectorKind::from_type("mlp3x_gelu")?,
            ConnectorKind::MlpGelu { depth: 3 }
        );
        assert!(ConnectorKind::from_type("resampler").is_err());
        assert!(ConnectorKind::from_type("mlp0x_gelu").is_err());
        Ok(())
    }

    #[test]
    fn arch_registry() -> candle::Result<()> {
        assert_eq!(
            LlmArch::from_name("TinyLlama/TinyLlama-1.1B-Chat-v1.0")?,
            LlmArch::Llama
        );
        assert_eq!(LlmArch::from_name("lmsys/vicuna-7b-v1.5")?, LlmArch::Llama);
        assert!(LlmArch::from_name("microsoft/phi-2").is_err());
        assert_eq!(
            VisionArch::from_name("openai/clip-vit-large-patch14-336")?,
            VisionArch::Clip
        );
        assert!(VisionArch::from_name("google/siglip-so400m").is_err());
        Ok(())
    }

    #[test]
    fn feature_select_parsing() -> candle::Result<()> {
        assert_eq!(
            FeatureSelectStrategy::from_name("default")?,
            FeatureSelectStrategy::Patch
        );
        assert_eq!(
            FeatureSelectStrategy::from_name("cls_patch")?,
            FeatureSelectStrategy::ClsPatch
        );
        assert!(FeatureSelectStrategy::from_name("pool").is_err());
        Ok(())
    }

    #[test]
    fn padding_side_deserializes_lowercase() {
        let left: PaddingSide = serde_json::from_str("\"left\"").unwrap();
        assert_eq!(left, PaddingSide::Left);
        let right: PaddingSide = serde_json::from_str("\"right\"").unwrap();
        assert_eq!(right, PaddingSide::Right);
    }
}
