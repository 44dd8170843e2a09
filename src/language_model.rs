//! Text decoder behind a closed set of architecture variants.

use candle::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Llama};

use crate::config::{LlmArch, TinyLlavaConfig};

/// The decoder of the composed model. One variant per supported
/// architecture; the variant is picked by the registry at config time,
/// never by string matching at a call site.
#[derive(Debug, Clone)]
pub enum LanguageModel {
    Llama { model: Llama, frozen: bool },
}

impl LanguageModel {
    pub fn new(arch: LlmArch, cfg: &TinyLlavaConfig, vb: VarBuilder) -> Result<Self> {
        match arch {
            LlmArch::Llama => {
                let model = Llama::load(vb, &cfg.to_llama_config())?;
                Ok(Self::Llama {
                    model,
                    frozen: false,
                })
            }
        }
    }

    pub fn new_cache(
        &self,
        cfg: &TinyLlavaConfig,
        use_kv_cache: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Cache> {
        match self {
            Self::Llama { .. } => Cache::new(use_kv_cache, dtype, &cfg.to_llama_config(), device),
        }
    }

    /// Mark the decoder read-only. A separate phase from weight loading:
    /// load first, then freeze.
    pub fn set_frozen(&mut self, value: bool) {
        match self {
            Self::Llama { frozen, .. } => *frozen = value,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Self::Llama { frozen, .. } => *frozen,
        }
    }

    /// Token embedding lookup. Accepts ids of any integer shape and returns
    /// the same shape with a trailing hidden dimension. When frozen, the
    /// result is detached so no gradient flows into the decoder's table.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        match self {
            Self::Llama { model, frozen } => {
                let input_ids = if input_ids.dtype() == DType::U32 {
                    input_ids.clone()
                } else {
                    input_ids.to_dtype(DType::U32)?
                };
                let embeds = model.embed(&input_ids)?;
                if *frozen {
                    Ok(embeds.detach())
                } else {
                    Ok(embeds)
                }
            }
        }
    }

    /// Decoder forward over precomputed embeddings (batch, seq, hidden),
    /// returning logits for the final position (batch, vocab).
    pub fn forward_input_embed(
        &self,
        input_embeds: &Tensor,
        index_pos: usize,
        cache: &mut Cache,
    ) -> Result<Tensor> {
        match self {
            Self::Llama { model, .. } => model.forward_input_embed(input_embeds, index_pos, cache),
        }
    }
}
