//! CLIP vision tower with configurable feature layer and selection.

use candle::{bail, IndexOp, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};

use crate::config::FeatureSelectStrategy;

#[derive(Debug, Clone)]
pub struct ClipVisionTower {
    model: ClipVisionTransformer,
    feature_layer: isize,
    select: FeatureSelectStrategy,
}

impl ClipVisionTower {
    /// Checkpoint keys live under `vision_model.*`, matching both the CLIP
    /// standalone layout and the routed `vision_tower.` sub-state.
    pub fn new(
        cfg: &ClipVisionConfig,
        feature_layer: isize,
        select: FeatureSelectStrategy,
        vb: VarBuilder,
    ) -> Result<Self> {
        let model = ClipVisionTransformer::new(vb.pp("vision_model"), cfg)?;
        Ok(Self {
            model,
            feature_layer,
            select,
        })
    }

    /// Encode a batch of pixel tensors (batch, 3, h, w) into patch feature
    /// sequences (batch, patches, mm_hidden).
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let hidden_states = self.model.output_hidden_states(images)?;
        // The transformer appends the 2-D pooled output as the last entry;
        // it is not a per-patch hidden state and is excluded from layer
        // selection, so -1 resolves to the final encoder layer.
        let num_states = hidden_states.len().saturating_sub(1);
        let index = if self.feature_layer < 0 {
            num_states as isize + self.feature_layer
        } else {
            self.feature_layer
        };
        if index < 0 || index as usize >= num_states {
            bail!(
                "vision feature layer {} out of range for {} hidden states",
                self.feature_layer,
                num_states
            )
        }
        let features = &hidden_states[index as usize];
        match self.select {
            // Slot 0 is the CLS embedding.
            FeatureSelectStrategy::Patch => features.i((.., 1.., ..)),
            FeatureSelectStrategy::ClsPatch => Ok(features.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn tiny_config() -> ClipVisionConfig {
        ClipVisionConfig {
            embed_dim: 8,
            activation: candle_transformers::models::clip::text_model::Activation::QuickGelu,
            intermediate_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            projection_dim: 8,
            num_channels: 3,
            image_size: 8,
            patch_size: 4,
        }
    }

    #[test]
    fn patch_select_drops_cls_slot() -> Result<()> {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = ClipVisionTower::new(&cfg, -2, FeatureSelectStrategy::Patch, vb)?;
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        let features = tower.forward(&images)?;
        // 8x8 image with 4x4 patches -> 4 patches once CLS is dropped.
        assert_eq!(features.dims3()?, (1, 4, 8));
        Ok(())
    }

    #[test]
    fn cls_patch_select_keeps_cls_slot() -> Result<()> {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = ClipVisionTower::new(&cfg, -2, FeatureSelectStrategy::ClsPatch, vb)?;
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        let features = tower.forward(&images)?;
        assert_eq!(features.dims3()?, (1, 5, 8));
        Ok(())
    }

    #[test]
    fn last_layer_selection_stays_in_patch_space() -> Result<()> {
        // -1 must select the final encoder layer, never the pooled output.
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = ClipVisionTower::new(&cfg, -1, FeatureSelectStrategy::Patch, vb)?;
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        let features = tower.forward(&images)?;
        assert_eq!(features.dims3()?, (1, 4, 8));
        Ok(())
    }

    #[test]
    fn feature_layer_out_of_range_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = ClipVisionTower::new(&cfg, -64, FeatureSelectStrategy::Patch, vb)?;
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        assert!(tower.forward(&images).is_err());
        Ok(())
    }
}
