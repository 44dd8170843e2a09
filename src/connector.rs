//! Learned projection from vision features to the decoder embedding space.

use candle::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::ConnectorKind;

/// Checkpoint keys follow the transformers `nn.Sequential` layout: linear
/// layers at even indices, activations between them ("0", "2", ...).
#[derive(Debug, Clone)]
pub enum Connector {
    Linear(Linear),
    MlpGelu(Vec<Linear>),
}

impl Connector {
    pub fn new(
        kind: ConnectorKind,
        mm_hidden_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            ConnectorKind::Linear => {
                Ok(Self::Linear(linear(mm_hidden_size, hidden_size, vb.pp("0"))?))
            }
            ConnectorKind::MlpGelu { depth } => {
                let mut layers = Vec::with_capacity(depth);
                layers.push(linear(mm_hidden_size, hidden_size, vb.pp("0"))?);
                for i in 1..depth {
                    layers.push(linear(hidden_size, hidden_size, vb.pp(2 * i))?);
                }
                Ok(Self::MlpGelu(layers))
            }
        }
    }
}

impl Module for Connector {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(layer) => layer.forward(xs),
            Self::MlpGelu(layers) => {
                let mut xs = layers[0].forward(xs)?;
                for layer in &layers[1..] {
                    xs = layer.forward(&xs.gelu()?)?;
                }
                Ok(xs)
            }
        }
    }
}
