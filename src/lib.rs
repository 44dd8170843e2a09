//! TinyLLaVA-style multimodal model composition on top of candle.
//!
//! A frozen llama decoder, a CLIP vision tower and a learned connector are
//! composed into one sequence model. The crate contributes two things on
//! top of the underlying candle models: the sequence fusion engine that
//! interleaves image embedding blocks into tokenized text ([`fusion`]),
//! and the shard-aware checkpoint loader that reassembles a consolidated
//! checkpoint and routes sub-states to the components ([`checkpoint`]).
//!
//! ```no_run
//! use candle::{DType, Device};
//! use tinyllava::model::{GenerateOptions, TinyLlava};
//!
//! fn main() -> candle::Result<()> {
//!     let device = Device::Cpu;
//!     let model = TinyLlava::from_pretrained("tinyllava/TinyLLaVA-1.5B", DType::F32, &device)?;
//!     let mut cache = model.new_cache(true)?;
//!     let input_ids = candle::Tensor::zeros((1, 8), DType::I64, &device)?;
//!     let images = candle::Tensor::zeros((1, 3, 336, 336), DType::F32, &device)?;
//!     let _tokens = model.generate(
//!         &input_ids,
//!         Some(&images),
//!         None,
//!         &GenerateOptions::default(),
//!         &mut cache,
//!     )?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod constants;
pub mod fusion;
pub mod language_model;
pub mod model;
pub mod utils;
pub mod vision;
