//! Prompt-side helpers.

use candle::{Device, Result, Tensor};
use tokenizers::Tokenizer;

use crate::constants::DEFAULT_IMAGE_TOKEN;

/// Tokenize a prompt containing `<image>` markers, splicing the image
/// placeholder id between the text chunks. Returns ids of shape (1, len).
///
/// The marker itself is never tokenized; each occurrence contributes
/// exactly one placeholder, which fusion later expands into a full image
/// embedding block.
pub fn tokenizer_image_token(
    prompt: &str,
    tokenizer: &Tokenizer,
    image_token_index: i64,
    bos_token_id: Option<u32>,
    device: &Device,
) -> Result<Tensor> {
    let mut input_ids: Vec<i64> = Vec::new();
    if let Some(bos) = bos_token_id {
        input_ids.push(bos as i64);
    }
    for (i, chunk) in prompt.split(DEFAULT_IMAGE_TOKEN).enumerate() {
        if i > 0 {
            input_ids.push(image_token_index);
        }
        if chunk.is_empty() {
            continue;
        }
        let encoding = tokenizer
            .encode(chunk, false)
            .map_err(|e| candle::Error::Msg(format!("cannot tokenize prompt chunk: {e}")))?;
        input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
    }
    let len = input_ids.len();
    Tensor::from_vec(input_ids, (1, len), device)
}
