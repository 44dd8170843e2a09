//! Interleaving of image embedding blocks into tokenized text sequences.
//!
//! This is the multimodal counterpart of an embedding lookup: every
//! occurrence of the image placeholder token in a sample is replaced by one
//! image embedding block, labels and attention masks are rebuilt to stay
//! aligned, and the batch is padded back to a rectangular shape.

use candle::{bail, DType, Result, Tensor};

use crate::config::{PaddingSide, TinyLlavaConfig};

/// One padded batch of fused inputs, ready for the decoder.
///
/// `position_ids`, `attention_mask` and `labels` are `Some` exactly when
/// the corresponding argument was supplied by the caller: the defaulting
/// performed internally during fusion is not observable.
#[derive(Debug, Clone)]
pub struct FusedBatch {
    /// (batch, max_len, hidden)
    pub input_embeds: Tensor,
    /// (batch, max_len), i64, restarting at 0 on the first real token.
    pub position_ids: Option<Tensor>,
    /// (batch, max_len), in the caller's mask dtype, nonzero exactly at
    /// non-padding positions.
    pub attention_mask: Option<Tensor>,
    /// (batch, max_len), i64, ignore at image and padding positions.
    pub labels: Option<Tensor>,
}

/// Outcome of a fusion call.
#[derive(Debug, Clone)]
pub enum FusionOutput {
    /// No fusion was needed; the caller's inputs are valid as-is and token
    /// ids should be embedded directly.
    PassThrough,
    Fused(FusedBatch),
}

#[derive(Debug, Clone)]
pub struct SequenceFuser {
    image_token_index: i64,
    ignore_index: i64,
    padding_side: PaddingSide,
    max_seq_len: Option<usize>,
    span: tracing::Span,
}

impl SequenceFuser {
    pub fn new(
        image_token_index: i64,
        ignore_index: i64,
        padding_side: PaddingSide,
        max_seq_len: Option<usize>,
    ) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "sequence-fusion");
        Self {
            image_token_index,
            ignore_index,
            padding_side,
            max_seq_len,
            span,
        }
    }

    pub fn from_config(cfg: &TinyLlavaConfig) -> Self {
        Self::new(
            cfg.image_token_index,
            cfg.ignore_index,
            cfg.tokenizer_padding_side,
            cfg.tokenizer_model_max_length,
        )
    }

    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Fuse a batch of token ids with image embedding blocks.
    ///
    /// `embed` maps a u32 id tensor of shape (len,) to embeddings of shape
    /// (len, hidden); it is invoked once per sample on the concatenation of
    /// that sample's text segments. `image_features` is the flat stack of
    /// image blocks for the whole batch, shape (num_blocks, patches,
    /// hidden), in the order the images were supplied to the encoder.
    ///
    /// With no image features, or with single-token inputs (an incremental
    /// decoding step), the inputs pass through unchanged.
    pub fn fuse(
        &self,
        embed: impl Fn(&Tensor) -> Result<Tensor>,
        input_ids: &Tensor,
        position_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
        image_features: Option<&Tensor>,
    ) -> Result<FusionOutput> {
        let _enter = self.span.enter();
        let (batch_size, seq_len) = input_ids.dims2()?;
        let image_features = match image_features {
            None => return Ok(FusionOutput::PassThrough),
            Some(_) if seq_len == 1 => return Ok(FusionOutput::PassThrough),
            Some(features) => features,
        };
        let (_, _, hidden_size) = image_features.dims3()?;
        let device = input_ids.device();

        let ids = to_i64(input_ids)?.to_vec2::<i64>()?;
        // Dummy mask/labels when absent, internal bookkeeping only.
        let mask = match attention_mask {
            Some(mask) => {
                if mask.dims2()? != (batch_size, seq_len) {
                    bail!(
                        "attention mask shape {:?} does not match input ids shape {:?}",
                        mask.shape(),
                        input_ids.shape()
                    )
                }
                mask.to_dtype(DType::U8)?.to_vec2::<u8>()?
            }
            None => vec![vec![1u8; seq_len]; batch_size],
        };
        let label_rows = match labels {
            Some(labels) => {
                if labels.dims2()? != (batch_size, seq_len) {
                    bail!(
                        "labels shape {:?} do not match input ids shape {:?}",
                        labels.shape(),
                        input_ids.shape()
                    )
                }
                to_i64(labels)?.to_vec2::<i64>()?
            }
            None => vec![vec![self.ignore_index; seq_len]; batch_size],
        };

        // Depad, then interleave sample by sample with an explicit cursor
        // into the shared image block stack.
        let mut fused: Vec<(Tensor, Vec<i64>)> = Vec::with_capacity(batch_size);
        let mut cursor = 0usize;
        for ((sample_ids, sample_mask), sample_labels) in
            ids.iter().zip(mask.iter()).zip(label_rows.iter())
        {
            let mut dense_ids = Vec::with_capacity(seq_len);
            let mut dense_labels = Vec::with_capacity(seq_len);
            for ((&id, &m), &label) in sample_ids
                .iter()
                .zip(sample_mask.iter())
                .zip(sample_labels.iter())
            {
                if m != 0 {
                    dense_ids.push(id);
                    dense_labels.push(label);
                }
            }
            let (embeds, labels, next_cursor) =
                self.fuse_sample(&embed, &dense_ids, &dense_labels, image_features, cursor)?;
            cursor = next_cursor;
            fused.push((embeds, labels));
        }

        // Image blocks can make sequences longer than the configured cap.
        if let Some(max_seq_len) = self.max_seq_len {
            for (embeds, labels) in fused.iter_mut() {
                let len = embeds.dim(0)?;
                if len > max_seq_len {
                    *embeds = embeds.narrow(0, 0, max_seq_len)?;
                    labels.truncate(max_seq_len);
                }
            }
        }

        let mut max_len = 0usize;
        for (embeds, _) in fused.iter() {
            max_len = max_len.max(embeds.dim(0)?);
        }

        let dtype = image_features.dtype();
        let mut embed_rows = Vec::with_capacity(batch_size);
        let mut label_out = Vec::with_capacity(batch_size * max_len);
        let mut mask_out = Vec::with_capacity(batch_size * max_len);
        let mut position_out = Vec::with_capacity(batch_size * max_len);
        for (embeds, labels) in fused {
            let cur_len = embeds.dim(0)?;
            let pad = max_len - cur_len;
            let row = if cur_len == 0 {
                Tensor::zeros((max_len, hidden_size), dtype, device)?
            } else if pad == 0 {
                embeds
            } else {
                let padding = Tensor::zeros((pad, hidden_size), dtype, device)?;
                match self.padding_side {
                    PaddingSide::Left => Tensor::cat(&[&padding, &embeds], 0)?,
                    PaddingSide::Right => Tensor::cat(&[&embeds, &padding], 0)?,
                }
            };
            embed_rows.push(row);

            match self.padding_side {
                PaddingSide::Left => {
                    label_out.extend(std::iter::repeat(self.ignore_index).take(pad));
                    label_out.extend_from_slice(&labels);
                    mask_out.extend(std::iter::repeat(0u8).take(pad));
                    mask_out.extend(std::iter::repeat(1u8).take(cur_len));
                    position_out.extend(std::iter::repeat(0i64).take(pad));
                    position_out.extend(0..cur_len as i64);
                }
                PaddingSide::Right => {
                    label_out.extend_from_slice(&labels);
                    label_out.extend(std::iter::repeat(self.ignore_index).take(pad));
                    mask_out.extend(std::iter::repeat(1u8).take(cur_len));
                    mask_out.extend(std::iter::repeat(0u8).take(pad));
                    position_out.extend(0..cur_len as i64);
                    position_out.extend(std::iter::repeat(0i64).take(pad));
                }
            }
        }

        let input_embeds = Tensor::stack(&embed_rows, 0)?;
        // Outputs mirror the presence of the caller's original arguments.
        let out_labels = match labels {
            Some(_) => Some(Tensor::from_vec(label_out, (batch_size, max_len), device)?),
            None => None,
        };
        let out_mask = match attention_mask {
            Some(original) => {
                let mask = Tensor::from_vec(mask_out, (batch_size, max_len), device)?;
                // Hand back the mask in the dtype the caller supplied it in.
                Some(if original.dtype() == DType::U8 {
                    mask
                } else {
                    mask.to_dtype(original.dtype())?
                })
            }
            None => None,
        };
        let out_positions = match position_ids {
            Some(_) => Some(Tensor::from_vec(
                position_out,
                (batch_size, max_len),
                device,
            )?),
            None => None,
        };
        Ok(FusionOutput::Fused(FusedBatch {
            input_embeds,
            position_ids: out_positions,
            attention_mask: out_mask,
            labels: out_labels,
        }))
    }

    /// Fuse one dense (depadded) sample, starting from `cursor` into the
    /// shared image block stack. Returns the fused embeddings of shape
    /// (len, hidden), the aligned labels, and the advanced cursor.
    ///
    /// A sample without image tokens still draws one block round-robin when
    /// blocks remain: batches commonly pad imageless samples with a dummy
    /// image so that the flat block stack stays index-aligned with samples.
    pub fn fuse_sample(
        &self,
        embed: &impl Fn(&Tensor) -> Result<Tensor>,
        ids: &[i64],
        labels: &[i64],
        image_features: &Tensor,
        cursor: usize,
    ) -> Result<(Tensor, Vec<i64>, usize)> {
        if ids.len() != labels.len() {
            bail!(
                "ids and labels disagree in length: {} vs {}",
                ids.len(),
                labels.len()
            )
        }
        let (num_blocks, _, hidden_size) = image_features.dims3()?;
        let device = image_features.device();

        let sentinel_at: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter_map(|(i, &id)| (id == self.image_token_index).then_some(i))
            .collect();

        if sentinel_at.is_empty() {
            let embeds = if ids.is_empty() {
                Tensor::zeros((0, hidden_size), image_features.dtype(), device)?
            } else {
                let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
                let len = ids.len();
                embed(&Tensor::from_vec(ids, len, device)?)?
            };
            let cursor = if cursor < num_blocks { cursor + 1 } else { cursor };
            return Ok((embeds, labels.to_vec(), cursor));
        }

        // Text segments between sentinels; a single embedding lookup over
        // their concatenation, re-split by segment length afterwards.
        let mut segment_ids: Vec<u32> = Vec::with_capacity(ids.len());
        let mut segments: Vec<(usize, usize)> = Vec::with_capacity(sentinel_at.len() + 1);
        let mut start = 0usize;
        for &sentinel in sentinel_at.iter().chain(std::iter::once(&ids.len())) {
            let offset = segment_ids.len();
            segment_ids.extend(ids[start..sentinel].iter().map(|&id| id as u32));
            segments.push((offset, sentinel - start));
            start = sentinel + 1;
        }
        let text_embeds = if segment_ids.is_empty() {
            None
        } else {
            let len = segment_ids.len();
            Some(embed(&Tensor::from_vec(segment_ids, len, device)?)?)
        };

        let mut parts = Vec::with_capacity(2 * sentinel_at.len() + 1);
        let mut fused_labels = Vec::with_capacity(ids.len());
        let mut cursor = cursor;
        let mut label_start = 0usize;
        for (i, &(offset, len)) in segments.iter().enumerate() {
            if len > 0 {
                let text_embeds = match text_embeds.as_ref() {
                    Some(embeds) => embeds,
                    None => bail!("internal error: non-empty segment without embeddings"),
                };
                parts.push(text_embeds.narrow(0, offset, len)?);
                fused_labels.extend_from_slice(&labels[label_start..label_start + len]);
            }
            label_start += len + 1;
            if i < sentinel_at.len() {
                if cursor >= num_blocks {
                    bail!(
                        "sample has more image tokens than available image blocks ({num_blocks})"
                    )
                }
                let block = image_features.get(cursor)?;
                cursor += 1;
                fused_labels.extend(std::iter::repeat(self.ignore_index).take(block.dim(0)?));
                parts.push(block);
            }
        }
        let embeds = Tensor::cat(&parts, 0)?;
        Ok((embeds, fused_labels, cursor))
    }
}

fn to_i64(t: &Tensor) -> Result<Tensor> {
    if t.dtype() == DType::I64 {
        Ok(t.clone())
    } else {
        t.to_dtype(DType::I64)
    }
}
