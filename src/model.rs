//! The composed multimodal model: decoder + vision tower + connector.

use std::path::{Path, PathBuf};

use candle::{bail, DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::Cache;
use tokenizers::Tokenizer;

use crate::checkpoint::{load_component, MergedWeights, Strictness};
use crate::config::TinyLlavaConfig;
use crate::connector::Connector;
use crate::constants::{CONNECTOR_PREFIX, LANGUAGE_MODEL_PREFIX, VISION_TOWER_PREFIX};
use crate::fusion::{FusionOutput, SequenceFuser};
use crate::language_model::LanguageModel;
use crate::vision::ClipVisionTower;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub seed: u64,
    /// Overrides the config's eos token when set.
    pub eos_token_id: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.2,
            top_p: None,
            seed: 299792458,
            eos_token_id: None,
        }
    }
}

pub struct TinyLlava {
    language_model: LanguageModel,
    vision_tower: ClipVisionTower,
    connector: Connector,
    tokenizer: Option<Tokenizer>,
    fuser: SequenceFuser,
    config: TinyLlavaConfig,
    device: Device,
    dtype: DType,
}

impl TinyLlava {
    /// Build all components from a single weight source, using the
    /// component key prefixes (`language_model.*`, `vision_tower.*`,
    /// `connector.*`).
    pub fn new(cfg: &TinyLlavaConfig, vb: VarBuilder) -> Result<Self> {
        let kinds = cfg.validate()?;
        let language_model =
            LanguageModel::new(kinds.llm, cfg, vb.pp(LANGUAGE_MODEL_PREFIX))?;
        let vision_tower = ClipVisionTower::new(
            &cfg.to_clip_config(),
            cfg.vision_feature_layer,
            kinds.feature_select,
            vb.pp(VISION_TOWER_PREFIX),
        )?;
        let connector = Connector::new(
            kinds.connector,
            cfg.mm_hidden_size,
            cfg.hidden_size,
            vb.pp(CONNECTOR_PREFIX),
        )?;
        let mut model = Self {
            language_model,
            vision_tower,
            connector,
            tokenizer: None,
            fuser: SequenceFuser::from_config(cfg),
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        };
        model.language_model.set_frozen(true);
        Ok(model)
    }

    /// Load from a model directory containing `config.json` and either a
    /// consolidated checkpoint or the pieces for per-component fallback
    /// loading. `model_id_or_path` may also be a hub model id.
    pub fn from_pretrained(
        model_id_or_path: &str,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let model_dir = resolve_model_dir(model_id_or_path)?;
        let cfg = TinyLlavaConfig::from_json_file(model_dir.join("config.json"))?;
        Self::load(&cfg, &model_dir, dtype, device)
    }

    /// Prefer one consolidated (possibly sharded) checkpoint routed to the
    /// components; fall back to standalone per-component loading when none
    /// is found. The decoder and connector load permissively, the vision
    /// tower strictly with a single permissive retry.
    pub fn load(
        cfg: &TinyLlavaConfig,
        model_dir: &Path,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let kinds = cfg.validate()?;
        let merged = MergedWeights::resolve(model_dir, device)?;

        let language_model = match &merged {
            Some(merged) => load_component(
                LANGUAGE_MODEL_PREFIX,
                merged.route(LANGUAGE_MODEL_PREFIX),
                Strictness::Permissive,
                dtype,
                device,
                |vb| LanguageModel::new(kinds.llm, cfg, vb),
            )?,
            None => {
                tracing::info!(
                    model = %cfg.llm_model_name_or_path,
                    "no consolidated checkpoint, loading base language model"
                );
                let base_dir = resolve_model_dir(&cfg.llm_model_name_or_path)?;
                let tensors = match MergedWeights::resolve(&base_dir, device)? {
                    Some(weights) => weights.into_tensors(),
                    None => bail!(
                        "no checkpoint found for base language model in {base_dir:?}"
                    ),
                };
                load_component(
                    LANGUAGE_MODEL_PREFIX,
                    tensors,
                    Strictness::Permissive,
                    dtype,
                    device,
                    |vb| LanguageModel::new(kinds.llm, cfg, vb),
                )?
            }
        };

        let build_tower = |vb: VarBuilder| {
            ClipVisionTower::new(
                &cfg.to_clip_config(),
                cfg.vision_feature_layer,
                kinds.feature_select,
                vb,
            )
        };
        let vision_tower = match &merged {
            Some(merged) => load_component(
                VISION_TOWER_PREFIX,
                merged.route(VISION_TOWER_PREFIX),
                Strictness::Strict,
                dtype,
                device,
                build_tower,
            )?,
            None => {
                tracing::info!(
                    model = %cfg.vision_model_name_or_path,
                    "no consolidated checkpoint, loading vision tower"
                );
                let tower_dir = resolve_model_dir(&cfg.vision_model_name_or_path)?;
                let tensors = match MergedWeights::resolve(&tower_dir, device)? {
                    Some(weights) => weights.into_tensors(),
                    None => bail!("no checkpoint found for vision tower in {tower_dir:?}"),
                };
                load_component(
                    VISION_TOWER_PREFIX,
                    tensors,
                    Strictness::Strict,
                    dtype,
                    device,
                    build_tower,
                )?
            }
        };

        let build_connector = |vb: VarBuilder| {
            Connector::new(kinds.connector, cfg.mm_hidden_size, cfg.hidden_size, vb)
        };
        let connector = match &merged {
            Some(merged) => load_component(
                CONNECTOR_PREFIX,
                merged.route(CONNECTOR_PREFIX),
                Strictness::Permissive,
                dtype,
                device,
                build_connector,
            )?,
            None => {
                let connector_file = model_dir.join("connector.safetensors");
                if !connector_file.is_file() {
                    bail!(
                        "no consolidated checkpoint and no connector.safetensors in {model_dir:?}"
                    )
                }
                let tensors = candle::safetensors::load(&connector_file, device)?;
                load_component(
                    CONNECTOR_PREFIX,
                    tensors,
                    Strictness::Permissive,
                    dtype,
                    device,
                    build_connector,
                )?
            }
        };

        let tokenizer_file = model_dir.join("tokenizer.json");
        let tokenizer = if tokenizer_file.is_file() {
            Some(Tokenizer::from_file(&tokenizer_file).map_err(|e| {
                candle::Error::Msg(format!("cannot load tokenizer from {tokenizer_file:?}: {e}"))
            })?)
        } else {
            None
        };

        // Weights first, trainability second.
        let mut language_model = language_model;
        language_model.set_frozen(true);

        Ok(Self {
            language_model,
            vision_tower,
            connector,
            tokenizer,
            fuser: SequenceFuser::from_config(cfg),
            config: cfg.clone(),
            device: device.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &TinyLlavaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    pub fn language_model(&self) -> &LanguageModel {
        &self.language_model
    }

    pub fn new_cache(&self, use_kv_cache: bool) -> Result<Cache> {
        self.language_model
            .new_cache(&self.config, use_kv_cache, self.dtype, &self.device)
    }

    /// Encode a batch of images (n, 3, h, w) into the flat stack of image
    /// embedding blocks (n, patches, hidden) consumed by fusion.
    pub fn encode_images(&self, images: &Tensor) -> Result<Tensor> {
        let features = self.vision_tower.forward(images)?;
        self.connector.forward(&features)
    }

    /// Run the fusion engine on raw inputs. Public so that training
    /// pipelines can obtain fused labels without running the decoder.
    pub fn prepare_multimodal_inputs(
        &self,
        input_ids: &Tensor,
        position_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
        images: Option<&Tensor>,
    ) -> Result<FusionOutput> {
        let (_, seq_len) = input_ids.dims2()?;
        let image_features = match images {
            Some(images) if seq_len > 1 => Some(self.encode_images(images)?),
            _ => None,
        };
        self.fuser.fuse(
            |ids| self.language_model.embed(ids),
            input_ids,
            position_ids,
            attention_mask,
            labels,
            image_features.as_ref(),
        )
    }

    /// Forward pass returning logits for the final position (batch, vocab).
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        images: Option<&Tensor>,
        index_pos: usize,
        cache: &mut Cache,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if index_pos > 0 && seq_len > 1 && images.is_some() {
            bail!("images cannot be combined with a multi-token incremental decoding step")
        }
        let input_embeds = match self.prepare_multimodal_inputs(
            input_ids,
            None,
            attention_mask,
            None,
            images,
        )? {
            FusionOutput::Fused(batch) => batch.input_embeds,
            FusionOutput::PassThrough => self.language_model.embed(input_ids)?,
        };
        self.language_model
            .forward_input_embed(&input_embeds, index_pos, cache)
    }

    /// Sample up to `max_new_tokens` continuation tokens for one sequence.
    ///
    /// `input_embeds` is rejected up front: precomputed embeddings combined
    /// with a generation request leave the image handling ambiguous.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        images: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        opts: &GenerateOptions,
        cache: &mut Cache,
    ) -> Result<Vec<u32>> {
        if input_embeds.is_some() {
            bail!("precomputed input embeddings are not supported by generate")
        }
        let (batch_size, _) = input_ids.dims2()?;
        if batch_size != 1 {
            bail!("generate expects a batch of one sequence, got {batch_size}")
        }

        let mut embeds = match self.prepare_multimodal_inputs(
            input_ids, None, None, None, images,
        )? {
            FusionOutput::Fused(batch) => batch.input_embeds,
            FusionOutput::PassThrough => self.language_model.embed(input_ids)?,
        };

        let sampling = if opts.temperature <= 0. {
            Sampling::ArgMax
        } else {
            match opts.top_p {
                Some(p) => Sampling::TopP {
                    p,
                    temperature: opts.temperature,
                },
                None => Sampling::All {
                    temperature: opts.temperature,
                },
            }
        };
        let mut logits_processor = LogitsProcessor::from_sampling(opts.seed, sampling);
        let eos_token_id = opts.eos_token_id.or(self.config.eos_token_id);

        let mut tokens = Vec::new();
        let mut index_pos = 0;
        for step in 0..opts.max_new_tokens {
            let (_, embed_len, _) = embeds.dims3()?;
            let (context_size, context_index) = if cache.use_kv_cache && step > 0 {
                (1, index_pos)
            } else {
                (embed_len, 0)
            };
            let input = embeds.i((.., embed_len - context_size.., ..))?;
            let logits = self
                .language_model
                .forward_input_embed(&input, context_index, cache)?;
            let logits = logits.squeeze(0)?;
            index_pos += input.dim(1)?;
            let next_token = logits_processor.sample(&logits)?;
            if Some(next_token) == eos_token_id {
                break;
            }
            tokens.push(next_token);
            let next_ids = Tensor::from_vec(vec![next_token], (1, 1), &self.device)?;
            let next_embeds = self.language_model.embed(&next_ids)?;
            embeds = Tensor::cat(&[&embeds, &next_embeds], 1)?;
        }
        Ok(tokens)
    }
}

/// Use `model_id_or_path` as a local directory when it exists, otherwise
/// fetch the hub snapshot (config plus consolidated weights when present).
fn resolve_model_dir(model_id_or_path: &str) -> Result<PathBuf> {
    let path = Path::new(model_id_or_path);
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    use hf_hub::api::sync::Api;
    use hf_hub::{Repo, RepoType};

    let api = Api::new().map_err(candle::Error::wrap)?;
    let repo = api.repo(Repo::new(model_id_or_path.to_string(), RepoType::Model));
    let config_path = repo.get("config.json").map_err(candle::Error::wrap)?;

    // Best effort: a single weight file, or an index plus all its shards.
    if repo.get("model.safetensors").is_err() {
        if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let data = std::fs::read_to_string(&index_path)?;
            let index: serde_json::Value =
                serde_json::from_str(&data).map_err(candle::Error::wrap)?;
            if let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) {
                let mut shards: Vec<&str> =
                    weight_map.values().filter_map(|v| v.as_str()).collect();
                shards.sort_unstable();
                shards.dedup();
                for shard in shards {
                    if let Err(err) = repo.get(shard) {
                        tracing::warn!(shard = %shard, error = %err, "failed to fetch shard");
                    }
                }
            }
        }
    }

    match config_path.parent() {
        Some(dir) => Ok(dir.to_path_buf()),
        None => bail!("cannot determine snapshot directory for {model_id_or_path:?}"),
    }
}
