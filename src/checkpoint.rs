//! Consolidated checkpoint resolution and per-component weight routing.
//!
//! A composed model checkpoint is either a single `model.safetensors` file
//! or a sharded set described by `model.safetensors.index.json`, whose
//! `weight_map` field maps each tensor name to the shard file storing it.
//! The merged mapping is then routed to the sub-components by key prefix.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use candle::{bail, DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::VarBuilder;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// One logical checkpoint, reassembled from one file or several shards.
#[derive(Debug, Clone)]
pub struct MergedWeights {
    tensors: HashMap<String, Tensor>,
}

impl MergedWeights {
    /// Determine the loading mode for `path` and merge the checkpoint.
    ///
    /// Returns `Ok(None)` when no consolidated checkpoint is available, in
    /// which case each component falls back to its standalone loading path.
    /// Partial shard problems (missing shard file, tensor absent from its
    /// declared shard) are logged and skipped, never fatal: each component
    /// applies its own strictness when the sub-state is routed to it.
    pub fn resolve(path: &Path, device: &Device) -> candle::Result<Option<Self>> {
        if path.is_file() {
            let tensors = candle::safetensors::load(path, device)?;
            return Ok(Some(Self { tensors }));
        }
        if path.is_dir() {
            let single = path.join("model.safetensors");
            if single.is_file() {
                let tensors = candle::safetensors::load(&single, device)?;
                return Ok(Some(Self { tensors }));
            }
            let index = path.join("model.safetensors.index.json");
            if index.is_file() {
                return Self::from_index(path, &index, device).map(Some);
            }
        }
        Ok(None)
    }

    fn from_index(dir: &Path, index_path: &Path, device: &Device) -> candle::Result<Self> {
        let data = std::fs::read_to_string(index_path)?;
        let index: SafetensorsIndex =
            serde_json::from_str(&data).map_err(candle::Error::wrap)?;

        // Group tensor names by shard so every shard file is opened once.
        let mut by_shard: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tensor_name, shard_name) in index.weight_map {
            by_shard.entry(shard_name).or_default().push(tensor_name);
        }

        let mut tensors = HashMap::new();
        for (shard_name, tensor_names) in by_shard {
            let shard_path = dir.join(&shard_name);
            if !shard_path.is_file() {
                tracing::warn!(
                    shard = %shard_name,
                    "shard file referenced by the index is missing, its tensors stay unresolved"
                );
                continue;
            }
            let shard = candle::safetensors::load(&shard_path, device)?;
            for name in tensor_names {
                match shard.get(&name) {
                    Some(tensor) => {
                        tensors.insert(name, tensor.clone());
                    }
                    None => tracing::warn!(
                        tensor = %name,
                        shard = %shard_name,
                        "tensor not found in its declared shard, skipping"
                    ),
                }
            }
        }
        Ok(Self { tensors })
    }

    /// Extract the sub-state for a component: keys sharing `prefix` plus a
    /// dot separator, with the prefix stripped.
    pub fn route(&self, prefix: &str) -> HashMap<String, Tensor> {
        let dotted = format!("{prefix}.");
        self.tensors
            .iter()
            .filter_map(|(key, tensor)| {
                key.strip_prefix(&dotted)
                    .map(|rest| (rest.to_string(), tensor.clone()))
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

/// Whether mismatched keys during a component load are tolerated or fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Missing or unconsumed keys fail the load; retried once permissively.
    Strict,
    /// Missing keys are zero-filled and logged, unconsumed keys are logged.
    Permissive,
}

/// `SimpleBackend` over a routed sub-state that records which keys the
/// component actually requested, so that unconsumed keys can be reported
/// after the build. In permissive mode a missing key is materialized as
/// zeros instead of failing, the `strict=False` analog for inference code
/// that has no separately initialized parameter store.
struct TrackedTensors {
    tensors: HashMap<String, Tensor>,
    accessed: Arc<Mutex<HashSet<String>>>,
    permissive: bool,
    component: String,
}

impl SimpleBackend for TrackedTensors {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _: candle_nn::Init,
        dtype: DType,
        dev: &Device,
    ) -> candle::Result<Tensor> {
        if let Ok(mut accessed) = self.accessed.lock() {
            accessed.insert(name.to_string());
        }
        match self.tensors.get(name) {
            Some(tensor) => {
                if tensor.shape() != &s {
                    return Err(candle::Error::UnexpectedShape {
                        msg: format!("shape mismatch for {name}"),
                        expected: s,
                        got: tensor.shape().clone(),
                    }
                    .bt());
                }
                tensor.to_device(dev)?.to_dtype(dtype)
            }
            None if self.permissive => {
                tracing::warn!(
                    component = %self.component,
                    tensor = %name,
                    "missing from checkpoint, using zeros"
                );
                Tensor::zeros(s, dtype, dev)
            }
            None => Err(candle::Error::CannotFindTensor {
                path: name.to_string(),
            }
            .bt()),
        }
    }

    // Without a requested shape there is nothing to zero-fill from, so a
    // missing key errors in both modes.
    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> candle::Result<Tensor> {
        if let Ok(mut accessed) = self.accessed.lock() {
            accessed.insert(name.to_string());
        }
        match self.tensors.get(name) {
            Some(tensor) => tensor.to_device(dev)?.to_dtype(dtype),
            None => Err(candle::Error::CannotFindTensor {
                path: name.to_string(),
            }
            .bt()),
        }
    }

    // Presence reflects the routed sub-state in both modes: a builder that
    // branches on it skips a genuinely absent optional parameter instead of
    // receiving zeros for it.
    fn contains_tensor(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

fn build_tracked<T>(
    component: &str,
    tensors: HashMap<String, Tensor>,
    permissive: bool,
    dtype: DType,
    device: &Device,
    build: &impl Fn(VarBuilder) -> candle::Result<T>,
) -> candle::Result<T> {
    let known: HashSet<String> = tensors.keys().cloned().collect();
    let accessed = Arc::new(Mutex::new(HashSet::new()));
    let backend = TrackedTensors {
        tensors,
        accessed: accessed.clone(),
        permissive,
        component: component.to_string(),
    };
    let vb = VarBuilder::from_backend(Box::new(backend), dtype, device.clone());
    let built = build(vb)?;

    let accessed = accessed.lock().map_or_else(|_| HashSet::new(), |a| a.clone());
    let mut unconsumed: Vec<&String> = known.difference(&accessed).collect();
    if !unconsumed.is_empty() {
        unconsumed.sort();
        if permissive {
            tracing::warn!(
                component = %component,
                count = unconsumed.len(),
                first = %unconsumed[0],
                "checkpoint keys not consumed by the component"
            );
        } else {
            bail!(
                "{component}: {} unexpected checkpoint key(s), e.g. {}",
                unconsumed.len(),
                unconsumed[0]
            )
        }
    }
    Ok(built)
}

/// Apply a routed sub-state to a component with the given strictness.
///
/// A strict load that fails for any reason is logged and retried once in
/// permissive mode before the error is surfaced.
pub fn load_component<T>(
    component: &str,
    tensors: HashMap<String, Tensor>,
    strictness: Strictness,
    dtype: DType,
    device: &Device,
    build: impl Fn(VarBuilder) -> candle::Result<T>,
) -> candle::Result<T> {
    match strictness {
        Strictness::Permissive => build_tracked(component, tensors, true, dtype, device, &build),
        Strictness::Strict => {
            match build_tracked(component, tensors.clone(), false, dtype, device, &build) {
                Ok(built) => Ok(built),
                Err(err) => {
                    tracing::warn!(
                        component = %component,
                        error = %err,
                        "strict load failed, retrying permissively"
                    );
                    build_tracked(component, tensors, true, dtype, device, &build)
                }
            }
        }
    }
}
