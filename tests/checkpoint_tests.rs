use std::collections::HashMap;

use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;
use tinyllava::checkpoint::{load_component, MergedWeights, Strictness};

/// Scratch directory cleaned up on drop, one per test.
struct TmpDir(std::path::PathBuf);

impl TmpDir {
    fn create(base: &str) -> TmpDir {
        let dir = std::env::temp_dir().join(format!(
            "tinyllava-{}-{}-{:?}",
            base,
            std::process::id(),
            std::thread::current().id(),
        ));
        std::fs::create_dir_all(&dir).unwrap();
        TmpDir(dir)
    }

    fn path(&self) -> &std::path::Path {
        self.0.as_path()
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn save_shard(dir: &std::path::Path, name: &str, tensors: &[(&str, &Tensor)]) -> Result<()> {
    let map: HashMap<String, Tensor> = tensors
        .iter()
        .map(|(k, v)| (k.to_string(), (*v).clone()))
        .collect();
    candle::safetensors::save(&map, dir.join(name))
}

fn write_index(dir: &std::path::Path, weight_map: &[(&str, &str)]) {
    let map: serde_json::Map<String, serde_json::Value> = weight_map
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let index = serde_json::json!({ "weight_map": map });
    std::fs::write(
        dir.join("model.safetensors.index.json"),
        serde_json::to_string(&index).unwrap(),
    )
    .unwrap();
}

#[test]
fn merges_tensors_across_shards() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("merge");
    let w1 = Tensor::new(&[1f32, 2., 3.], &device)?;
    let w2 = Tensor::new(&[4f32, 5.], &device)?;
    save_shard(tmp.path(), "shard1.safetensors", &[("w1", &w1)])?;
    save_shard(tmp.path(), "shard2.safetensors", &[("w2", &w2)])?;
    write_index(
        tmp.path(),
        &[("w1", "shard1.safetensors"), ("w2", "shard2.safetensors")],
    );

    let merged = MergedWeights::resolve(tmp.path(), &device)?.expect("index present");
    assert_eq!(merged.len(), 2);
    assert_eq!(
        merged.get("w1").expect("w1 merged").to_vec1::<f32>()?,
        [1., 2., 3.]
    );
    assert_eq!(
        merged.get("w2").expect("w2 merged").to_vec1::<f32>()?,
        [4., 5.]
    );
    Ok(())
}

#[test]
fn missing_shard_file_is_skipped_not_fatal() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("missing-shard");
    let w1 = Tensor::new(&[1f32], &device)?;
    save_shard(tmp.path(), "shard1.safetensors", &[("w1", &w1)])?;
    write_index(
        tmp.path(),
        &[("w1", "shard1.safetensors"), ("w2", "gone.safetensors")],
    );

    let merged = MergedWeights::resolve(tmp.path(), &device)?.expect("index present");
    assert_eq!(merged.len(), 1);
    assert!(merged.get("w1").is_some());
    assert!(merged.get("w2").is_none());
    Ok(())
}

#[test]
fn tensor_absent_from_its_declared_shard_is_skipped() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("missing-tensor");
    let w1 = Tensor::new(&[1f32], &device)?;
    save_shard(tmp.path(), "shard1.safetensors", &[("w1", &w1)])?;
    write_index(
        tmp.path(),
        &[("w1", "shard1.safetensors"), ("w2", "shard1.safetensors")],
    );

    let merged = MergedWeights::resolve(tmp.path(), &device)?.expect("index present");
    assert_eq!(merged.len(), 1);
    assert!(merged.get("w2").is_none());
    Ok(())
}

#[test]
fn single_file_in_directory_is_preferred() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("single");
    let w = Tensor::new(&[7f32], &device)?;
    save_shard(tmp.path(), "model.safetensors", &[("w", &w)])?;

    let merged = MergedWeights::resolve(tmp.path(), &device)?.expect("file present");
    assert_eq!(merged.get("w").expect("w loaded").to_vec1::<f32>()?, [7.]);
    Ok(())
}

#[test]
fn direct_file_path_loads() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("direct");
    let w = Tensor::new(&[7f32], &device)?;
    save_shard(tmp.path(), "checkpoint.safetensors", &[("w", &w)])?;

    let merged = MergedWeights::resolve(&tmp.path().join("checkpoint.safetensors"), &device)?
        .expect("file present");
    assert!(merged.get("w").is_some());
    Ok(())
}

#[test]
fn empty_directory_yields_no_checkpoint() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("empty");
    assert!(MergedWeights::resolve(tmp.path(), &device)?.is_none());
    Ok(())
}

#[test]
fn route_strips_the_component_prefix() -> Result<()> {
    let device = Device::Cpu;
    let tmp = TmpDir::create("route");
    let w = Tensor::new(&[1f32], &device)?;
    save_shard(
        tmp.path(),
        "model.safetensors",
        &[
            ("language_model.model.embed_tokens.weight", &w),
            ("vision_tower.vision_model.embeddings.class_embedding", &w),
            ("connector.0.weight", &w),
        ],
    )?;
    let merged = MergedWeights::resolve(tmp.path(), &device)?.expect("file present");

    let decoder = merged.route("language_model");
    assert_eq!(decoder.len(), 1);
    assert!(decoder.contains_key("model.embed_tokens.weight"));

    let connector = merged.route("connector");
    assert_eq!(connector.len(), 1);
    assert!(connector.contains_key("0.weight"));

    // No accidental prefix-of-a-prefix matches.
    assert!(merged.route("connect").is_empty());
    Ok(())
}

fn linear_tensors(device: &Device, with_bias: bool) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    tensors.insert(
        "weight".to_string(),
        Tensor::ones((2, 3), DType::F32, device)?,
    );
    if with_bias {
        tensors.insert("bias".to_string(), Tensor::ones(2, DType::F32, device)?);
    }
    Ok(tensors)
}

fn build_linear(vb: VarBuilder) -> Result<candle_nn::Linear> {
    candle_nn::linear(3, 2, vb)
}

#[test]
fn permissive_load_zero_fills_missing_keys() -> Result<()> {
    let device = Device::Cpu;
    let tensors = linear_tensors(&device, false)?;
    let layer = load_component(
        "connector",
        tensors,
        Strictness::Permissive,
        DType::F32,
        &device,
        build_linear,
    )?;
    let out = layer.forward(&Tensor::ones((1, 3), DType::F32, &device)?)?;
    // Weight applied, missing bias filled with zeros.
    assert_eq!(out.to_vec2::<f32>()?, [[3., 3.]]);
    Ok(())
}

#[test]
fn strict_load_falls_back_to_permissive() -> Result<()> {
    let device = Device::Cpu;
    let tensors = linear_tensors(&device, false)?;
    // Missing bias fails the strict pass; the permissive retry succeeds.
    let layer = load_component(
        "vision_tower",
        tensors,
        Strictness::Strict,
        DType::F32,
        &device,
        build_linear,
    )?;
    let out = layer.forward(&Tensor::ones((1, 3), DType::F32, &device)?)?;
    assert_eq!(out.to_vec2::<f32>()?, [[3., 3.]]);
    Ok(())
}

#[test]
fn strict_load_succeeds_on_exact_match() -> Result<()> {
    let device = Device::Cpu;
    let tensors = linear_tensors(&device, true)?;
    let layer = load_component(
        "vision_tower",
        tensors,
        Strictness::Strict,
        DType::F32,
        &device,
        build_linear,
    )?;
    let out = layer.forward(&Tensor::ones((1, 3), DType::F32, &device)?)?;
    assert_eq!(out.to_vec2::<f32>()?, [[4., 4.]]);
    Ok(())
}

#[test]
fn unconsumed_keys_are_tolerated_permissively() -> Result<()> {
    let device = Device::Cpu;
    let mut tensors = linear_tensors(&device, true)?;
    tensors.insert(
        "text_model.unrelated".to_string(),
        Tensor::ones(4, DType::F32, &device)?,
    );
    let layer = load_component(
        "connector",
        tensors,
        Strictness::Permissive,
        DType::F32,
        &device,
        build_linear,
    )?;
    let out = layer.forward(&Tensor::ones((1, 3), DType::F32, &device)?)?;
    assert_eq!(out.to_vec2::<f32>()?, [[4., 4.]]);
    Ok(())
}

#[test]
fn builders_can_branch_on_tensor_presence() -> Result<()> {
    let device = Device::Cpu;
    let tensors = linear_tensors(&device, false)?;
    // A bias-optional builder: presence must reflect the sub-state even in
    // permissive mode, so the absent bias is skipped rather than zero-filled.
    let layer = load_component(
        "connector",
        tensors,
        Strictness::Permissive,
        DType::F32,
        &device,
        |vb| {
            let has_bias = vb.contains_tensor("bias");
            assert!(!has_bias);
            candle_nn::linear_b(3, 2, has_bias, vb)
        },
    )?;
    let out = layer.forward(&Tensor::ones((1, 3), DType::F32, &device)?)?;
    assert_eq!(out.to_vec2::<f32>()?, [[3., 3.]]);
    Ok(())
}

#[test]
fn shape_mismatch_is_always_an_error() {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "weight".to_string(),
        Tensor::ones((5, 5), DType::F32, &device).unwrap(),
    );
    tensors.insert(
        "bias".to_string(),
        Tensor::ones(2, DType::F32, &device).unwrap(),
    );
    let result = load_component(
        "connector",
        tensors,
        Strictness::Permissive,
        DType::F32,
        &device,
        build_linear,
    );
    assert!(result.is_err());
}
