// SPDX-License-Identifier: MIT OR Apache-2.0

//! Safetensors checkpoint discovery and `VarBuilder` construction.
//!
//! A checkpoint directory holds either a single `model.safetensors` or a
//! sharded set described by `model.safetensors.index.json`.  Tensor names
//! follow the PyTorch QANet `state_dict`, so an exported
//! checkpoint loads through [`QaNet::load`](crate::QaNet::load) unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::error::{QaError, Result};

/// Single-file checkpoint name.
const SINGLE_FILE: &str = "model.safetensors";
/// Shard index name.
const INDEX_FILE: &str = "model.safetensors.index.json";

/// Index structure for sharded checkpoints.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

/// Find the safetensors files of a checkpoint directory.
///
/// Tries `model.safetensors.index.json` first (sharded), falls back to a
/// single `model.safetensors`.
///
/// # Errors
///
/// Returns [`QaError::Io`] if the index cannot be read,
/// [`QaError::Config`] if it cannot be parsed or neither file exists.
pub fn resolve_safetensors_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join(INDEX_FILE);
    if index_path.is_file() {
        let index_str = std::fs::read_to_string(&index_path)?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)
            .map_err(|e| QaError::Config(format!("parse {}: {e}", index_path.display())))?;

        let mut shard_names: Vec<&String> = index.weight_map.values().collect();
        shard_names.sort();
        shard_names.dedup();

        let mut paths = Vec::with_capacity(shard_names.len());
        for shard_name in shard_names {
            let path = dir.join(shard_name);
            if !path.is_file() {
                return Err(QaError::Config(format!(
                    "shard {shard_name} listed in {INDEX_FILE} not found in {}",
                    dir.display()
                )));
            }
            paths.push(path);
        }
        tracing::debug!(shards = paths.len(), "resolved sharded checkpoint");
        return Ok(paths);
    }

    let path = dir.join(SINGLE_FILE);
    if !path.is_file() {
        return Err(QaError::Config(format!(
            "neither {INDEX_FILE} nor {SINGLE_FILE} found in {}",
            dir.display()
        )));
    }
    Ok(vec![path])
}

/// Create a `VarBuilder` over safetensors files.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading instead.
///
/// # Errors
///
/// Returns [`QaError::Config`] for an empty path list or, without `mmap`,
/// more than one shard; [`QaError::Io`] if a file cannot be read and
/// [`QaError::Model`] if it is not valid safetensors.
pub fn var_builder_from_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(QaError::Config("no safetensors files given".into()));
    }
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered reading.  Single file only.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let [path] = paths else {
        return Err(QaError::Config(
            "sharded checkpoints require the `mmap` feature: \
             candle-qanet = { features = [\"mmap\"] }"
                .into(),
        ));
    };
    let data = std::fs::read(path)?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "buffered checkpoint");
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    tracing::debug!(files = paths.len(), "memory-mapped checkpoint");
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_dir_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_safetensors_paths(dir.path()).unwrap_err();
        assert!(matches!(err, QaError::Config(_)));
    }

    #[test]
    fn index_lists_unique_shards() {
        let dir = tempfile::tempdir().unwrap();
        for shard in ["a.safetensors", "b.safetensors"] {
            std::fs::write(dir.path().join(shard), b"").unwrap();
        }
        let index = serde_json::json!({
            "weight_map": {
                "out.w1": "a.safetensors",
                "out.w2": "a.safetensors",
                "cq_att.w": "b.safetensors"
            }
        });
        std::fs::write(dir.path().join(INDEX_FILE), index.to_string()).unwrap();
        let paths = resolve_safetensors_paths(dir.path()).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("a.safetensors"), dir.path().join("b.safetensors")]
        );
    }

    #[test]
    fn missing_shard_errors() {
        let dir = tempfile::tempdir().unwrap();
        let index = serde_json::json!({ "weight_map": { "out.w1": "gone.safetensors" } });
        std::fs::write(dir.path().join(INDEX_FILE), index.to_string()).unwrap();
        assert!(resolve_safetensors_paths(dir.path()).is_err());
    }

    #[test]
    fn no_paths_errors() {
        assert!(var_builder_from_safetensors(&[], DType::F32, &Device::Cpu).is_err());
    }
}
