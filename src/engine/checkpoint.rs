//! Versioned checkpoint format
//!
//! A checkpoint is a single safetensors file. Its header metadata must carry
//!
//! | key              | value              |
//! |------------------|--------------------|
//! | `format`         | `boneage-fusion`   |
//! | `format_version` | `1`                |
//! | `gender`         | optional, informational |
//!
//! Tensors are `f32` and named after the torchvision module tree of the
//! fusion network:
//!
//! ```text
//! cnn.{0,1}.*                       stem conv / batch norm
//! cnn.{4..=7}.{0,1}.{conv1,bn1,conv2,bn2,downsample.{0,1}}.*
//! ca.conv.{weight,bias}             coordinate attention gate
//! vit.conv_proj.*  vit.class_token  vit.encoder.pos_embedding
//! vit.encoder.layers.encoder_layer_{i}.{ln_1,self_attention,ln_2,mlp.0,mlp.3}.*
//! vit.encoder.ln.*
//! fc.*  grp.*  unc.*
//! ```
//!
//! Files without this metadata are rejected; there is no fallback probing
//! of alternative layouts.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;
use tracing::{debug, info};

use super::model::FeatureFusionModel;
use super::pool::Gender;
use crate::config::ArchitectureConfig;
use crate::error::{BoneAgeError, Result};

pub const FORMAT_KEY: &str = "format";
pub const FORMAT_NAME: &str = "boneage-fusion";
pub const VERSION_KEY: &str = "format_version";
pub const FORMAT_VERSION: &str = "1";
pub const GENDER_KEY: &str = "gender";

/// Header information of a validated checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub version: String,
    pub gender: Option<String>,
    pub tensor_count: usize,
}

/// Validate the header metadata of an in-memory checkpoint
pub fn inspect(path: &Path, data: &[u8]) -> Result<CheckpointInfo> {
    let (_, metadata) = SafeTensors::read_metadata(data)
        .map_err(|e| BoneAgeError::checkpoint_format(path, e.to_string()))?;
    let tensor_count = metadata.tensors().len();
    let header = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| BoneAgeError::checkpoint_format(path, "header has no metadata"))?;

    match header.get(FORMAT_KEY).map(String::as_str) {
        Some(FORMAT_NAME) => {}
        Some(other) => {
            return Err(BoneAgeError::checkpoint_format(
                path,
                format!("unknown format '{}'", other),
            ))
        }
        None => {
            return Err(BoneAgeError::checkpoint_format(
                path,
                format!("missing '{}' metadata", FORMAT_KEY),
            ))
        }
    }

    let version = header
        .get(VERSION_KEY)
        .ok_or_else(|| {
            BoneAgeError::checkpoint_format(path, format!("missing '{}' metadata", VERSION_KEY))
        })?
        .clone();
    if version != FORMAT_VERSION {
        return Err(BoneAgeError::checkpoint_format(
            path,
            format!("unsupported version '{}' (expected {})", version, FORMAT_VERSION),
        ));
    }

    Ok(CheckpointInfo {
        version,
        gender: header.get(GENDER_KEY).cloned(),
        tensor_count,
    })
}

/// Read a checkpoint from disk and validate its header
pub fn verify(path: &Path) -> Result<CheckpointInfo> {
    let data = std::fs::read(path).map_err(|e| BoneAgeError::model_load(path, e))?;
    inspect(path, &data)
}

/// Read, validate and bind a checkpoint to the fusion architecture
pub fn load_model(
    path: &Path,
    arch: &ArchitectureConfig,
    device: &Device,
) -> Result<FeatureFusionModel> {
    let start = Instant::now();
    let data = std::fs::read(path).map_err(|e| BoneAgeError::model_load(path, e))?;
    let info = inspect(path, &data)?;
    debug!(
        "Checkpoint {:?}: version {}, {} tensors, gender {:?}",
        path, info.version, info.tensor_count, info.gender
    );

    let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, device)
        .map_err(|e| BoneAgeError::model_load(path, e))?;
    let model = FeatureFusionModel::new(arch, vb).map_err(|e| BoneAgeError::model_load(path, e))?;

    info!("Loaded checkpoint {:?} in {:?}", path, start.elapsed());
    Ok(model)
}

/// Write tensors in the versioned format
pub fn save_checkpoint(
    tensors: &HashMap<String, Tensor>,
    gender: Option<Gender>,
    path: &Path,
) -> Result<()> {
    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT_NAME.to_string());
    metadata.insert(VERSION_KEY.to_string(), FORMAT_VERSION.to_string());
    if let Some(gender) = gender {
        metadata.insert(GENDER_KEY.to_string(), gender.as_str().to_string());
    }

    let mut entries: Vec<(&String, &Tensor)> = tensors.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    safetensors::serialize_to_file(entries, &Some(metadata), path)
        .map_err(|e| BoneAgeError::model_load(path, e))?;
    Ok(())
}
