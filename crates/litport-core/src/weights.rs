//! Checkpoint I/O for parameter mappings.
//!
//! Unified checkpoints arrive either as a PyTorch zip (`lit_model.pth`), read
//! through Candle's pickle reader, or as safetensors. A training checkpoint may
//! keep the weights one level down under a `"model"` entry; both readers
//! unwrap that container so callers always see a flat name -> tensor map.
//!
//! Converted mappings are always written as safetensors.

use candle_core::pickle::{read_all_with_key, read_pth_tensor_info};
use candle_core::{Device, Tensor};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Parameter name -> tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Checkpoint file names looked for inside a checkpoint directory, in order.
pub const CHECKPOINT_FILE_NAMES: [&str; 2] = ["lit_model.pth", "lit_model.safetensors"];

/// Field under which training checkpoints nest the parameter mapping.
pub const CONTAINER_KEY: &str = "model";

/// File name of the converted checkpoint inside the output directory.
pub const OUTPUT_CHECKPOINT_NAME: &str = "model.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// PyTorch zip archive holding a pickled state dict.
    Pth,
    Safetensors,
}

/// Detect the checkpoint format from its leading bytes.
pub fn detect_format(path: &Path) -> Result<CheckpointFormat> {
    let mut file = fs::File::open(path).map_err(|e| {
        Error::ModelLoadError(format!(
            "Failed to open checkpoint {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut head = [0u8; 9];
    let read = file.read(&mut head)?;

    if read >= 4 && head[..4] == [0x50, 0x4B, 0x03, 0x04] {
        return Ok(CheckpointFormat::Pth);
    }
    // safetensors: u64 little-endian header length followed by a JSON object.
    if read == 9 && head[8] == b'{' {
        let header_len = u64::from_le_bytes([
            head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7],
        ]);
        if header_len > 1 {
            return Ok(CheckpointFormat::Safetensors);
        }
    }

    Err(Error::ModelLoadError(format!(
        "Unrecognized checkpoint format for {} (expected a PyTorch zip or safetensors file)",
        path.display()
    )))
}

/// Locate the unified checkpoint inside `dir`.
pub fn find_checkpoint(dir: &Path) -> Result<PathBuf> {
    CHECKPOINT_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            Error::ModelNotFound(format!(
                "No {} found in {}",
                CHECKPOINT_FILE_NAMES.join(" or "),
                dir.display()
            ))
        })
}

/// Load a checkpoint into memory (CPU), unwrapping a container field if present.
pub fn load_checkpoint(path: &Path) -> Result<StateDict> {
    let state_dict = match detect_format(path)? {
        CheckpointFormat::Pth => load_pth(path)?,
        CheckpointFormat::Safetensors => {
            candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
                Error::ModelLoadError(format!(
                    "Failed to load safetensors {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
    };
    let state_dict = unwrap_state_dict(state_dict, CONTAINER_KEY);
    info!(
        "Loaded {} tensors from {}",
        state_dict.len(),
        path.display()
    );
    Ok(state_dict)
}

fn load_pth(path: &Path) -> Result<StateDict> {
    let key = pth_container_key(path)?;
    let tensors = read_all_with_key(path, key).map_err(|e| {
        Error::ModelLoadError(format!(
            "Failed to read PyTorch checkpoint {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(tensors.into_iter().collect())
}

/// `None` when tensors sit at the top level, `Some("model")` when nested.
fn pth_container_key(path: &Path) -> Result<Option<&'static str>> {
    let top_level = read_pth_tensor_info(path, false, None).map_err(|e| {
        Error::ModelLoadError(format!(
            "Failed to inspect PyTorch checkpoint {}: {}",
            path.display(),
            e
        ))
    })?;
    if !top_level.is_empty() {
        return Ok(None);
    }

    match read_pth_tensor_info(path, false, Some(CONTAINER_KEY)) {
        Ok(nested) if !nested.is_empty() => {
            debug!(
                "Checkpoint {} nests {} tensors under '{}'",
                path.display(),
                nested.len(),
                CONTAINER_KEY
            );
            Ok(Some(CONTAINER_KEY))
        }
        _ => Err(Error::ModelLoadError(format!(
            "PyTorch checkpoint {} contains no tensors",
            path.display()
        ))),
    }
}

/// Strip a one-level container prefix (`"<key>."`) shared by every name.
///
/// Mappings where any name lacks the prefix are returned unchanged.
pub fn unwrap_state_dict(state_dict: StateDict, key: &str) -> StateDict {
    let prefix = format!("{key}.");
    if state_dict.is_empty() || !state_dict.keys().all(|name| name.starts_with(&prefix)) {
        return state_dict;
    }
    debug!("Unwrapping parameter mapping nested under '{}'", key);
    state_dict
        .into_iter()
        .map(|(name, tensor)| (name[prefix.len()..].to_string(), tensor))
        .collect()
}

/// A file written next to its destination and moved into place on commit.
///
/// Dropping it uncommitted removes the staged file, so a failed write never
/// leaves partial output behind.
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
    dest: PathBuf,
}

impl StagedFile {
    fn create(dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file = tempfile::Builder::new()
            .prefix(".litport-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                Error::ModelLoadError(format!("Failed to stage {}: {}", dest.display(), e))
            })?;
        Ok(Self {
            file,
            dest: dest.to_path_buf(),
        })
    }

    /// Destination the file lands on when committed.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Move the staged file onto its destination.
    pub fn commit(self) -> Result<()> {
        let dest = self.dest;
        self.file.persist(&dest).map_err(|e| {
            Error::ModelLoadError(format!(
                "Failed moving {} into place: {}",
                dest.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// Serialize a mapping as safetensors into a staged file for `dest`.
pub fn stage_checkpoint(state_dict: &StateDict, dest: &Path) -> Result<StagedFile> {
    let mut views: BTreeMap<&str, Tensor> = BTreeMap::new();
    for (name, tensor) in state_dict {
        views.insert(name.as_str(), tensor.contiguous()?);
    }
    let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);

    let staged = StagedFile::create(dest)?;
    safetensors::tensor::serialize_to_file(views, &Some(metadata), staged.file.path())?;
    Ok(staged)
}

/// Stage a byte-for-byte copy of `source` for `dest`.
pub fn stage_copy(source: &Path, dest: &Path) -> Result<StagedFile> {
    let staged = StagedFile::create(dest)?;
    fs::copy(source, staged.file.path()).map_err(|e| {
        Error::ModelLoadError(format!(
            "Failed to copy {} for {}: {}",
            source.display(),
            dest.display(),
            e
        ))
    })?;
    Ok(staged)
}

/// Write a mapping as safetensors; the file appears only once fully written.
pub fn save_checkpoint(state_dict: &StateDict, path: &Path) -> Result<()> {
    stage_checkpoint(state_dict, path)?.commit()?;
    info!("Wrote {} tensors to {}", state_dict.len(), path.display());
    Ok(())
}

/// Total number of scalar parameters in a mapping.
pub fn parameter_count(state_dict: &StateDict) -> usize {
    state_dict.values().map(|t| t.elem_count()).sum()
}
