//! Format detection and checkpoint loading

use std::path::Path;
use tracing::{debug, info};

use crate::entry::Checkpoint;
use crate::error::{Error, Result};
use crate::safetensors_file::load_safetensors;
use crate::torch::load_torch;

/// Supported checkpoint containers, selected by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `.safetensors`
    SafeTensors,
    /// `.pth` (zip-based `torch.save` output)
    Torch,
}

impl CheckpointFormat {
    /// Detect the format of `path` from its extension.
    ///
    /// The comparison is exact, so `model.PTH` is rejected like any other
    /// unknown extension. A missing extension is reported as `""`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "safetensors" => Ok(Self::SafeTensors),
            "pth" => Ok(Self::Torch),
            other => Err(Error::UnsupportedFormat(format!(
                "{}{}",
                if other.is_empty() { "" } else { "." },
                other
            ))),
        }
    }
}

/// Load all entries of the checkpoint at `path`.
///
/// Nothing is returned unless the whole file decodes.
pub fn load_model(path: &Path) -> Result<Checkpoint> {
    let format = CheckpointFormat::from_path(path)?;
    info!("Loading {} as {:?}", path.display(), format);

    let checkpoint = match format {
        CheckpointFormat::SafeTensors => load_safetensors(path)?,
        CheckpointFormat::Torch => load_torch(path)?,
    };

    debug!("{}: {} entries", path.display(), checkpoint.len());
    Ok(checkpoint)
}
