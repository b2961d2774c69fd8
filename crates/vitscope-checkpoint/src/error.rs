//! Error types for checkpoint loading

use std::io;
use thiserror::Error;

/// Result type alias for checkpoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a checkpoint
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File extension is neither `.safetensors` nor `.pth`
    #[error("Unsupported file format: {0:?} (expected .safetensors or .pth)")]
    UnsupportedFormat(String),

    /// Malformed safetensors header or buffer
    #[error("Invalid safetensors file: {0}")]
    SafeTensors(String),

    /// The `.pth` file is not a readable zip archive
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Pre-1.6 PyTorch pickle files are not zip archives and are not supported
    #[error("Legacy (non-zip) PyTorch checkpoints are not supported; re-save with torch.save(..., _use_new_zipfile_serialization=True)")]
    LegacyTorchFormat,

    /// The archive has no `data.pkl` member
    #[error("PyTorch archive has no data.pkl member")]
    MissingPickle,

    /// The pickle stream uses something the decoder does not understand
    #[error("Pickle error: {0}")]
    Pickle(String),

    /// Storage class not mapped to a dtype
    #[error("Unsupported torch storage type: {0}")]
    UnsupportedStorageType(String),

    /// A tensor points at a storage member that is not in the archive
    #[error("Tensor \"{tensor}\" references missing storage \"{key}\"")]
    MissingStorage {
        tensor: String,
        key: String,
    },

    /// A tensor's extent does not fit inside its backing buffer
    #[error("Tensor \"{name}\" data out of bounds (buffer {available} bytes, need {needed} at offset {offset})")]
    TensorOutOfBounds {
        name: String,
        offset: usize,
        needed: usize,
        available: usize,
    },
}

impl From<::safetensors::SafeTensorError> for Error {
    fn from(err: ::safetensors::SafeTensorError) -> Self {
        Error::SafeTensors(err.to_string())
    }
}
