//! Read-only loader for neural-network checkpoints
//!
//! This crate reads `.safetensors` files and zip-based PyTorch `.pth` archives
//! into a typed, insertion-ordered [`Checkpoint`] mapping, and provides a small
//! shape analyzer over the result. Nothing in a `.pth` archive is executed: the
//! pickle stream is decoded by a restricted machine that only understands
//! containers, scalars and tensor reconstruction calls.

pub mod analysis;
pub mod entry;
pub mod error;
pub mod loader;
pub mod safetensors_file;
pub mod torch;

pub use analysis::{
    analyze_model_structure, analyze_model_structure_with, ShapeReport, DEFAULT_IMPORTANT_SIZES,
};
pub use entry::{Checkpoint, CheckpointEntry, DType, Tensor};
pub use error::{Error, Result};
pub use loader::{load_model, CheckpointFormat};
