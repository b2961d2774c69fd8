//! safetensors reader
//!
//! The file is opened read-only and memory-mapped for the duration of the
//! call; both the handle and the map are released when the function returns,
//! whether it succeeds or not.

use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors};
use std::fs::File;
use std::path::Path;
use tracing::{debug, trace};

use crate::entry::{shape_numel, Checkpoint, CheckpointEntry, DType, Tensor};
use crate::error::{Error, Result};

/// Load every tensor of a `.safetensors` file
pub fn load_safetensors(path: &Path) -> Result<Checkpoint> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(Error::SafeTensors("file is empty".to_string()));
    }

    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    debug!("Mapped {} ({} bytes)", path.display(), len);

    read_safetensors(&mmap[..])
}

/// Decode a safetensors buffer into a [`Checkpoint`].
///
/// Keys are returned in ascending lexical order.
pub fn read_safetensors(buffer: &[u8]) -> Result<Checkpoint> {
    let tensors = SafeTensors::deserialize(buffer)?;

    let mut names = tensors.names();
    names.sort();

    let mut checkpoint = Checkpoint::new();
    for name in names {
        let view = tensors.tensor(name)?;
        let dtype = convert_dtype(view.dtype());
        let shape = view.shape().to_vec();
        let nbytes = view.data().len();

        if let Some(elem) = dtype.element_size() {
            let needed = shape_numel(&shape).and_then(|numel| numel.checked_mul(elem));
            if needed != Some(nbytes) {
                return Err(Error::TensorOutOfBounds {
                    name: name.clone(),
                    offset: 0,
                    needed: needed.unwrap_or(usize::MAX),
                    available: nbytes,
                });
            }
        }

        trace!("{}: {} {:?}", name, dtype, shape);
        checkpoint.insert(
            name.clone(),
            CheckpointEntry::Tensor(Tensor {
                dtype,
                shape,
                nbytes,
            }),
        );
    }

    debug!("Read {} tensors from safetensors buffer", checkpoint.len());
    Ok(checkpoint)
}

fn convert_dtype(dtype: Dtype) -> DType {
    match dtype {
        Dtype::BOOL => DType::Bool,
        Dtype::U8 => DType::U8,
        Dtype::I8 => DType::I8,
        Dtype::U16 => DType::U16,
        Dtype::I16 => DType::I16,
        Dtype::U32 => DType::U32,
        Dtype::I32 => DType::I32,
        Dtype::U64 => DType::U64,
        Dtype::I64 => DType::I64,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        _ => DType::Unknown,
    }
}
