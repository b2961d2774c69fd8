//! Typed checkpoint entries
//!
//! A checkpoint is an insertion-ordered mapping from parameter name to
//! [`CheckpointEntry`]. Only [`CheckpointEntry::Tensor`] carries a shape; every
//! other value a `.pth` file may hold (step counters, learning rates, optimizer
//! bookkeeping) is kept as a short opaque description.

use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Element type of a stored tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F16,
    BF16,
    F32,
    F64,
    /// A dtype the reader recognises by name but has no width for
    Unknown,
}

impl DType {
    /// Size of one element in bytes, `None` for [`DType::Unknown`]
    pub fn element_size(self) -> Option<usize> {
        match self {
            DType::Bool | DType::U8 | DType::I8 => Some(1),
            DType::U16 | DType::I16 | DType::F16 | DType::BF16 => Some(2),
            DType::U32 | DType::I32 | DType::F32 => Some(4),
            DType::U64 | DType::I64 | DType::F64 => Some(8),
            DType::Unknown => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::U64 => "u64",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Shape and dtype of one stored tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Size of the tensor payload in bytes
    pub nbytes: usize,
}

/// Element count of `shape`, `None` if it overflows `usize`
pub fn shape_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

impl Tensor {
    /// `None` when the element or byte count does not fit in `usize`
    pub fn new(dtype: DType, shape: Vec<usize>) -> Option<Self> {
        let mut tensor = Self {
            dtype,
            shape,
            nbytes: 0,
        };
        tensor.nbytes = tensor
            .numel()?
            .checked_mul(dtype.element_size().unwrap_or(0))?;
        Some(tensor)
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of the innermost dimension, `None` for scalars
    pub fn last_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    /// Total number of elements, `None` if it overflows `usize`
    pub fn numel(&self) -> Option<usize> {
        shape_numel(&self.shape)
    }
}

/// One value in a checkpoint mapping
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointEntry {
    Tensor(Tensor),
    /// A nested mapping, e.g. the `"model"` state dict of a training checkpoint
    Nested(Checkpoint),
    /// Anything else, described briefly (`int 12000`, `list[3]`, ...)
    Other(String),
}

impl CheckpointEntry {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            CheckpointEntry::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Insertion-ordered mapping from parameter name to entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    entries: IndexMap<String, CheckpointEntry>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing (in place) any earlier value under the same name
    pub fn insert(&mut self, name: impl Into<String>, entry: CheckpointEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CheckpointEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over the tensor entries only
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.iter()
            .filter_map(|(name, entry)| entry.as_tensor().map(|t| (name, t)))
    }

    /// Replace a training checkpoint with its `"model"` state dict.
    ///
    /// Unwraps a single level only; a checkpoint without a nested `"model"`
    /// mapping is returned unchanged.
    pub fn into_model_state(mut self) -> Checkpoint {
        if !matches!(self.entries.get("model"), Some(CheckpointEntry::Nested(_))) {
            return self;
        }
        match self.entries.shift_remove("model") {
            Some(CheckpointEntry::Nested(inner)) => inner,
            _ => self,
        }
    }
}

impl FromIterator<(String, CheckpointEntry)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (String, CheckpointEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
