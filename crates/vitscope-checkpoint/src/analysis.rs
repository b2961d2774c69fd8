//! Shape analysis over a loaded checkpoint

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::entry::Checkpoint;

/// Last-dimension widths flagged by [`analyze_model_structure`]
pub const DEFAULT_IMPORTANT_SIZES: [usize; 2] = [256, 512];

/// Distinct innermost sizes of a checkpoint and the tensors with flagged widths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShapeReport {
    /// Every last-dimension size seen on a tensor of rank >= 1, ascending
    pub sizes: BTreeSet<usize>,
    /// Full shapes of tensors whose last dimension is an important size,
    /// in checkpoint order
    pub important_shapes: IndexMap<String, Vec<usize>>,
}

impl ShapeReport {
    /// Union `other` into `self`. Entries of `other` replace same-named ones.
    pub fn merge(&mut self, other: &ShapeReport) {
        self.sizes.extend(other.sizes.iter().copied());
        for (name, shape) in &other.important_shapes {
            self.important_shapes.insert(name.clone(), shape.clone());
        }
    }
}

/// Analyze with the default important widths (256 and 512)
pub fn analyze_model_structure(checkpoint: &Checkpoint) -> ShapeReport {
    analyze_model_structure_with(checkpoint, &DEFAULT_IMPORTANT_SIZES)
}

/// Collect last-dimension sizes and flag tensors whose last dimension is in
/// `important`. Non-tensor entries and scalars are skipped.
pub fn analyze_model_structure_with(checkpoint: &Checkpoint, important: &[usize]) -> ShapeReport {
    let mut report = ShapeReport::default();

    for (name, tensor) in checkpoint.tensors() {
        let Some(last) = tensor.last_dim() else {
            continue;
        };
        report.sizes.insert(last);
        if important.contains(&last) {
            report
                .important_shapes
                .insert(name.to_string(), tensor.shape.clone());
        }
    }

    report
}
