// ============================================================
// Layer 3 — Volume Domain Types
// ============================================================
// A scan is a 3D array indexed [dim0, dim1, depth]. Every
// training example is an (image, label) pair of identical
// extent; the label holds one class value per voxel.
//
// After augmentation a volume is flattened into a SliceStack:
// `depth` slices of `height x width` values laid out slice after
// slice, each slice row-major. That is exactly the memory order
// the batcher needs to build a [slices, 1, height, width] tensor.
//
// Reference: ndarray documentation (Array3, Axis)

use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};

/// File names of one example, relative to the image and label roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePairFiles {
    pub image: String,
    pub label: String,
}

impl VolumePairFiles {
    pub fn new(image: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            label: label.into(),
        }
    }
}

/// An image volume and its label volume, already checked to share
/// the same extent.
#[derive(Debug, Clone)]
pub struct VolumePair {
    pub image: Array3<f32>,
    pub label: Array3<f32>,
}

impl VolumePair {
    /// Pair two volumes. Returns `None` when their shapes differ;
    /// callers turn that into a fatal error.
    pub fn new(image: Array3<f32>, label: Array3<f32>) -> Option<Self> {
        if image.shape() != label.shape() {
            return None;
        }
        Some(Self { image, label })
    }

    /// Number of slices along the depth axis
    pub fn depth(&self) -> usize {
        self.image.len_of(Axis(2))
    }
}

/// Depth-ordered 2D slices of one volume in a flat buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceStack {
    pub depth:  usize,
    pub height: usize,
    pub width:  usize,
    /// `depth * height * width` values, slice-major then row-major
    pub voxels: Vec<f32>,
}

impl SliceStack {
    /// Build a stack from slices that all have the same extent.
    pub fn from_slices(height: usize, width: usize, slices: Vec<Vec<f32>>) -> Self {
        let depth = slices.len();
        let mut voxels = Vec::with_capacity(depth * height * width);
        for s in slices {
            assert_eq!(s.len(), height * width, "slice extent does not match stack");
            voxels.extend(s);
        }
        Self { depth, height, width, voxels }
    }

    /// Flatten a `[dim0, dim1, depth]` volume without transforming it.
    pub fn from_volume(volume: &Array3<f32>) -> Self {
        let (height, width, depth) = volume.dim();
        let mut voxels = Vec::with_capacity(depth * height * width);
        for slice in volume.axis_iter(Axis(2)) {
            // Logical iteration order is row-major regardless of the
            // array's memory layout (NIfTI data is column-major).
            voxels.extend(slice.iter().copied());
        }
        Self { depth, height, width, voxels }
    }

    pub fn slice_len(&self) -> usize {
        self.height * self.width
    }

    /// Borrow slice `k` as a row-major `height x width` buffer
    pub fn slice(&self, k: usize) -> &[f32] {
        let n = self.slice_len();
        &self.voxels[k * n..(k + 1) * n]
    }

    /// Inverse of [`SliceStack::from_volume`]
    pub fn to_volume(&self) -> Array3<f32> {
        let mut out = Array3::<f32>::zeros((self.height, self.width, self.depth));
        for k in 0..self.depth {
            let src = self.slice(k);
            let mut dst = out.index_axis_mut(Axis(2), k);
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *s;
            }
        }
        out
    }
}
