// ============================================================
// Layer 4 — Slice Batchers
// ============================================================
// Implements Burn's Batcher trait to turn VolumeSamples (one
// variable-depth volume each) into slice tensors.
//
// Volumes in one batch have different depths, so they cannot be
// stacked along a batch axis. Instead every slice of every volume
// becomes one entry of a flat batch:
//
//   Input:  N samples with depths d1..dN, slices H x W
//   Output: tensor [d1 + ... + dN, 1, H, W]   (image and label)
//
// The singleton axis is the channel axis the U-Net expects.
//
// Three flavours:
//   SliceBatcher              — training, concatenation in order
//   SliceBatcher (permuting)  — same, then ONE permutation applied
//                               to both image and label tensors
//   ValidBatcher              — exactly one volume per batch
//
// The permutation is seeded from the samples' own augmentation
// seeds, so a batch is reproducible without any shared RNG.
//
// Reference: Burn Book §4 (Batcher)
//            rand crate documentation (SliceRandom)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::data::dataset::VolumeSample;

// ─── Flat concatenation (backend independent) ─────────────────────────────────
/// All slices of a batch, image and label, in one buffer each.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatSlices {
    pub height: usize,
    pub width:  usize,
    pub images: Vec<f32>,
    pub labels: Vec<f32>,
    /// Depth of each input volume, in input order
    pub depths: Vec<usize>,
}

impl FlatSlices {
    pub fn slices(&self) -> usize {
        self.depths.iter().sum()
    }

    fn shape(&self) -> [usize; 4] {
        [self.slices(), 1, self.height, self.width]
    }
}

/// Concatenate the slice stacks of all samples along the slice axis.
///
/// Panics when image and label of a sample disagree, or when samples
/// have different in-plane extents: both corrupt every slice after them.
pub fn concat_samples(items: &[VolumeSample]) -> FlatSlices {
    let (height, width) = items
        .first()
        .map(|s| (s.image.height, s.image.width))
        .unwrap_or((0, 0));

    let total: usize = items.iter().map(|s| s.image.voxels.len()).sum();
    let mut images = Vec::with_capacity(total);
    let mut labels = Vec::with_capacity(total);
    let mut depths = Vec::with_capacity(items.len());

    for s in items {
        assert!(
            s.image.depth == s.label.depth
                && s.image.height == s.label.height
                && s.image.width == s.label.width,
            "image and label stacks of '{}' are misaligned",
            s.name
        );
        assert!(
            s.image.height == height && s.image.width == width,
            "'{}' has slices of {}x{}, batch expects {}x{}",
            s.name,
            s.image.height,
            s.image.width,
            height,
            width
        );
        images.extend_from_slice(&s.image.voxels);
        labels.extend_from_slice(&s.label.voxels);
        depths.push(s.image.depth);
    }

    FlatSlices { height, width, images, labels, depths }
}

/// Seeded permutation of `0..n`.
pub fn slice_permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut StdRng::seed_from_u64(seed));
    perm
}

/// Reorder the slices of `flat` so that new slice `i` is old slice
/// `perm[i]`, for image and label alike.
pub fn permute_slices(flat: &mut FlatSlices, perm: &[usize]) {
    let n = flat.height * flat.width;
    let reorder = |src: &[f32]| -> Vec<f32> {
        perm.iter()
            .flat_map(|&k| src[k * n..(k + 1) * n].iter().copied())
            .collect()
    };
    flat.images = reorder(&flat.images);
    flat.labels = reorder(&flat.labels);
}

fn batch_seed(items: &[VolumeSample]) -> u64 {
    items
        .iter()
        .fold(0x5EED_u64, |acc, s| acc.rotate_left(17) ^ s.seed)
}

// ─── Training batches ─────────────────────────────────────────────────────────
/// Flat slice batch for the training loop.
#[derive(Debug, Clone)]
pub struct SliceBatch<B: Backend> {
    /// Shape: [slices, 1, height, width]
    pub images: Tensor<B, 4>,
    /// Shape: [slices, 1, height, width]
    pub labels: Tensor<B, 4>,
    pub depths: Vec<usize>,
}

impl<B: Backend> SliceBatch<B> {
    pub fn slices(&self) -> usize {
        self.images.dims()[0]
    }
}

#[derive(Clone, Debug)]
pub struct SliceBatcher<B: Backend> {
    device:  B::Device,
    permute: bool,
}

impl<B: Backend> SliceBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device, permute: false }
    }

    /// Batcher that shuffles the concatenated slices.
    pub fn permuting(device: B::Device) -> Self {
        Self { device, permute: true }
    }
}

impl<B: Backend> Batcher<VolumeSample, SliceBatch<B>> for SliceBatcher<B> {
    fn batch(&self, items: Vec<VolumeSample>) -> SliceBatch<B> {
        let mut flat = concat_samples(&items);
        if self.permute {
            let perm = slice_permutation(flat.slices(), batch_seed(&items));
            permute_slices(&mut flat, &perm);
        }

        let shape = flat.shape();
        let images = Tensor::<B, 4>::from_data(TensorData::new(flat.images, shape), &self.device);
        let labels = Tensor::<B, 4>::from_data(TensorData::new(flat.labels, shape), &self.device);

        SliceBatch { images, labels, depths: flat.depths }
    }
}

// ─── Validation batches ───────────────────────────────────────────────────────
/// One whole volume as a stack of slices.
#[derive(Debug, Clone)]
pub struct VolumeBatch<B: Backend> {
    pub name:  String,
    /// Shape: [depth, 1, height, width]
    pub image: Tensor<B, 4>,
    /// Shape: [depth, 1, height, width]
    pub label: Tensor<B, 4>,
}

#[derive(Clone, Debug)]
pub struct ValidBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ValidBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<VolumeSample, VolumeBatch<B>> for ValidBatcher<B> {
    fn batch(&self, items: Vec<VolumeSample>) -> VolumeBatch<B> {
        // Whole-volume evaluation: the loader must be built with batch_size(1).
        assert_eq!(items.len(), 1, "validation batches hold exactly one volume");

        let flat  = concat_samples(&items);
        let shape = flat.shape();
        let name  = items.into_iter().next().map(|s| s.name).unwrap_or_default();

        VolumeBatch {
            name,
            image: Tensor::<B, 4>::from_data(TensorData::new(flat.images, shape), &self.device),
            label: Tensor::<B, 4>::from_data(TensorData::new(flat.labels, shape), &self.device),
        }
    }
}
