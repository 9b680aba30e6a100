// ============================================================
// Layer 4 — Slice Augmentor
// ============================================================
// Paired, seeded augmentation of an (image, label) volume pair.
//
// One random draw per VOLUME (not per slice):
//   AffineParams { rotation, scale } is drawn from a StdRng seeded
//   with the example's seed. The image chain and the label chain
//   each draw from a FRESH generator seeded with that same value,
//   so both get the identical rotation/scale without sharing any
//   hidden RNG state.
//
// Image chain:  affine warp (fill = outside-scan sentinel)
//               → clip to the HU window → normalise to [0, 1]
// Label chain:  affine warp (fill = background sentinel)
//               → optional binarisation
// Valid chain:  clip → normalise (image), binarise (label).
//               No randomness at all.
//
// The two fill values are deliberately different: pixels rotated
// in from outside the scan must look like air in the image but
// like "no label" in the mask.
//
// Reference: rand crate documentation (StdRng, SeedableRng)
//            ndarray documentation (ArrayView2)

use ndarray::{Array3, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::volume::{SliceStack, VolumePair};

// ─── Configuration ────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Rotation is drawn uniformly from [-max, +max] degrees
    pub max_rotation_deg: f32,
    pub scale_min:        f32,
    pub scale_max:        f32,
    /// Intensity window (Hounsfield units) the image is clipped to
    pub hu_min:           f32,
    pub hu_max:           f32,
    /// Value for image pixels warped in from outside the slice
    pub image_fill:       f32,
    /// Value for label pixels warped in from outside the slice
    pub label_fill:       f32,
    /// Map every positive label value to 1
    pub binarize_labels:  bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            max_rotation_deg: 5.0,
            scale_min:        1.0,
            scale_max:        1.25,
            hu_min:           -1024.0,
            hu_max:           1024.0,
            image_fill:       -1024.0,
            label_fill:       0.0,
            binarize_labels:  true,
        }
    }
}

impl AugmentConfig {
    /// Reject settings that would make the pipeline meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_rotation_deg < 0.0 {
            anyhow::bail!("max_rotation_deg must be >= 0, got {}", self.max_rotation_deg);
        }
        if !(self.scale_min > 0.0 && self.scale_min <= self.scale_max) {
            anyhow::bail!(
                "scale range [{}, {}] must be positive and ordered",
                self.scale_min,
                self.scale_max
            );
        }
        if self.hu_min >= self.hu_max {
            anyhow::bail!("HU window [{}, {}] is empty", self.hu_min, self.hu_max);
        }
        if self.image_fill == self.label_fill {
            anyhow::bail!(
                "image fill and label fill must differ (both are {})",
                self.image_fill
            );
        }
        Ok(())
    }
}

// ─── Seeds ────────────────────────────────────────────────────────────────────
/// Seed of one example in one epoch, derived from the run seed.
/// Pure function: the same inputs always give the same seed, so any
/// worker thread can compute it independently.
pub fn example_seed(run_seed: u64, epoch: usize, index: usize) -> u64 {
    let mut x = splitmix64(run_seed);
    x = splitmix64(x ^ epoch as u64);
    splitmix64(x ^ index as u64)
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ─── Affine parameters ────────────────────────────────────────────────────────
/// One geometric draw, shared by every slice of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub rotation_deg: f32,
    pub scale:        f32,
}

impl AffineParams {
    pub const IDENTITY: AffineParams = AffineParams { rotation_deg: 0.0, scale: 1.0 };

    /// Draw rotation and scale from a generator seeded with `seed`.
    pub fn draw(seed: u64, cfg: &AugmentConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rotation_deg = if cfg.max_rotation_deg > 0.0 {
            rng.gen_range(-cfg.max_rotation_deg..=cfg.max_rotation_deg)
        } else {
            0.0
        };
        let scale = if cfg.scale_max > cfg.scale_min {
            rng.gen_range(cfg.scale_min..=cfg.scale_max)
        } else {
            cfg.scale_min
        };
        Self { rotation_deg, scale }
    }
}

/// Rotate and scale one slice about its centre.
///
/// Inverse mapping with nearest-neighbour sampling: every output pixel
/// looks up the source pixel it came from; sources outside the slice
/// produce `fill`.
pub fn warp_slice(src: ArrayView2<f32>, params: AffineParams, fill: f32) -> Vec<f32> {
    let (h, w) = src.dim();
    let theta = params.rotation_deg.to_radians();
    let (sin, cos) = theta.sin_cos();
    let inv_scale = 1.0 / params.scale;
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;

    let mut out = Vec::with_capacity(h * w);
    for r in 0..h {
        for c in 0..w {
            let dy = r as f32 - cy;
            let dx = c as f32 - cx;
            let sx = (cos * dx + sin * dy) * inv_scale + cx;
            let sy = (-sin * dx + cos * dy) * inv_scale + cy;
            let (sr, sc) = (sy.round(), sx.round());
            let inside = sr >= 0.0 && sc >= 0.0 && (sr as usize) < h && (sc as usize) < w;
            out.push(if inside { src[[sr as usize, sc as usize]] } else { fill });
        }
    }
    out
}

fn warp_volume(volume: &Array3<f32>, params: AffineParams, fill: f32) -> SliceStack {
    let (h, w, _) = volume.dim();
    let slices = volume
        .axis_iter(Axis(2))
        .map(|slice| warp_slice(slice, params, fill))
        .collect();
    SliceStack::from_slices(h, w, slices)
}

fn clip_and_normalize(stack: &mut SliceStack, cfg: &AugmentConfig) {
    let span = cfg.hu_max - cfg.hu_min;
    for v in stack.voxels.iter_mut() {
        *v = ((*v).clamp(cfg.hu_min, cfg.hu_max) - cfg.hu_min) / span;
    }
}

fn binarize(stack: &mut SliceStack) {
    for v in stack.voxels.iter_mut() {
        *v = if *v > 0.0 { 1.0 } else { 0.0 };
    }
}

// ─── SliceAugmentor (training) ────────────────────────────────────────────────
/// Output of one paired augmentation. The parameters of both chains
/// are kept so callers (and tests) can check they match.
#[derive(Debug, Clone)]
pub struct AugmentedPair {
    pub image:        SliceStack,
    pub label:        SliceStack,
    pub image_params: AffineParams,
    pub label_params: AffineParams,
}

#[derive(Debug, Clone)]
pub struct SliceAugmentor {
    cfg: AugmentConfig,
}

impl SliceAugmentor {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    /// Image chain: warp → clip → normalise.
    pub fn transform_image(&self, image: &Array3<f32>, seed: u64) -> (SliceStack, AffineParams) {
        let params = AffineParams::draw(seed, &self.cfg);
        let mut stack = warp_volume(image, params, self.cfg.image_fill);
        clip_and_normalize(&mut stack, &self.cfg);
        (stack, params)
    }

    /// Label chain: warp (→ binarise).
    pub fn transform_label(&self, label: &Array3<f32>, seed: u64) -> (SliceStack, AffineParams) {
        let params = AffineParams::draw(seed, &self.cfg);
        let mut stack = warp_volume(label, params, self.cfg.label_fill);
        if self.cfg.binarize_labels {
            binarize(&mut stack);
        }
        (stack, params)
    }

    /// Run both chains with the same seed.
    pub fn augment(&self, pair: &VolumePair, seed: u64) -> AugmentedPair {
        let (image, image_params) = self.transform_image(&pair.image, seed);
        let (label, label_params) = self.transform_label(&pair.label, seed);
        AugmentedPair { image, label, image_params, label_params }
    }
}

// ─── ValidTransform (evaluation) ──────────────────────────────────────────────
/// Deterministic pre-processing for validation and inference.
#[derive(Debug, Clone)]
pub struct ValidTransform {
    cfg: AugmentConfig,
}

impl ValidTransform {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    pub fn transform_image(&self, image: &Array3<f32>) -> SliceStack {
        let mut stack = SliceStack::from_volume(image);
        clip_and_normalize(&mut stack, &self.cfg);
        stack
    }

    pub fn transform_label(&self, label: &Array3<f32>) -> SliceStack {
        let mut stack = SliceStack::from_volume(label);
        if self.cfg.binarize_labels {
            binarize(&mut stack);
        }
        stack
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_volume(h: usize, w: usize, d: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, d), |(r, c, k)| (r * w + c) as f32 + 100.0 * k as f32)
    }

    #[test]
    fn test_same_seed_gives_same_geometry_to_image_and_label() {
        let aug = SliceAugmentor::new(AugmentConfig::default());
        let image = ramp_volume(8, 8, 3);
        let label = Array3::<f32>::ones((8, 8, 3));
        let pair = VolumePair::new(image, label).unwrap();

        let out = aug.augment(&pair, 1234);
        assert_eq!(out.image_params, out.label_params);
        assert_eq!(out.image.depth, 3);
        assert_eq!(out.label.depth, 3);
    }

    #[test]
    fn test_draw_stays_in_configured_range() {
        let cfg = AugmentConfig::default();
        for seed in 0..200 {
            let p = AffineParams::draw(seed, &cfg);
            assert!(p.rotation_deg.abs() <= cfg.max_rotation_deg);
            assert!(p.scale >= cfg.scale_min && p.scale <= cfg.scale_max);
        }
    }

    #[test]
    fn test_different_seeds_give_different_draws() {
        let cfg = AugmentConfig::default();
        assert_ne!(AffineParams::draw(1, &cfg), AffineParams::draw(2, &cfg));
    }

    #[test]
    fn test_example_seed_depends_on_epoch_and_index() {
        let a = example_seed(42, 0, 0);
        assert_eq!(a, example_seed(42, 0, 0));
        assert_ne!(a, example_seed(42, 1, 0));
        assert_ne!(a, example_seed(42, 0, 1));
        assert_ne!(a, example_seed(43, 0, 0));
    }

    #[test]
    fn test_identity_warp_copies_slice() {
        let vol = ramp_volume(5, 4, 1);
        let out = warp_slice(vol.index_axis(Axis(2), 0), AffineParams::IDENTITY, -1.0);
        let expected: Vec<f32> = vol.index_axis(Axis(2), 0).iter().copied().collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_rotation_fills_corners_with_chain_fill() {
        let vol = Array3::<f32>::ones((9, 9, 1));
        let params = AffineParams { rotation_deg: 45.0, scale: 1.0 };
        let image = warp_slice(vol.index_axis(Axis(2), 0), params, -1024.0);
        let label = warp_slice(vol.index_axis(Axis(2), 0), params, 0.0);
        assert_eq!(image[0], -1024.0);
        assert_eq!(label[0], 0.0);
        // The centre pixel never moves.
        assert_eq!(image[4 * 9 + 4], 1.0);
    }

    #[test]
    fn test_valid_transform_is_deterministic_and_normalised() {
        let vt = ValidTransform::new(AugmentConfig::default());
        let vol = Array3::from_shape_fn((4, 4, 2), |(r, c, _)| (r as f32 - 2.0) * 900.0 + c as f32);
        let a = vt.transform_image(&vol);
        let b = vt.transform_image(&vol);
        assert_eq!(a, b);
        assert!(a.voxels.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_labels_are_binarised() {
        let vt = ValidTransform::new(AugmentConfig::default());
        let label = Array3::from_shape_fn((2, 2, 1), |(r, c, _)| (r * 2 + c) as f32);
        let stack = vt.transform_label(&label);
        assert_eq!(stack.voxels, vec![0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_equal_fills_are_rejected() {
        let cfg = AugmentConfig { image_fill: 0.0, label_fill: 0.0, ..AugmentConfig::default() };
        assert!(cfg.validate().is_err());
        assert!(AugmentConfig::default().validate().is_ok());
    }
}
