// ============================================================
// Layer 4 — Volume Datasets
// ============================================================
// Two implementations of Burn's Dataset trait over the same
// list of image/label file pairs:
//
//   TrainVolumeDataset — optional blank-slice skipping, then the
//                        seeded SliceAugmentor. Seeds are derived
//                        from (run seed, epoch, index), so every
//                        epoch sees a new but reproducible draw.
//   ValidVolumeDataset — whole volume, deterministic clipping and
//                        normalisation only.
//
// Per-epoch state lives in the train dataset itself: the current
// epoch and a few counters. The fold loop calls reset_counters()
// once at the start of every epoch; nothing else mutates them.
// Atomics keep get(&self) usable from prefetch workers.
//
// Burn's Dataset::get returns Option and has no error channel.
// A volume that fails to load is fatal for the run, so get()
// logs the error and panics instead of returning None (None would
// silently end the epoch early).
//
// Reference: Burn Book §4 (Datasets)
//            Rust Book §16 (Shared-State Concurrency)

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use ndarray::Axis;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::data::augment::{example_seed, SliceAugmentor, ValidTransform};
use crate::domain::traits::VolumeSource;
use crate::domain::volume::{SliceStack, VolumePair, VolumePairFiles};

/// One processed example: the slice stacks of one volume.
#[derive(Debug, Clone)]
pub struct VolumeSample {
    /// Image file name, for logging
    pub name:  String,
    /// Seed the augmentation ran with (0 for validation samples)
    pub seed:  u64,
    pub image: SliceStack,
    pub label: SliceStack,
}

impl VolumeSample {
    pub fn depth(&self) -> usize {
        self.image.depth
    }
}

/// Snapshot of the train dataset's per-epoch bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochCounters {
    pub epoch:                usize,
    pub volumes_served:       usize,
    pub slices_kept:          usize,
    pub blank_slices_dropped: usize,
}

/// Drop every depth slice whose label is entirely zero, from both
/// volumes. Returns the filtered pair and the number of dropped slices.
pub fn drop_blank_slices(pair: VolumePair) -> Result<(VolumePair, usize)> {
    let keep: Vec<usize> = pair
        .label
        .axis_iter(Axis(2))
        .enumerate()
        .filter(|(_, slice)| slice.iter().any(|&v| v != 0.0))
        .map(|(k, _)| k)
        .collect();
    let dropped = pair.depth() - keep.len();

    let image = pair.image.select(Axis(2), &keep);
    let label = pair.label.select(Axis(2), &keep);
    let (image_shape, label_shape) = (image.dim(), label.dim());
    let filtered = VolumePair::new(image, label).with_context(|| {
        format!(
            "blank-slice filtering left image {image_shape:?} and label {label_shape:?} misaligned"
        )
    })?;
    Ok((filtered, dropped))
}

// ─── TrainVolumeDataset ───────────────────────────────────────────────────────
pub struct TrainVolumeDataset {
    source:     Arc<dyn VolumeSource>,
    files:      Vec<VolumePairFiles>,
    augmentor:  Arc<SliceAugmentor>,
    skip_blank: bool,
    run_seed:   u64,

    epoch:      AtomicUsize,
    served:     AtomicUsize,
    kept:       AtomicUsize,
    dropped:    AtomicUsize,
}

impl TrainVolumeDataset {
    pub fn new(
        source:     Arc<dyn VolumeSource>,
        files:      Vec<VolumePairFiles>,
        augmentor:  Arc<SliceAugmentor>,
        skip_blank: bool,
        run_seed:   u64,
    ) -> Self {
        tracing::debug!("train dataset: {} volumes, skip_blank={}", files.len(), skip_blank);
        Self {
            source,
            files,
            augmentor,
            skip_blank,
            run_seed,
            epoch:   AtomicUsize::new(0),
            served:  AtomicUsize::new(0),
            kept:    AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Start-of-epoch hook: zero the counters and switch the seed
    /// derivation to `epoch`.
    pub fn reset_counters(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::SeqCst);
        self.served.store(0, Ordering::SeqCst);
        self.kept.store(0, Ordering::SeqCst);
        self.dropped.store(0, Ordering::SeqCst);
    }

    pub fn counters(&self) -> EpochCounters {
        EpochCounters {
            epoch:                self.epoch.load(Ordering::SeqCst),
            volumes_served:       self.served.load(Ordering::SeqCst),
            slices_kept:          self.kept.load(Ordering::SeqCst),
            blank_slices_dropped: self.dropped.load(Ordering::SeqCst),
        }
    }

    /// Fallible version of `get`.
    pub fn load(&self, index: usize) -> Result<VolumeSample> {
        let files = self
            .files
            .get(index)
            .with_context(|| format!("train index {index} out of range ({})", self.files.len()))?;
        let mut pair = self
            .source
            .load_pair(files)
            .with_context(|| format!("Cannot load training pair '{}' / '{}'", files.image, files.label))?;

        if self.skip_blank {
            let (filtered, dropped) = drop_blank_slices(pair)?;
            self.dropped.fetch_add(dropped, Ordering::SeqCst);
            pair = filtered;
        }

        let seed = example_seed(self.run_seed, self.epoch.load(Ordering::SeqCst), index);
        let out = self.augmentor.augment(&pair, seed);
        debug_assert_eq!(out.image_params, out.label_params);

        self.served.fetch_add(1, Ordering::SeqCst);
        self.kept.fetch_add(out.image.depth, Ordering::SeqCst);

        Ok(VolumeSample {
            name:  files.image.clone(),
            seed,
            image: out.image,
            label: out.label,
        })
    }
}

impl Dataset<VolumeSample> for TrainVolumeDataset {
    fn get(&self, index: usize) -> Option<VolumeSample> {
        if index >= self.files.len() {
            return None;
        }
        match self.load(index) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::error!("{e:#}");
                panic!("aborting: training volume {index} could not be loaded: {e:#}");
            }
        }
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

// ─── ValidVolumeDataset ───────────────────────────────────────────────────────
pub struct ValidVolumeDataset {
    source:    Arc<dyn VolumeSource>,
    files:     Vec<VolumePairFiles>,
    transform: ValidTransform,
}

impl ValidVolumeDataset {
    pub fn new(
        source:    Arc<dyn VolumeSource>,
        files:     Vec<VolumePairFiles>,
        transform: ValidTransform,
    ) -> Self {
        tracing::debug!("validation dataset: {} volumes", files.len());
        Self { source, files, transform }
    }

    pub fn load(&self, index: usize) -> Result<VolumeSample> {
        let files = self
            .files
            .get(index)
            .with_context(|| format!("validation index {index} out of range ({})", self.files.len()))?;
        let pair = self
            .source
            .load_pair(files)
            .with_context(|| format!("Cannot load validation pair '{}' / '{}'", files.image, files.label))?;

        Ok(VolumeSample {
            name:  files.image.clone(),
            seed:  0,
            image: self.transform.transform_image(&pair.image),
            label: self.transform.transform_label(&pair.label),
        })
    }
}

impl Dataset<VolumeSample> for ValidVolumeDataset {
    fn get(&self, index: usize) -> Option<VolumeSample> {
        if index >= self.files.len() {
            return None;
        }
        match self.load(index) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::error!("{e:#}");
                panic!("aborting: validation volume {index} could not be loaded: {e:#}");
            }
        }
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::AugmentConfig;
    use ndarray::Array3;
    use std::collections::HashMap;

    /// Volumes kept in memory, keyed by image file name.
    struct MemorySource {
        pairs: HashMap<String, VolumePair>,
    }

    impl VolumeSource for MemorySource {
        fn load_pair(&self, files: &VolumePairFiles) -> Result<VolumePair> {
            self.pairs
                .get(&files.image)
                .cloned()
                .with_context(|| format!("no such volume '{}'", files.image))
        }
    }

    /// Image slice k is filled with k; label slices in `blank` are zero.
    fn pair_with_blanks(depth: usize, blank: &[usize]) -> VolumePair {
        let image = Array3::from_shape_fn((4, 4, depth), |(_, _, k)| k as f32);
        let label = Array3::from_shape_fn((4, 4, depth), |(r, c, k)| {
            if blank.contains(&k) || (r, c) != (1, 1) { 0.0 } else { 1.0 }
        });
        VolumePair::new(image, label).unwrap()
    }

    fn source_with(name: &str, pair: VolumePair) -> Arc<dyn VolumeSource> {
        let mut pairs = HashMap::new();
        pairs.insert(name.to_string(), pair);
        Arc::new(MemorySource { pairs })
    }

    fn identity_augmentor() -> Arc<SliceAugmentor> {
        Arc::new(SliceAugmentor::new(AugmentConfig {
            max_rotation_deg: 0.0,
            scale_min:        1.0,
            scale_max:        1.0,
            hu_min:           0.0,
            hu_max:           10.0,
            ..AugmentConfig::default()
        }))
    }

    #[test]
    fn test_blank_slices_removed_in_order() {
        let (filtered, dropped) = drop_blank_slices(pair_with_blanks(5, &[1, 3])).unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(filtered.depth(), 3);
        let kept: Vec<f32> = filtered
            .image
            .axis_iter(Axis(2))
            .map(|s| s[[0, 0]])
            .collect();
        assert_eq!(kept, vec![0.0, 2.0, 4.0]);
        assert!(filtered
            .label
            .axis_iter(Axis(2))
            .all(|s| s.iter().any(|&v| v != 0.0)));
    }

    #[test]
    fn test_train_dataset_skips_blank_slices_and_counts_them() {
        let files = vec![VolumePairFiles::new("a.nii", "a_seg.nii")];
        let ds = TrainVolumeDataset::new(
            source_with("a.nii", pair_with_blanks(5, &[1, 3])),
            files,
            identity_augmentor(),
            true,
            7,
        );
        ds.reset_counters(0);
        let sample = ds.get(0).unwrap();
        assert_eq!(sample.image.depth, 3);
        assert_eq!(sample.label.depth, 3);
        let c = ds.counters();
        assert_eq!(c.volumes_served, 1);
        assert_eq!(c.slices_kept, 3);
        assert_eq!(c.blank_slices_dropped, 2);
    }

    #[test]
    fn test_reset_counters_zeroes_state_and_changes_seed() {
        let files = vec![VolumePairFiles::new("a.nii", "a_seg.nii")];
        let ds = TrainVolumeDataset::new(
            source_with("a.nii", pair_with_blanks(3, &[])),
            files,
            identity_augmentor(),
            false,
            7,
        );
        ds.reset_counters(0);
        let first = ds.get(0).unwrap().seed;
        assert_eq!(ds.get(0).unwrap().seed, first);
        assert_eq!(ds.counters().volumes_served, 2);

        ds.reset_counters(1);
        assert_eq!(ds.counters(), EpochCounters { epoch: 1, ..EpochCounters::default() });
        assert_ne!(ds.get(0).unwrap().seed, first);
    }

    #[test]
    fn test_valid_dataset_keeps_full_volume() {
        let files = vec![VolumePairFiles::new("a.nii", "a_seg.nii")];
        let ds = ValidVolumeDataset::new(
            source_with("a.nii", pair_with_blanks(5, &[1, 3])),
            files,
            ValidTransform::new(AugmentConfig::default()),
        );
        assert_eq!(ds.len(), 1);
        let a = ds.get(0).unwrap();
        let b = ds.get(0).unwrap();
        assert_eq!(a.depth(), 5);
        assert_eq!(a.image, b.image);
        assert!(ds.get(1).is_none());
    }

    #[test]
    fn test_missing_volume_is_an_error() {
        let files = vec![VolumePairFiles::new("missing.nii", "missing_seg.nii")];
        let ds = ValidVolumeDataset::new(
            source_with("a.nii", pair_with_blanks(2, &[])),
            files,
            ValidTransform::new(AugmentConfig::default()),
        );
        assert!(ds.load(0).is_err());
    }
}
