// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the cross-validation run in order:
//
//   Step 1: List and pair image/label volumes   (Layer 4 - data)
//   Step 2: Split indices into folds            (Layer 4 - data)
//   Step 3: Probe every header (fail fast)      (Layer 4 - data)
//   Step 4: Save config, open metrics log       (Layer 6 - infra)
//   Step 5: Train folds one after another       (Layer 5 - ml)
//   Step 6: Report mean ± std of the best 3D IoU over folds
//
// Folds never overlap in time: each owns the model and optimizer
// for its whole duration.
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::{bail, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::data::{
    augment::AugmentConfig,
    loader::{list_files, pair_by_sorted_order, VolumeStore},
    splitter::make_splits,
};
use crate::domain::{
    fold::{CrossValidationSummary, FoldOutcome, FoldSplit, ImprovementRule},
    volume::VolumePairFiles,
};
use crate::infra::{checkpoint::CheckpointStore, metrics::MetricsLogger};
use crate::ml::{
    model::UNetConfig,
    trainer::{run_fold, FoldContext},
};

/// Compute backend for training and segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Wgpu,
    NdArray,
}

// ─── Training Configuration ──────────────────────────────────────────────────
// Everything a run needs. Saved next to the checkpoints so the
// segmenter can rebuild the same model and pre-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub train_dir:             String,
    pub labels_dir:            String,
    pub checkpoint_dir:        String,

    pub in_channels:           usize,
    pub out_channels:          usize,
    pub base_channels:         usize,
    pub unet_depth:            usize,

    /// Volumes per training batch
    pub batch_size:            usize,
    /// Slices per forward pass when evaluating a whole volume
    pub valid_slice_batch:     usize,
    pub learning_rate:         f64,
    /// Epochs per fold, counted from the resume point
    pub num_epochs:            usize,
    /// Training fraction of the holdout split (k_folds < 2)
    pub train_val_split:       f64,
    pub seed:                  u64,
    pub max_epochs_no_improve: usize,
    /// Shuffle indices before cutting folds, and the volume order
    /// of every training epoch
    pub shuffle_files:         bool,
    pub k_folds:               usize,
    /// Drop depth slices whose label is empty before augmenting
    pub skip_blank:            bool,
    /// Shuffle the concatenated slices of each training batch
    pub permute_slices:        bool,
    /// Data-loading worker threads, 0 loads on the training thread
    pub num_workers:           usize,
    pub improvement:           ImprovementRule,
    pub augment:               AugmentConfig,
    pub backend:               BackendKind,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir:             "data/images".to_string(),
            labels_dir:            "data/labels".to_string(),
            checkpoint_dir:        "checkpoints".to_string(),
            in_channels:           1,
            out_channels:          1,
            base_channels:         32,
            unet_depth:            4,
            batch_size:            2,
            valid_slice_batch:     8,
            learning_rate:         1e-4,
            num_epochs:            100,
            train_val_split:       0.8,
            seed:                  42,
            max_epochs_no_improve: 10,
            shuffle_files:         true,
            k_folds:               5,
            skip_blank:            false,
            permute_slices:        true,
            num_workers:           0,
            improvement:           ImprovementRule::AllowTies,
            augment:               AugmentConfig::default(),
            backend:               BackendKind::Wgpu,
        }
    }
}

impl TrainConfig {
    pub fn model_config(&self) -> UNetConfig {
        UNetConfig::new(self.in_channels, self.out_channels)
            .with_base_channels(self.base_channels)
            .with_depth(self.unet_depth)
    }

    pub fn validate(&self) -> Result<()> {
        // Volumes carry one intensity channel and one binary mask.
        if self.in_channels != 1 || self.out_channels != 1 {
            bail!(
                "only single-channel volumes and masks are supported (in={}, out={})",
                self.in_channels,
                self.out_channels
            );
        }
        if self.base_channels == 0 {
            bail!("base_channels must be positive");
        }
        if self.batch_size == 0 || self.valid_slice_batch == 0 {
            bail!("batch_size and valid_slice_batch must be positive");
        }
        if !(self.learning_rate > 0.0) {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.k_folds < 2 && !(self.train_val_split > 0.0 && self.train_val_split < 1.0) {
            bail!("train_val_split must be in (0, 1), got {}", self.train_val_split);
        }
        self.augment.validate()
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<CrossValidationSummary> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1: List and pair volumes ────────────────────────────────────
        let volumes = VolumeStore::new(&cfg.train_dir, &cfg.labels_dir);
        let images  = list_files(volumes.image_dir())?;
        let labels  = list_files(volumes.label_dir())?;
        let files   = pair_by_sorted_order(images, labels)?;
        if files.is_empty() {
            bail!("no volumes found in '{}'", cfg.train_dir);
        }
        tracing::info!(
            "Paired {} volumes from '{}' and '{}' by sorted file order",
            files.len(),
            cfg.train_dir,
            cfg.labels_dir
        );

        // ── Step 2: Folds ────────────────────────────────────────────────────
        if cfg.k_folds >= 2 && cfg.k_folds > files.len() {
            bail!("cannot make {} folds from {} volumes", cfg.k_folds, files.len());
        }
        let splits = make_splits(files.len(), cfg.k_folds, cfg.shuffle_files, cfg.train_val_split, cfg.seed);
        check_splits(&splits)?;

        // ── Step 3: Header preflight ─────────────────────────────────────────
        let shapes = volumes.probe_pairs(&files)?;
        check_extents(
            &files,
            &shapes,
            cfg.model_config().required_divisor(),
            cfg.batch_size,
        )?;
        tracing::info!("All {} volume pairs passed the header check", files.len());

        // ── Step 4: Persist config, open metrics log ─────────────────────────
        let ckpt   = CheckpointStore::new(&cfg.checkpoint_dir)?;
        ckpt.save_config(cfg)?;
        let logger = MetricsLogger::new(&cfg.checkpoint_dir)?;

        // ── Step 5: Run folds ────────────────────────────────────────────────
        let ctx = FoldContext {
            cfg,
            files:  &files,
            source: Arc::new(volumes),
            store:  &ckpt,
            logger: &logger,
        };
        let outcomes = match cfg.backend {
            BackendKind::Wgpu => {
                let device = WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                run_folds::<Autodiff<Wgpu>>(&ctx, &splits, &device)?
            }
            BackendKind::NdArray => {
                tracing::info!("Using NdArray CPU backend");
                run_folds::<Autodiff<NdArray>>(&ctx, &splits, &NdArrayDevice::default())?
            }
        };

        // ── Step 6: Summary ──────────────────────────────────────────────────
        let summary = CrossValidationSummary::from_outcomes(&outcomes);
        println!(
            "Average 3D IoU over folds: {:.6} +- {:.6}",
            summary.mean_iou_3d,
            summary.std_iou_3d
        );
        Ok(summary)
    }
}

fn check_splits(splits: &[FoldSplit]) -> Result<()> {
    for split in splits {
        if split.train.is_empty() || split.dev.is_empty() {
            bail!(
                "fold {} would have {} training and {} validation volumes",
                split.fold,
                split.train.len(),
                split.dev.len()
            );
        }
    }
    Ok(())
}

/// Every slice side must divide by the U-Net divisor. Training
/// batches concatenate slices of several volumes, so with more than
/// one volume per batch all in-plane extents must agree too.
fn check_extents(
    files:      &[VolumePairFiles],
    shapes:     &[[usize; 3]],
    divisor:    usize,
    batch_size: usize,
) -> Result<()> {
    for (pair, shape) in files.iter().zip(shapes) {
        if shape[0] % divisor != 0 || shape[1] % divisor != 0 {
            bail!(
                "'{}' has slices of {}x{}; the U-Net needs multiples of {}",
                pair.image,
                shape[0],
                shape[1],
                divisor
            );
        }
    }

    if batch_size > 1 {
        let mut extents = files.iter().zip(shapes);
        if let Some((first, first_shape)) = extents.next() {
            for (pair, shape) in extents {
                if shape[..2] != first_shape[..2] {
                    bail!(
                        "'{}' has slices of {}x{} but '{}' has {}x{}; \
                         batch_size {} needs one slice size for all volumes",
                        pair.image,
                        shape[0],
                        shape[1],
                        first.image,
                        first_shape[0],
                        first_shape[1],
                        batch_size
                    );
                }
            }
        }
    }
    Ok(())
}

fn run_folds<B: AutodiffBackend>(
    ctx:    &FoldContext<'_>,
    splits: &[FoldSplit],
    device: &B::Device,
) -> Result<Vec<FoldOutcome>> {
    let mut outcomes = Vec::with_capacity(splits.len());
    for split in splits {
        tracing::info!("Starting fold {}/{}", split.fold, splits.len());
        let outcome = run_fold::<B>(ctx, split, device)?;
        tracing::info!("Fold {} finished: {}", outcome.fold, outcome.stop);
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
        assert_eq!(TrainConfig::default().model_config().required_divisor(), 16);
    }

    #[test]
    fn test_multi_channel_is_rejected() {
        let cfg = TrainConfig { out_channels: 2, ..TrainConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_holdout_fraction_is_checked() {
        let cfg = TrainConfig { k_folds: 1, train_val_split: 1.0, ..TrainConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_config_uses_defaults() {
        let cfg: TrainConfig =
            serde_json::from_str(r#"{ "k_folds": 3, "improvement": "strict", "backend": "ndarray" }"#).unwrap();
        assert_eq!(cfg.k_folds, 3);
        assert_eq!(cfg.improvement, ImprovementRule::Strict);
        assert_eq!(cfg.backend, BackendKind::NdArray);
        assert_eq!(cfg.batch_size, TrainConfig::default().batch_size);
    }

    #[test]
    fn test_too_many_folds_fail_before_training() {
        let root = tempfile::tempdir().unwrap();
        let (images, labels) = (root.path().join("img"), root.path().join("lbl"));
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        for name in ["a.nii", "b.nii"] {
            fs::write(images.join(name), b"").unwrap();
            fs::write(labels.join(name), b"").unwrap();
        }

        let cfg = TrainConfig {
            train_dir:      images.display().to_string(),
            labels_dir:     labels.display().to_string(),
            checkpoint_dir: root.path().join("ckpt").display().to_string(),
            k_folds:        3,
            ..TrainConfig::default()
        };
        let err = TrainUseCase::new(cfg).execute().unwrap_err();
        assert!(err.to_string().contains("folds"));
        assert!(!root.path().join("ckpt").exists());
    }

    fn write_volume(path: &std::path::Path, shape: (usize, usize, usize)) {
        let volume = ndarray::Array3::<f32>::zeros(shape);
        nifti::writer::WriterOptions::new(path).write_nifti(&volume).unwrap();
    }

    #[test]
    fn test_mixed_slice_sizes_fail_before_training() {
        let root = tempfile::tempdir().unwrap();
        let (images, labels) = (root.path().join("img"), root.path().join("lbl"));
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        for (name, shape) in [("a.nii", (4, 4, 2)), ("b.nii", (8, 8, 2)), ("c.nii", (4, 4, 2))] {
            write_volume(&images.join(name), shape);
            write_volume(&labels.join(name), shape);
        }

        let cfg = TrainConfig {
            train_dir:      images.display().to_string(),
            labels_dir:     labels.display().to_string(),
            checkpoint_dir: root.path().join("ckpt").display().to_string(),
            base_channels:  2,
            unet_depth:     1,
            batch_size:     2,
            k_folds:        3,
            backend:        BackendKind::NdArray,
            ..TrainConfig::default()
        };
        let err = TrainUseCase::new(cfg).execute().unwrap_err();
        assert!(err.to_string().contains("b.nii"), "{err}");
        assert!(!root.path().join("ckpt").exists());
    }

    #[test]
    fn test_extent_check_depends_on_batch_size() {
        let files  = vec![VolumePairFiles::new("a.nii", "a.nii"), VolumePairFiles::new("b.nii", "b.nii")];
        let shapes = [[4, 4, 2], [8, 8, 3]];
        assert!(check_extents(&files, &shapes, 2, 1).is_ok());
        assert!(check_extents(&files, &shapes, 2, 2).is_err());
        assert!(check_extents(&files, &[[4, 6, 2], [4, 6, 2]], 4, 1).is_err());
    }

    #[test]
    fn test_empty_dev_set_is_rejected() {
        let split = FoldSplit { fold: 1, train: vec![0, 1], dev: vec![] };
        assert!(check_splits(&[split]).is_err());
    }
}
