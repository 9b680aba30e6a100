// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands: `train` and `segment`
// and all their configurable flags.
//
// `train --config run.json` reads a complete TrainConfig from JSON
// (missing fields take their defaults) and ignores the other
// training flags.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::application::train_use_case::{BackendKind, TrainConfig};
use crate::data::augment::AugmentConfig;
use crate::domain::fold::ImprovementRule;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Cross-validate a U-Net on paired image/label volumes
    Train(TrainArgs),

    /// Predict masks for unlabelled volumes with a trained fold
    Segment(SegmentArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    /// GPU through wgpu
    Wgpu,
    /// CPU
    Ndarray,
}

impl From<BackendArg> for BackendKind {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Wgpu    => BackendKind::Wgpu,
            BackendArg::Ndarray => BackendKind::NdArray,
        }
    }
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Load the whole training configuration from a JSON file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory of image volumes (.nii / .nii.gz)
    #[arg(long, default_value = "data/images")]
    pub train_dir: String,

    /// Directory of label volumes, paired with images by sorted order
    #[arg(long, default_value = "data/labels")]
    pub labels_dir: String,

    /// Where checkpoints, train_config.json and metrics.csv go
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    #[arg(long, default_value_t = 1)]
    pub in_channels: usize,

    #[arg(long, default_value_t = 1)]
    pub out_channels: usize,

    /// Channels of the first U-Net level, doubled per level
    #[arg(long, default_value_t = 32)]
    pub base_channels: usize,

    /// Number of pooling levels; slice sides must divide by 2^depth
    #[arg(long, default_value_t = 4)]
    pub unet_depth: usize,

    /// Volumes per training batch (all their slices are concatenated)
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    /// Slices per forward pass during validation
    #[arg(long, default_value_t = 8)]
    pub valid_slice_batch: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// Epochs per fold, counted from the resume point
    #[arg(long, default_value_t = 100)]
    pub num_epochs: usize,

    /// Training fraction when k_folds < 2
    #[arg(long, default_value_t = 0.8)]
    pub train_val_split: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Patience: stop once this many epochs in a row fail to improve
    /// and one more does too
    #[arg(long, default_value_t = 10)]
    pub max_epochs_no_improve: usize,

    /// Keep file order for fold assignment and training epochs
    #[arg(long)]
    pub no_shuffle: bool,

    /// Number of folds; below 2 runs a single holdout split
    #[arg(long, default_value_t = 5)]
    pub k_folds: usize,

    /// Drop depth slices without any label voxel from training volumes
    #[arg(long)]
    pub skip_blank: bool,

    /// Keep slices of a training batch in volume order
    #[arg(long)]
    pub no_permute: bool,

    /// Data-loading worker threads
    #[arg(long, default_value_t = 0)]
    pub num_workers: usize,

    /// Count only strictly lower validation loss as improvement
    #[arg(long)]
    pub strict_improvement: bool,

    #[arg(long, default_value_t = 5.0)]
    pub max_rotation_deg: f32,

    #[arg(long, default_value_t = 1.0)]
    pub scale_min: f32,

    #[arg(long, default_value_t = 1.25)]
    pub scale_max: f32,

    /// Lower end of the intensity window (HU)
    #[arg(long, default_value_t = -1024.0, allow_hyphen_values = true)]
    pub hu_min: f32,

    /// Upper end of the intensity window (HU)
    #[arg(long, default_value_t = 1024.0, allow_hyphen_values = true)]
    pub hu_max: f32,

    /// Image value for pixels warped in from outside the slice
    #[arg(long, default_value_t = -1024.0, allow_hyphen_values = true)]
    pub image_fill: f32,

    /// Label value for pixels warped in from outside the slice
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub label_fill: f32,

    /// Keep raw label values instead of mapping foreground to 1
    #[arg(long)]
    pub no_binarize: bool,

    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    pub backend: BackendArg,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            train_dir:             a.train_dir,
            labels_dir:            a.labels_dir,
            checkpoint_dir:        a.checkpoint_dir,
            in_channels:           a.in_channels,
            out_channels:          a.out_channels,
            base_channels:         a.base_channels,
            unet_depth:            a.unet_depth,
            batch_size:            a.batch_size,
            valid_slice_batch:     a.valid_slice_batch,
            learning_rate:         a.learning_rate,
            num_epochs:            a.num_epochs,
            train_val_split:       a.train_val_split,
            seed:                  a.seed,
            max_epochs_no_improve: a.max_epochs_no_improve,
            shuffle_files:         !a.no_shuffle,
            k_folds:               a.k_folds,
            skip_blank:            a.skip_blank,
            permute_slices:        !a.no_permute,
            num_workers:           a.num_workers,
            improvement: if a.strict_improvement {
                ImprovementRule::Strict
            } else {
                ImprovementRule::AllowTies
            },
            augment: AugmentConfig {
                max_rotation_deg: a.max_rotation_deg,
                scale_min:        a.scale_min,
                scale_max:        a.scale_max,
                hu_min:           a.hu_min,
                hu_max:           a.hu_max,
                image_fill:       a.image_fill,
                label_fill:       a.label_fill,
                binarize_labels:  !a.no_binarize,
            },
            backend: a.backend.into(),
        }
    }
}

/// All arguments for the `segment` command
#[derive(Args, Debug)]
pub struct SegmentArgs {
    /// Directory of volumes to segment
    #[arg(long)]
    pub input_dir: PathBuf,

    /// Directory the masks are written to, one per input, same name
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Directory where checkpoints were saved during training
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Fold whose best model is used
    #[arg(long, default_value_t = 1)]
    pub fold: usize,

    #[arg(long, value_enum, default_value_t = BackendArg::Wgpu)]
    pub backend: BackendArg,
}
