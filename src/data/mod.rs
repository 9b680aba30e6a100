// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from NIfTI files on disk to slice tensors.
//
// The pipeline flows in this order:
//
//   image dir + label dir
//       │
//       ▼
//   VolumeStore        → lists, pairs and reads volumes
//       │
//       ▼
//   TrainVolumeDataset → blank-slice skipping + SliceAugmentor
//   ValidVolumeDataset → deterministic clip/normalise
//       │
//       ▼
//   SliceBatcher /     → concatenates variable-depth volumes into
//   ValidBatcher         [slices, 1, H, W] tensors
//       │
//       ▼
//   DataLoader         → feeds batches to the fold loop
//
// The splitter decides which volumes go to which dataset.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Lists, pairs and reads NIfTI volumes
pub mod loader;

/// Seeded paired augmentation and deterministic validation transform
pub mod augment;

/// Implements Burn's Dataset trait for train and validation volumes
pub mod dataset;

/// Implements Burn's Batcher trait to create slice batches
pub mod batcher;

/// K-fold and holdout splits of the file index set
pub mod splitter;
