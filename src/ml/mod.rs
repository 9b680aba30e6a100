// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Network, losses, the fold training loop and slice-wise
// inference. The data layer builds tensors through Burn's
// Dataset/Batcher traits; everything that runs a forward pass
// lives here.
//
//   model.rs      — U-Net encoder/decoder with skip connections
//   losses.rs     — Dice loss, soft/thresholded IoU, 3D IoU
//   trainer.rs    — one fold: train, validate, checkpoint,
//                   early stopping
//   inferencer.rs — chunked slice inference and the segmenter
//                   used by the `segment` command
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Ronneberger et al. (2015) U-Net

/// U-Net architecture
pub mod model;

/// Loss and overlap metrics on slice tensors
pub mod losses;

/// Per-fold training loop with validation and checkpointing
pub mod trainer;

/// Slice-chunked inference
pub mod inferencer;
