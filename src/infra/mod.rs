// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Persistence used by the training loop and the segmenter:
//
//   checkpoint.rs — per-fold model + optimizer records
//                   (CompactRecorder), checkpoint metadata and
//                   the saved TrainConfig
//
//   metrics.rs    — mean/std aggregation of batch scores and the
//                   per-epoch CSV log
//
// Reference: Burn Book §5 (Checkpointing)
//            Rust Book §9 (Error Handling with anyhow)

/// Fold checkpoint saving and loading
pub mod checkpoint;

/// Epoch metrics and CSV logger
pub mod metrics;
