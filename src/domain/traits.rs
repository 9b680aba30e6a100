// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The datasets never open files themselves: they ask a
// VolumeSource for the pair behind a VolumePairFiles entry.
//
// Implementations:
//   - VolumeStore       → reads NIfTI volumes from two directories
//   - in-memory sources → used by the dataset unit tests
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;

use crate::domain::volume::{VolumePair, VolumePairFiles};

// ─── VolumeSource ─────────────────────────────────────────────────────────────
/// Anything that can resolve a file pair to loaded volumes.
///
/// Must be `Send + Sync`: the data loader may call it from
/// prefetch worker threads.
pub trait VolumeSource: Send + Sync {
    /// Load the image and label volumes of one example.
    /// No caching: every call reads the data again.
    fn load_pair(&self, files: &VolumePairFiles) -> Result<VolumePair>;
}
