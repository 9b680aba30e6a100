// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that describe the experiment:
//
//   volume.rs — image/label volumes and the per-volume slice stacks
//               produced by augmentation
//   fold.rs   — k-fold splits, the improvement/early-stopping state
//               machine and the per-fold / cross-validation outcomes
//   traits.rs — the VolumeSource abstraction the datasets load through
//
// Rules for this layer:
//   - NO Burn types here
//   - NO file I/O
//   - ndarray is allowed: a volume IS a 3D array
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

pub mod volume;

pub mod fold;

pub mod traits;
