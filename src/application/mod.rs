// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Workflow coordination only: which data goes where, in which
// order, on which backend. No tensor math and no file formats
// here; those belong to Layers 4, 5 and 6.
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The k-fold training workflow
pub mod train_use_case;

// Mask prediction with a trained fold
pub mod segment_use_case;
