// ============================================================
// Layer 2 — Segment Use Case
// ============================================================
// Runs the best model of one fold over a directory of unlabelled
// volumes and writes one binary NIfTI mask per input:
//
//   1. Rebuild the model from train_config.json
//   2. Load bestmodel_fold<N> weights
//   3. For every volume in the input directory:
//        clip/normalise → slice-chunked inference → threshold
//        → write <output_dir>/<same file name>
//
// Masks keep the geometry (header) of their input volume.

use anyhow::{bail, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    prelude::Backend,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::application::train_use_case::BackendKind;
use crate::data::loader::{list_files, VolumeStore};
use crate::infra::checkpoint::CheckpointStore;
use crate::ml::inferencer::Segmenter;

pub struct SegmentUseCase {
    checkpoint_dir: PathBuf,
    fold:           usize,
    backend:        BackendKind,
}

impl SegmentUseCase {
    pub fn new(checkpoint_dir: impl Into<PathBuf>, fold: usize, backend: BackendKind) -> Self {
        Self { checkpoint_dir: checkpoint_dir.into(), fold, backend }
    }

    /// Returns the written mask paths, in input order.
    pub fn execute(&self, input_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let names = list_files(input_dir)?;
        if names.is_empty() {
            bail!("no volumes found in '{}'", input_dir.display());
        }
        if same_directory(input_dir, output_dir) {
            bail!(
                "output directory '{}' is the input directory; masks would overwrite the scans",
                output_dir.display()
            );
        }

        let store = CheckpointStore::new(&self.checkpoint_dir)?;
        match self.backend {
            BackendKind::Wgpu => {
                self.segment_all::<Wgpu>(&store, WgpuDevice::default(), input_dir, output_dir, &names)
            }
            BackendKind::NdArray => {
                self.segment_all::<NdArray>(&store, NdArrayDevice::default(), input_dir, output_dir, &names)
            }
        }
    }

    fn segment_all<B: Backend>(
        &self,
        store:      &CheckpointStore,
        device:     B::Device,
        input_dir:  &Path,
        output_dir: &Path,
        names:      &[String],
    ) -> Result<Vec<PathBuf>> {
        let segmenter = Segmenter::<B>::from_checkpoint(store, self.fold, device)?;

        let mut written = Vec::with_capacity(names.len());
        for name in names {
            let (volume, header) = VolumeStore::load_with_header(input_dir, name)?;
            let mask = segmenter
                .segment(&volume)
                .with_context(|| format!("Segmentation of '{name}' failed"))?;
            let foreground = mask.iter().filter(|&&v| v != 0).count();

            let path = VolumeStore::write_mask(output_dir, name, &mask, &header)?;
            tracing::info!("'{}': {} foreground voxels → '{}'", name, foreground, path.display());
            written.push(path);
        }
        Ok(written)
    }
}

/// Masks take the input file names, so the two directories must differ.
fn same_directory(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
