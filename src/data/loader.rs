// ============================================================
// Layer 4 — Volume Store
// ============================================================
// Loads NIfTI volumes (.nii / .nii.gz) from an image directory
// and a label directory using the `nifti` crate.
//
// Pairing contract:
//   Files are paired by SORTED POSITION, not by name:
//     sorted(images)[i]  ↔  sorted(labels)[i]
//   This only works while both directories follow naming schemes
//   that sort the same way (e.g. volume-7.nii / segmentation-7.nii).
//   Diverging names silently pair the wrong scans, so every pair
//   is logged at debug level for inspection.
//
// Two read paths:
//   probe()  — header only, cheap; used to fail fast before a fold
//   load()   — full voxel data as ndarray::Array3<f32>
//
// No caching: volumes are large and each one is read once per
// epoch through the dataset, so memory is never held between reads.
//
// Reference: nifti crate documentation (ReaderOptions, IntoNdArray)
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::domain::traits::VolumeSource;
use crate::domain::volume::{VolumePair, VolumePairFiles};

// ─── Errors ───────────────────────────────────────────────────────────────────
/// Everything that can go wrong reading a volume. All of them are
/// fatal for a training run.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume file '{0}' does not exist")]
    Missing(PathBuf),

    #[error("cannot read volume '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("volume '{path}' has shape {shape:?}, expected three spatial dimensions")]
    NotVolumetric { path: PathBuf, shape: Vec<usize> },

    #[error("image '{image}' {image_shape:?} and label '{label}' {label_shape:?} differ in shape")]
    ShapeMismatch {
        image:       String,
        label:       String,
        image_shape: [usize; 3],
        label_shape: [usize; 3],
    },
}

/// Extent of a volume read from its header alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHeader {
    pub shape: [usize; 3],
}

// ─── VolumeStore ──────────────────────────────────────────────────────────────
/// Resolves file names under the image and label roots to volumes.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    image_dir: PathBuf,
    label_dir: PathBuf,
}

impl VolumeStore {
    pub fn new(image_dir: impl Into<PathBuf>, label_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            label_dir: label_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn label_dir(&self) -> &Path {
        &self.label_dir
    }

    /// Read a volume's header and return its 3D extent.
    pub fn probe(root: &Path, name: &str) -> Result<VolumeHeader, VolumeError> {
        let path = existing(root, name)?;
        let header = NiftiHeader::from_file(&path)
            .map_err(|source| VolumeError::Unreadable { path: path.clone(), source })?;
        let ndim = usize::from(header.dim[0]).min(7);
        let shape: Vec<usize> = header.dim[1..=ndim].iter().map(|&d| usize::from(d)).collect();
        let shape = spatial_shape(&shape).ok_or(VolumeError::NotVolumetric { path, shape })?;
        Ok(VolumeHeader { shape })
    }

    /// Load a volume as 32-bit floats with scaling already applied.
    pub fn load(root: &Path, name: &str) -> Result<Array3<f32>, VolumeError> {
        Self::load_with_header(root, name).map(|(volume, _)| volume)
    }

    /// Load a volume and keep its header (used to write masks with the
    /// same geometry).
    pub fn load_with_header(
        root: &Path,
        name: &str,
    ) -> Result<(Array3<f32>, NiftiHeader), VolumeError> {
        let path = existing(root, name)?;
        let unreadable = |source| VolumeError::Unreadable { path: path.clone(), source };

        let object = ReaderOptions::new().read_file(&path).map_err(unreadable)?;
        let header = object.header().clone();
        let data: ArrayD<f32> = object.into_volume().into_ndarray::<f32>().map_err(unreadable)?;

        let volume = into_volume3(data).map_err(|shape| VolumeError::NotVolumetric {
            path: path.clone(),
            shape,
        })?;
        Ok((volume, header))
    }

    /// Check both files of every pair before any training starts.
    /// Returns the common extent of each pair, in order.
    pub fn probe_pairs(&self, pairs: &[VolumePairFiles]) -> Result<Vec<[usize; 3]>> {
        pairs
            .iter()
            .map(|p| {
                let image = Self::probe(&self.image_dir, &p.image)?;
                let label = Self::probe(&self.label_dir, &p.label)?;
                if image.shape != label.shape {
                    return Err(VolumeError::ShapeMismatch {
                        image:       p.image.clone(),
                        label:       p.label.clone(),
                        image_shape: image.shape,
                        label_shape: label.shape,
                    }
                    .into());
                }
                Ok(image.shape)
            })
            .collect()
    }

    /// Write a mask volume to `dir/name`, reusing the geometry of
    /// `reference`.
    pub fn write_mask(
        dir: &Path,
        name: &str,
        mask: &Array3<u8>,
        reference: &NiftiHeader,
    ) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create output directory '{}'", dir.display()))?;
        let path = dir.join(name);
        nifti::writer::WriterOptions::new(&path)
            .reference_header(reference)
            .write_nifti(mask)
            .with_context(|| format!("Cannot write mask '{}'", path.display()))?;
        Ok(path)
    }
}

impl VolumeSource for VolumeStore {
    fn load_pair(&self, files: &VolumePairFiles) -> Result<VolumePair> {
        let image = Self::load(&self.image_dir, &files.image)?;
        let label = Self::load(&self.label_dir, &files.label)?;
        let (image_shape, label_shape) = (image.dim(), label.dim());
        VolumePair::new(image, label).ok_or_else(|| {
            VolumeError::ShapeMismatch {
                image:       files.image.clone(),
                label:       files.label.clone(),
                image_shape: [image_shape.0, image_shape.1, image_shape.2],
                label_shape: [label_shape.0, label_shape.1, label_shape.2],
            }
            .into()
        })
    }
}

// ─── Directory listing and pairing ────────────────────────────────────────────

/// Sorted names of the regular, non-hidden files directly under `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Cannot read directory '{}'", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Pair image and label file names by their position after sorting.
pub fn pair_by_sorted_order(
    mut images: Vec<String>,
    mut labels: Vec<String>,
) -> Result<Vec<VolumePairFiles>> {
    images.sort();
    labels.sort();
    if images.len() != labels.len() {
        anyhow::bail!(
            "found {} image volumes but {} label volumes; cannot pair them",
            images.len(),
            labels.len()
        );
    }

    let pairs: Vec<VolumePairFiles> = images
        .into_iter()
        .zip(labels)
        .map(|(image, label)| {
            tracing::debug!("pairing '{}' with '{}'", image, label);
            VolumePairFiles::new(image, label)
        })
        .collect();
    Ok(pairs)
}

fn existing(root: &Path, name: &str) -> Result<PathBuf, VolumeError> {
    let path = root.join(name);
    if !path.is_file() {
        return Err(VolumeError::Missing(path));
    }
    Ok(path)
}

/// Accept `[x, y, z]` plus any number of trailing unit dimensions.
fn spatial_shape(shape: &[usize]) -> Option<[usize; 3]> {
    if shape.len() < 3 || shape[3..].iter().any(|&d| d != 1) {
        return None;
    }
    Some([shape[0], shape[1], shape[2]])
}

fn into_volume3(mut data: ArrayD<f32>) -> Result<Array3<f32>, Vec<usize>> {
    let shape = data.shape().to_vec();
    spatial_shape(&shape).ok_or_else(|| shape.clone())?;
    while data.ndim() > 3 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    data.into_dimensionality::<Ix3>().map_err(|_| shape)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_follow_sorted_position() {
        let images = vec!["volume-2.nii".to_string(), "volume-1.nii".to_string()];
        let labels = vec!["seg-1.nii".to_string(), "seg-2.nii".to_string()];
        let pairs = pair_by_sorted_order(images, labels).unwrap();
        assert_eq!(pairs[0], VolumePairFiles::new("volume-1.nii", "seg-1.nii"));
        assert_eq!(pairs[1], VolumePairFiles::new("volume-2.nii", "seg-2.nii"));
    }

    #[test]
    fn test_pairing_uses_position_even_when_names_disagree() {
        // Names are never compared; only the sorted position matters.
        let images = vec!["a.nii".to_string(), "b.nii".to_string()];
        let labels = vec!["z.nii".to_string(), "y.nii".to_string()];
        let pairs = pair_by_sorted_order(images, labels).unwrap();
        assert_eq!(pairs[0].label, "y.nii");
        assert_eq!(pairs[1].label, "z.nii");
    }

    #[test]
    fn test_count_mismatch_is_an_error() {
        let images = vec!["a.nii".to_string()];
        let labels = Vec::new();
        assert!(pair_by_sorted_order(images, labels).is_err());
    }

    #[test]
    fn test_missing_volume_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = VolumeStore::load(dir.path(), "absent.nii").unwrap_err();
        assert!(matches!(err, VolumeError::Missing(_)));
    }

    #[test]
    fn test_corrupt_volume_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.nii"), b"not a nifti file").unwrap();
        let err = VolumeStore::load(dir.path(), "broken.nii").unwrap_err();
        assert!(matches!(err, VolumeError::Unreadable { .. }));
    }

    #[test]
    fn test_list_files_skips_hidden_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.nii"), b"").unwrap();
        fs::write(dir.path().join("a.nii"), b"").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        assert_eq!(list_files(dir.path()).unwrap(), vec!["a.nii", "b.nii"]);
    }

    #[test]
    fn test_trailing_unit_dimensions_are_dropped() {
        let data = ArrayD::<f32>::zeros(vec![4, 5, 6, 1]);
        let vol = into_volume3(data).unwrap();
        assert_eq!(vol.dim(), (4, 5, 6));
        assert!(into_volume3(ArrayD::<f32>::zeros(vec![4, 5])).is_err());
        assert!(into_volume3(ArrayD::<f32>::zeros(vec![4, 5, 6, 2])).is_err());
    }
}
