// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Forward-only evaluation of whole volumes, a few slices at a time.
//
// A volume of depth D does not fit through the network in one pass
// on most devices, so it is cut along the slice axis into chunks of
// `slice_batch` slices, each chunk is run on its own, and the outputs
// are concatenated back in order:
//
//   [D, 1, H, W] ─► [s,1,H,W] [s,1,H,W] ... [r,1,H,W] ─► [D, 1, H, W]
//
// The last chunk holds the remainder r = D mod s (if any). Output
// slice k always comes from input slice k.
//
// Used by the validation loop and by the `segment` command.

use anyhow::{anyhow, bail, Result};
use burn::{prelude::*, tensor::TensorData};
use ndarray::Array3;

use crate::data::augment::ValidTransform;
use crate::domain::volume::SliceStack;
use crate::application::train_use_case::TrainConfig;
use crate::infra::checkpoint::CheckpointStore;
use crate::ml::{losses::THRESHOLD, model::UNet};

/// Run `forward` over `volume` in chunks of at most `slice_batch`
/// slices and restack the outputs in slice order.
///
/// # Panics
/// When the volume has no slices or `slice_batch` is zero.
pub fn infer_by_slices<B, F>(volume: Tensor<B, 4>, slice_batch: usize, mut forward: F) -> Tensor<B, 4>
where
    B: Backend,
    F: FnMut(Tensor<B, 4>) -> Tensor<B, 4>,
{
    let depth = volume.dims()[0];
    assert!(depth > 0, "cannot run inference on a volume with no slices");
    assert!(slice_batch > 0, "slice batch size must be positive");

    let outputs: Vec<Tensor<B, 4>> = (0..depth)
        .step_by(slice_batch)
        .map(|start| {
            let len = slice_batch.min(depth - start);
            forward(volume.clone().narrow(0, start, len))
        })
        .collect();

    Tensor::cat(outputs, 0)
}

/// Best model of one fold plus the deterministic pre-processing it
/// was validated with.
pub struct Segmenter<B: Backend> {
    model:       UNet<B>,
    transform:   ValidTransform,
    slice_batch: usize,
    threshold:   f64,
    /// Slice sides must be multiples of this
    divisor:     usize,
    device:      B::Device,
}

impl<B: Backend> Segmenter<B> {
    pub fn from_checkpoint(store: &CheckpointStore, fold: usize, device: B::Device) -> Result<Self> {
        let cfg = store.load_config()?;
        let model: UNet<B> = cfg.model_config().init(&device);
        let model = store.load_best_model::<B, _>(fold, model, &device)?;
        tracing::info!("Loaded best model of fold {} from '{}'", fold, store.dir().display());

        Ok(Self::new(&cfg, model, device))
    }

    pub fn new(cfg: &TrainConfig, model: UNet<B>, device: B::Device) -> Self {
        Self {
            model,
            transform:   ValidTransform::new(cfg.augment.clone()),
            slice_batch: cfg.valid_slice_batch,
            threshold:   THRESHOLD,
            divisor:     cfg.model_config().required_divisor(),
            device,
        }
    }

    /// Binary mask (0/1) with the same shape as `volume`.
    pub fn segment(&self, volume: &Array3<f32>) -> Result<Array3<u8>> {
        let (height, width, _) = volume.dim();
        if height % self.divisor != 0 || width % self.divisor != 0 {
            bail!(
                "slices of {}x{} do not fit the U-Net; both sides must be multiples of {}",
                height,
                width,
                self.divisor
            );
        }

        let stack = self.transform.transform_image(volume);
        let (depth, height, width) = (stack.depth, stack.height, stack.width);
        if depth == 0 {
            return Err(anyhow!("volume has no slices"));
        }

        let input = Tensor::<B, 4>::from_data(
            TensorData::new(stack.voxels, [depth, 1, height, width]),
            &self.device,
        );
        let probs = infer_by_slices(input, self.slice_batch, |x| self.model.forward(x));
        let voxels = probs
            .greater_elem(self.threshold)
            .float()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read prediction tensor: {e:?}"))?;

        let mask = SliceStack { depth, height, width, voxels };
        Ok(mask.to_volume().mapv(|v| v as u8))
    }
}
