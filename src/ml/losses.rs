// ============================================================
// Layer 5 — Loss and Overlap Metrics
// ============================================================
// All functions take probabilities and binary targets shaped
// [slices, channels, H, W] and return a single-element tensor.
//
//   dice_loss      1 - (2|P∩T| + s) / (|P| + |T| + s)   (soft, whole batch)
//   soft_iou       mean over slices of (|P∩T| + e) / (|P∪T| + e)
//   threshold_iou  same as soft_iou after P > threshold
//   iou_3d         one IoU over every voxel of the volume, after
//                  P > threshold, used on restacked validation
//                  volumes, where spatial alignment matters
//
// A slice with neither prediction nor target scores 1: predicting
// nothing where there is nothing is correct.
//
// Reference: Milletari et al. (2016) V-Net (Dice loss)

use burn::{prelude::*, tensor::ElementConversion};

const DICE_SMOOTH: f64 = 1.0;
const IOU_EPS: f64 = 1e-6;

/// Probability above which a pixel counts as foreground.
pub const THRESHOLD: f64 = 0.5;

pub fn dice_loss<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let intersection = (pred.clone() * target.clone()).sum();
    let denominator = pred.sum() + target.sum();
    let dice = intersection
        .mul_scalar(2.0)
        .add_scalar(DICE_SMOOTH)
        .div(denominator.add_scalar(DICE_SMOOTH));
    dice.neg().add_scalar(1.0)
}

fn per_slice_iou<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = pred.dims();
    let p = pred.reshape([n, c * h * w]);
    let t = target.reshape([n, c * h * w]);

    let intersection = (p.clone() * t.clone()).sum_dim(1);
    let union = p.sum_dim(1) + t.sum_dim(1) - intersection.clone();
    let iou = intersection.add_scalar(IOU_EPS).div(union.add_scalar(IOU_EPS));
    iou.mean()
}

pub fn soft_iou<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    per_slice_iou(pred, target)
}

pub fn threshold_iou<B: Backend>(
    pred:      Tensor<B, 4>,
    target:    Tensor<B, 4>,
    threshold: f64,
) -> Tensor<B, 1> {
    per_slice_iou(pred.greater_elem(threshold).float(), target)
}

pub fn iou_3d<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>, threshold: f64) -> Tensor<B, 1> {
    let p = pred.greater_elem(threshold).float().flatten::<1>(0, 3);
    let t = target.flatten::<1>(0, 3);
    let intersection = (p.clone() * t.clone()).sum();
    let union = p.sum() + t.sum() - intersection.clone();
    intersection.add_scalar(IOU_EPS).div(union.add_scalar(IOU_EPS))
}

/// Read a single-element tensor as f64.
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(burn::tensor::TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_perfect_prediction() {
        let t = tensor(vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0], [2, 1, 2, 2]);
        assert!(scalar(dice_loss(t.clone(), t.clone())) < 1e-6);
        assert!((scalar(soft_iou(t.clone(), t.clone())) - 1.0).abs() < 1e-6);
        assert!((scalar(iou_3d(t.clone(), t.clone(), THRESHOLD)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_disjoint_prediction_scores_zero() {
        let pred   = tensor(vec![1.0, 0.0, 0.0, 0.0], [1, 1, 2, 2]);
        let target = tensor(vec![0.0, 0.0, 0.0, 1.0], [1, 1, 2, 2]);
        assert!(scalar(threshold_iou(pred.clone(), target.clone(), THRESHOLD)) < 1e-5);
        assert!(scalar(iou_3d(pred, target, THRESHOLD)) < 1e-5);
    }

    #[test]
    fn test_threshold_rounds_probabilities() {
        let pred   = tensor(vec![0.9, 0.6, 0.2, 0.1], [1, 1, 2, 2]);
        let target = tensor(vec![1.0, 1.0, 0.0, 0.0], [1, 1, 2, 2]);
        assert!((scalar(threshold_iou(pred.clone(), target.clone(), THRESHOLD)) - 1.0).abs() < 1e-5);
        assert!(scalar(soft_iou(pred, target)) < 1.0);
    }

    #[test]
    fn test_iou_3d_pools_all_slices() {
        // Slice 0 perfect (2 voxels), slice 1 misses its only voxel:
        // per-slice mean = 0.5, volumetric = 2 / 3.
        let pred   = tensor(vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], [2, 1, 2, 2]);
        let target = tensor(vec![1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], [2, 1, 2, 2]);
        let per_slice = scalar(threshold_iou(pred.clone(), target.clone(), THRESHOLD));
        let volume    = scalar(iou_3d(pred, target, THRESHOLD));
        assert!((per_slice - 0.5).abs() < 1e-4);
        assert!((volume - 2.0 / 3.0).abs() < 1e-4);
    }
}
