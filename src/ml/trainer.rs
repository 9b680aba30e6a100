// ============================================================
// Layer 5 — Fold Training Loop
// ============================================================
// Trains and validates one fold using Burn's DataLoader and Adam.
//
// Per fold:
//   1. Build train/validation datasets from the fold's file indices
//   2. Initialise model + optimizer, or resume both from the fold's
//      best checkpoint (epoch and best loss come back with them)
//   3. Epoch loop, at most `num_epochs` epochs after the start epoch:
//        reset dataset counters → train → validate → report
//        improved?  save snapshot + best copy, reset patience
//        otherwise  patience + 1; stop once it exceeds the maximum
//
// Backends:
//   - Training runs on B (an AutodiffBackend) for gradients
//   - model.valid() returns the model on B::InnerBackend, so the
//     validation batcher uses B::InnerBackend too
//
// Compute is strictly sequential per batch. Only data loading may
// run on worker threads (num_workers > 0).
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::{Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::sync::Arc;

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    augment::{SliceAugmentor, ValidTransform},
    batcher::{SliceBatch, SliceBatcher, ValidBatcher, VolumeBatch},
    dataset::{TrainVolumeDataset, ValidVolumeDataset},
};
use crate::domain::{
    fold::{EarlyStopping, FoldOutcome, FoldSplit, StopReason},
    traits::VolumeSource,
    volume::VolumePairFiles,
};
use crate::infra::{
    checkpoint::{CheckpointMeta, CheckpointStore},
    metrics::{EpochMetrics, MetricsLogger, ScoreTracker},
};
use crate::ml::{
    inferencer::infer_by_slices,
    losses::{dice_loss, iou_3d, scalar, soft_iou, threshold_iou, THRESHOLD},
    model::UNet,
};

/// Everything a fold needs that outlives the fold.
pub struct FoldContext<'a> {
    pub cfg:    &'a TrainConfig,
    /// All paired files; fold splits index into this list
    pub files:  &'a [VolumePairFiles],
    pub source: Arc<dyn VolumeSource>,
    pub store:  &'a CheckpointStore,
    pub logger: &'a MetricsLogger,
}

fn select(files: &[VolumePairFiles], indices: &[usize]) -> Result<Vec<VolumePairFiles>> {
    indices
        .iter()
        .map(|&i| {
            files
                .get(i)
                .cloned()
                .with_context(|| format!("fold index {i} out of range ({} files)", files.len()))
        })
        .collect()
}

pub fn run_fold<B: AutodiffBackend>(
    ctx:    &FoldContext<'_>,
    split:  &FoldSplit,
    device: &B::Device,
) -> Result<FoldOutcome> {
    let cfg  = ctx.cfg;
    let fold = split.fold;

    // ── Datasets ──────────────────────────────────────────────────────────────
    let augmentor = Arc::new(SliceAugmentor::new(cfg.augment.clone()));
    let train_dataset = Arc::new(TrainVolumeDataset::new(
        ctx.source.clone(),
        select(ctx.files, &split.train)?,
        augmentor,
        cfg.skip_blank,
        cfg.seed,
    ));
    let valid_dataset = ValidVolumeDataset::new(
        ctx.source.clone(),
        select(ctx.files, &split.dev)?,
        ValidTransform::new(cfg.augment.clone()),
    );
    tracing::info!(
        "Fold {}: {} training volumes, {} validation volumes",
        fold,
        split.train.len(),
        split.dev.len()
    );

    // ── Training data loader (AutodiffBackend) ────────────────────────────────
    let train_batcher = if cfg.permute_slices {
        SliceBatcher::<B>::permuting(device.clone())
    } else {
        SliceBatcher::<B>::new(device.clone())
    };
    let mut train_builder = DataLoaderBuilder::new(train_batcher).batch_size(cfg.batch_size);
    if cfg.shuffle_files {
        train_builder = train_builder.shuffle(cfg.seed.wrapping_add(fold as u64));
    }
    if cfg.num_workers > 0 {
        train_builder = train_builder.num_workers(cfg.num_workers);
    }
    let train_loader = train_builder.build(train_dataset.clone());

    // ── Validation data loader (InnerBackend, one volume per batch) ───────────
    let mut valid_builder =
        DataLoaderBuilder::new(ValidBatcher::<B::InnerBackend>::new(device.clone())).batch_size(1);
    if cfg.num_workers > 0 {
        valid_builder = valid_builder.num_workers(cfg.num_workers);
    }
    let valid_loader = valid_builder.build(valid_dataset);

    // ── Model + Adam, fresh or resumed ────────────────────────────────────────
    B::seed(cfg.seed.wrapping_add(fold as u64));
    let model: UNet<B> = cfg.model_config().init(device);
    let optim = AdamConfig::new().init::<B, UNet<B>>();
    let (mut model, mut optim, resumed) = ctx.store.load_best::<B, _, _>(fold, model, optim, device)?;

    let (start_epoch, mut early, mut best_iou_3d) = match resumed {
        Some(meta) => (
            meta.epoch,
            EarlyStopping::resume(cfg.max_epochs_no_improve, cfg.improvement, meta.valid_loss_min),
            meta.valid_iou_3d,
        ),
        None => {
            tracing::info!("Fold {}: no checkpoint found, starting fresh", fold);
            (0, EarlyStopping::new(cfg.max_epochs_no_improve, cfg.improvement), f64::NAN)
        }
    };

    // ── Epoch loop ────────────────────────────────────────────────────────────
    let mut stop = StopReason::BudgetExhausted { last_epoch: start_epoch };

    for epoch in start_epoch + 1..=start_epoch + cfg.num_epochs {
        train_dataset.reset_counters(epoch);

        let (trained, train_scores) = train_epoch(model, &mut optim, train_loader.as_ref(), cfg.learning_rate);
        model = trained;

        // model.valid() → UNet<B::InnerBackend>, batch norm uses running stats
        let valid_scores = valid_epoch(&model.valid(), valid_loader.as_ref(), cfg.valid_slice_batch);

        let previous_best = early.best_loss();
        let valid         = valid_scores.summary();
        let improved      = early.observe(valid.loss.mean);

        let metrics = EpochMetrics { fold, epoch, train: train_scores.summary(), valid, improved };
        println!("{metrics}");
        ctx.logger.log(&metrics)?;

        if improved {
            println!(
                "Validation loss decreased ({:.6} --> {:.6}).  Saving model ...",
                previous_best,
                metrics.valid_loss()
            );
            best_iou_3d = metrics.valid_iou_3d();
            let meta = CheckpointMeta {
                fold,
                epoch,
                valid_loss_min: early.best_loss(),
                valid_iou_3d:   best_iou_3d,
            };
            ctx.store.save::<B, _, _>(&model, &optim, &meta)?;
        } else {
            tracing::info!(
                "Fold {}: no improvement for {} epoch(s) (best {:.6})",
                fold,
                early.epochs_without_improvement(),
                early.best_loss()
            );
        }

        let counters = train_dataset.counters();
        tracing::debug!(
            "Fold {} epoch {}: {} volumes served, {} slices kept, {} blank slices dropped",
            fold,
            counters.epoch,
            counters.volumes_served,
            counters.slices_kept,
            counters.blank_slices_dropped
        );

        stop = StopReason::BudgetExhausted { last_epoch: epoch };
        if early.should_stop() {
            stop = StopReason::EarlyStopped { epoch };
            break;
        }
    }

    println!(
        "Fold {}: {} | min valid loss {:.6}, valid 3D IoU at best {:.6}",
        fold,
        stop,
        early.best_loss(),
        best_iou_3d
    );

    Ok(FoldOutcome { fold, stop, best_loss: early.best_loss(), best_iou_3d })
}

fn train_epoch<B, O>(
    mut model: UNet<B>,
    optim:     &mut O,
    loader:    &dyn DataLoader<SliceBatch<B>>,
    lr:        f64,
) -> (UNet<B>, ScoreTracker)
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let mut scores = ScoreTracker::new();

    for batch in loader.iter() {
        if batch.slices() == 0 {
            tracing::warn!("Skipping training batch with no slices");
            continue;
        }

        let pred = model.forward(batch.images);
        let loss = dice_loss(pred.clone(), batch.labels.clone());

        let detached = pred.detach();
        scores.push(
            scalar(loss.clone()),
            scalar(soft_iou(detached.clone(), batch.labels.clone())),
            scalar(threshold_iou(detached, batch.labels, THRESHOLD)),
        );

        // Backward pass + Adam update
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(lr, model, grads);
    }

    if scores.batches() == 0 {
        tracing::warn!("Training epoch produced no batches");
    }
    (model, scores)
}

fn valid_epoch<B: Backend>(
    model:       &UNet<B>,
    loader:      &dyn DataLoader<VolumeBatch<B>>,
    slice_batch: usize,
) -> ScoreTracker {
    let mut scores = ScoreTracker::new();

    for batch in loader.iter() {
        if batch.image.dims()[0] == 0 {
            tracing::warn!("Skipping validation volume '{}' with no slices", batch.name);
            continue;
        }

        let pred = infer_by_slices(batch.image, slice_batch, |x| model.forward(x));
        scores.push(
            scalar(dice_loss(pred.clone(), batch.label.clone())),
            scalar(soft_iou(pred.clone(), batch.label.clone())),
            scalar(threshold_iou(pred.clone(), batch.label.clone(), THRESHOLD)),
        );
        scores.push_iou_3d(scalar(iou_3d(pred, batch.label, THRESHOLD)));
    }

    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::VolumePair;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::Array3;

    type TestBackend = Autodiff<NdArray>;

    /// Synthetic volumes: a bright square in the image, the same
    /// square in the label.
    struct SquareSource;

    impl VolumeSource for SquareSource {
        fn load_pair(&self, _files: &VolumePairFiles) -> Result<VolumePair> {
            let mut image = Array3::<f32>::from_elem((8, 8, 3), -1024.0);
            let mut label = Array3::<f32>::zeros((8, 8, 3));
            for i in 2..6 {
                for j in 2..6 {
                    for k in 0..3 {
                        image[[i, j, k]] = 500.0;
                        label[[i, j, k]] = 1.0;
                    }
                }
            }
            VolumePair::new(image, label).context("shapes")
        }
    }

    fn tiny_config(dir: &std::path::Path, num_epochs: usize, patience: usize) -> TrainConfig {
        TrainConfig {
            checkpoint_dir:        dir.display().to_string(),
            base_channels:         2,
            unet_depth:            1,
            batch_size:            2,
            valid_slice_batch:     2,
            num_epochs,
            max_epochs_no_improve: patience,
            ..TrainConfig::default()
        }
    }

    fn files(n: usize) -> Vec<VolumePairFiles> {
        (0..n).map(|i| VolumePairFiles::new(format!("img{i}.nii"), format!("lbl{i}.nii"))).collect()
    }

    fn run(cfg: &TrainConfig, dir: &std::path::Path) -> FoldOutcome {
        let store  = CheckpointStore::new(dir).unwrap();
        let logger = MetricsLogger::new(dir).unwrap();
        let files  = files(3);
        let ctx = FoldContext {
            cfg,
            files:  &files,
            source: Arc::new(SquareSource),
            store:  &store,
            logger: &logger,
        };
        let split = FoldSplit { fold: 1, train: vec![0, 1], dev: vec![2] };
        run_fold::<TestBackend>(&ctx, &split, &Default::default()).unwrap()
    }

    #[test]
    fn test_fold_runs_budget_and_saves_best() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config(dir.path(), 2, 5);
        let outcome = run(&cfg, dir.path());

        assert_eq!(outcome.stop, StopReason::BudgetExhausted { last_epoch: 2 });
        assert!(outcome.best_loss.is_finite());
        assert!(dir.path().join("bestmodel_fold1.json").exists());

        let csv = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }

    #[test]
    fn test_fold_stops_early_without_saving_unimproved_epochs() {
        let dir = tempfile::tempdir().unwrap();
        run(&tiny_config(dir.path(), 1, 0), dir.path());

        // Dice loss never goes below zero, so no later epoch can beat this.
        let meta_path = dir.path().join("bestmodel_fold1.json");
        let mut meta: CheckpointMeta =
            serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
        meta.valid_loss_min = -1.0;
        std::fs::write(&meta_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let outcome = run(&tiny_config(dir.path(), 5, 0), dir.path());

        assert_eq!(outcome.stop, StopReason::EarlyStopped { epoch: 2 });
        assert_eq!(outcome.best_loss, -1.0);
        assert!(dir.path().join("fold1_epoch1.json").exists());
        assert!(!dir.path().join("fold1_epoch2.json").exists());

        let csv = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }

    #[test]
    fn test_resume_continues_after_saved_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config(dir.path(), 1, 5);
        run(&cfg, dir.path());

        let outcome = run(&cfg, dir.path());
        match outcome.stop {
            StopReason::BudgetExhausted { last_epoch } => assert_eq!(last_epoch, 2),
            other => panic!("unexpected stop: {other}"),
        }
    }
}
