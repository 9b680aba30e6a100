// ============================================================
// Layer 6 — Checkpoint Store
// ============================================================
// Saves and restores fold checkpoints using Burn's CompactRecorder.
//
// What gets saved when a fold's validation loss improves:
//   1. Model weights        (<stem>.mpk.gz)
//   2. Optimizer state      (<stem>_optim.mpk.gz)
//   3. Checkpoint metadata  (<stem>.json: fold, epoch, best loss,
//                            3D IoU of that epoch)
//
// The snapshot is written under its epoch stem first, then copied
// to the fold's "best" stem. The best stem is what resume and
// segmentation read; the epoch stems are history.
//
// File naming convention:
//   checkpoints/
//     fold1_epoch3.mpk.gz          ← snapshot of fold 1, epoch 3
//     fold1_epoch3_optim.mpk.gz
//     fold1_epoch3.json
//     bestmodel_fold1.mpk.gz       ← copy of the latest improvement
//     bestmodel_fold1_optim.mpk.gz
//     bestmodel_fold1.json
//     train_config.json            ← model and pipeline config
//     metrics.csv                  (written by MetricsLogger)
//
// A fold without bestmodel_fold<N>.json starts fresh.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::application::train_use_case::TrainConfig;

const CONFIG_FILE: &str = "train_config.json";
/// Extension CompactRecorder appends to every record path
const RECORD_EXT: &str = "mpk.gz";

/// Stored next to every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub fold:           usize,
    /// 1-based epoch that produced the weights
    pub epoch:          usize,
    /// Lowest mean validation loss of the fold so far
    pub valid_loss_min: f64,
    /// Mean validation 3D IoU of `epoch`
    pub valid_iou_3d:   f64,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_stem(fold: usize) -> String {
        format!("bestmodel_fold{fold}")
    }

    pub fn epoch_stem(fold: usize, epoch: usize) -> String {
        format!("fold{fold}_epoch{epoch}")
    }

    fn files(&self, stem: &str) -> [PathBuf; 3] {
        [
            self.dir.join(format!("{stem}.{RECORD_EXT}")),
            self.dir.join(format!("{stem}_optim.{RECORD_EXT}")),
            self.dir.join(format!("{stem}.json")),
        ]
    }

    /// Write the epoch snapshot, then copy it over the fold's best checkpoint.
    pub fn save<B, M, O>(&self, model: &M, optim: &O, meta: &CheckpointMeta) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let stem     = Self::epoch_stem(meta.fold, meta.epoch);
        let recorder = CompactRecorder::new();

        let model_path = self.dir.join(&stem);
        Recorder::<B>::record(&recorder, model.clone().into_record(), model_path.clone())
            .with_context(|| format!("Failed to save model to '{}'", model_path.display()))?;

        let optim_path = self.dir.join(format!("{stem}_optim"));
        Recorder::<B>::record(&recorder, optim.to_record(), optim_path.clone())
            .with_context(|| format!("Failed to save optimizer to '{}'", optim_path.display()))?;

        let [_, _, meta_path] = self.files(&stem);
        fs::write(&meta_path, serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("Cannot write '{}'", meta_path.display()))?;

        for (src, dst) in self.files(&stem).iter().zip(self.files(&Self::best_stem(meta.fold)).iter()) {
            fs::copy(src, dst).with_context(|| {
                format!("Cannot copy '{}' to '{}'", src.display(), dst.display())
            })?;
        }

        tracing::debug!("Saved checkpoint {} and updated {}", stem, Self::best_stem(meta.fold));
        Ok(())
    }

    /// Metadata of the fold's best checkpoint, `None` if the fold has none.
    pub fn best_meta(&self, fold: usize) -> Result<Option<CheckpointMeta>> {
        let [_, _, meta_path] = self.files(&Self::best_stem(fold));
        if !meta_path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&meta_path)
            .with_context(|| format!("Cannot read '{}'", meta_path.display()))?;
        let meta = serde_json::from_str(&json)
            .with_context(|| format!("Corrupt checkpoint metadata '{}'", meta_path.display()))?;
        Ok(Some(meta))
    }

    /// Restore model and optimizer from the fold's best checkpoint.
    /// Returns the inputs unchanged and `None` when there is nothing to resume.
    pub fn load_best<B, M, O>(
        &self,
        fold:   usize,
        model:  M,
        optim:  O,
        device: &B::Device,
    ) -> Result<(M, O, Option<CheckpointMeta>)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let Some(meta) = self.best_meta(fold)? else {
            return Ok((model, optim, None));
        };

        let stem     = Self::best_stem(fold);
        let recorder = CompactRecorder::new();

        let model_path = self.dir.join(&stem);
        let record = Recorder::<B>::load(&recorder, model_path.clone(), device)
            .with_context(|| format!("Cannot load model checkpoint '{}'", model_path.display()))?;
        let model = model.load_record(record);

        let optim_path = self.dir.join(format!("{stem}_optim"));
        let record = Recorder::<B>::load(&recorder, optim_path.clone(), device)
            .with_context(|| format!("Cannot load optimizer checkpoint '{}'", optim_path.display()))?;
        let optim = optim.load_record(record);

        tracing::info!(
            "Fold {}: resuming from epoch {} (best valid loss {:.6})",
            fold,
            meta.epoch,
            meta.valid_loss_min
        );
        Ok((model, optim, Some(meta)))
    }

    /// Load only the weights of the fold's best checkpoint.
    pub fn load_best_model<B: Backend, M: Module<B>>(
        &self,
        fold:   usize,
        model:  M,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.dir.join(Self::best_stem(fold));
        let record = Recorder::<B>::load(&CompactRecorder::new(), path.clone(), device)
            .with_context(|| {
                format!(
                    "Cannot load checkpoint '{}'. Has fold {} been trained?",
                    path.display(),
                    fold
                )
            })?;
        Ok(model.load_record(record))
    }

    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(cfg)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join(CONFIG_FILE);
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' before 'segment'.",
                path.display()
            )
        })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Invalid training config '{}'", path.display()))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::{UNet, UNetConfig};
    use burn::{
        backend::{Autodiff, NdArray},
        optim::AdamConfig,
    };

    type TestBackend = Autodiff<NdArray>;

    fn tiny_model(device: &<TestBackend as Backend>::Device) -> UNet<TestBackend> {
        UNetConfig::new(1, 1).with_base_channels(2).with_depth(1).init(device)
    }

    fn head_weights(model: &UNet<TestBackend>) -> Vec<f32> {
        model.head.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_fresh_fold_has_nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let device = Default::default();
        let optim = AdamConfig::new().init::<TestBackend, UNet<TestBackend>>();

        let (_, _, meta) = store.load_best::<TestBackend, _, _>(3, tiny_model(&device), optim, &device).unwrap();
        assert!(meta.is_none());
    }

    #[test]
    fn test_save_then_resume_restores_weights_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let device = Default::default();

        let model = tiny_model(&device);
        let optim = AdamConfig::new().init::<TestBackend, UNet<TestBackend>>();
        let meta = CheckpointMeta { fold: 2, epoch: 4, valid_loss_min: 0.25, valid_iou_3d: 0.7 };
        store.save::<TestBackend, _, _>(&model, &optim, &meta).unwrap();

        assert!(dir.path().join("fold2_epoch4.json").exists());
        assert!(dir.path().join("bestmodel_fold2.json").exists());

        let fresh = tiny_model(&device);
        let optim = AdamConfig::new().init::<TestBackend, UNet<TestBackend>>();
        let (restored, _, loaded) = store.load_best::<TestBackend, _, _>(2, fresh, optim, &device).unwrap();

        assert_eq!(loaded, Some(meta));
        // Records are stored at half precision.
        for (a, b) in head_weights(&model).iter().zip(head_weights(&restored).iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_later_improvement_replaces_best() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let device = Default::default();
        let model = tiny_model(&device);
        let optim = AdamConfig::new().init::<TestBackend, UNet<TestBackend>>();

        for (epoch, loss) in [(1, 0.5), (3, 0.3)] {
            let meta = CheckpointMeta { fold: 1, epoch, valid_loss_min: loss, valid_iou_3d: 0.5 };
            store.save::<TestBackend, _, _>(&model, &optim, &meta).unwrap();
        }
        let best = store.best_meta(1).unwrap().unwrap();
        assert_eq!(best.epoch, 3);
        assert!(dir.path().join("fold1_epoch1.json").exists());
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let device = Default::default();
        let model: UNet<NdArray> = UNetConfig::new(1, 1).with_base_channels(2).with_depth(1).init(&device);
        assert!(store.load_best_model::<NdArray, _>(1, model, &device).is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let cfg = TrainConfig { k_folds: 3, base_channels: 8, ..TrainConfig::default() };
        store.save_config(&cfg).unwrap();
        let loaded = store.load_config().unwrap();
        assert_eq!(loaded.k_folds, 3);
        assert_eq!(loaded.base_channels, 8);
    }
}
