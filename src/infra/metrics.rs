// ============================================================
// Layer 6 — Metrics
// ============================================================
// Per-epoch aggregation of batch scores and the CSV log.
//
// Every train batch and every validation volume contributes one
// value per metric to a ScoreTracker. At the end of the epoch the
// tracker is reduced to mean ± std (population std, divide by n).
//
// Metrics recorded per epoch and phase:
//   - loss:      soft Dice loss
//   - iou:       soft IoU, mean over slices
//   - thr_iou:   IoU after thresholding at 0.5, mean over slices
//   - iou_3d:    volumetric IoU (validation only)
//
// Output file: <checkpoint dir>/metrics.csv, one row per epoch of
// every fold:
//
//   fold,epoch,train_loss_mean,train_loss_std,...,improved
//   1,1,0.612300,0.041000,...,true
//
// The file is appended to, so a resumed run continues the same log.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

const CSV_HEADER: &str = "fold,epoch,\
train_loss_mean,train_loss_std,train_iou_mean,train_iou_std,train_thr_iou_mean,train_thr_iou_std,\
valid_loss_mean,valid_loss_std,valid_iou_mean,valid_iou_std,valid_thr_iou_mean,valid_thr_iou_std,\
valid_iou_3d_mean,valid_iou_3d_std,improved";

/// Mean and population standard deviation of a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: f64,
    pub std:  f64,
}

impl MeanStd {
    /// NaN for both when `samples` is empty.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self { mean: f64::NAN, std: f64::NAN };
        }
        let n    = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var  = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self { mean, std: var.sqrt() }
    }
}

impl fmt::Display for MeanStd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ± {:.4}", self.mean, self.std)
    }
}

/// Accumulates per-batch scores for one phase of one epoch.
#[derive(Debug, Clone, Default)]
pub struct ScoreTracker {
    loss:          Vec<f64>,
    iou:           Vec<f64>,
    threshold_iou: Vec<f64>,
    iou_3d:        Vec<f64>,
}

impl ScoreTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: f64, iou: f64, threshold_iou: f64) {
        self.loss.push(loss);
        self.iou.push(iou);
        self.threshold_iou.push(threshold_iou);
    }

    pub fn push_iou_3d(&mut self, iou_3d: f64) {
        self.iou_3d.push(iou_3d);
    }

    pub fn batches(&self) -> usize {
        self.loss.len()
    }

    pub fn summary(&self) -> PhaseScores {
        PhaseScores {
            loss:          MeanStd::from_samples(&self.loss),
            iou:           MeanStd::from_samples(&self.iou),
            threshold_iou: MeanStd::from_samples(&self.threshold_iou),
            iou_3d:        (!self.iou_3d.is_empty()).then(|| MeanStd::from_samples(&self.iou_3d)),
        }
    }
}

/// Reduced scores of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseScores {
    pub loss:          MeanStd,
    pub iou:           MeanStd,
    pub threshold_iou: MeanStd,
    /// Only the validation phase evaluates whole volumes
    pub iou_3d:        Option<MeanStd>,
}

impl fmt::Display for PhaseScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss {} | iou {} | thr_iou {}", self.loss, self.iou, self.threshold_iou)?;
        if let Some(iou_3d) = self.iou_3d {
            write!(f, " | iou_3d {iou_3d}")?;
        }
        Ok(())
    }
}

/// One completed epoch of one fold. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub fold:     usize,
    /// 1-based
    pub epoch:    usize,
    pub train:    PhaseScores,
    pub valid:    PhaseScores,
    pub improved: bool,
}

impl EpochMetrics {
    pub fn valid_loss(&self) -> f64 {
        self.valid.loss.mean
    }

    pub fn valid_iou_3d(&self) -> f64 {
        self.valid.iou_3d.map_or(f64::NAN, |s| s.mean)
    }

    fn csv_row(&self) -> String {
        let iou_3d = self.valid.iou_3d.unwrap_or(MeanStd { mean: f64::NAN, std: f64::NAN });
        let values = [
            self.train.loss, self.train.iou, self.train.threshold_iou,
            self.valid.loss, self.valid.iou, self.valid.threshold_iou,
            iou_3d,
        ];
        let cols: Vec<String> = values
            .iter()
            .map(|m| format!("{:.6},{:.6}", m.mean, m.std))
            .collect();
        format!("{},{},{},{}", self.fold, self.epoch, cols.join(","), self.improved)
    }
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fold {} Epoch {:>3} | train: {} || valid: {}",
            self.fold, self.epoch, self.train, self.valid
        )
    }
}

/// Appends epoch metrics to a CSV file.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the header if the file does not exist yet.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "{CSV_HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;
        writeln!(f, "{}", m.csv_row())?;

        tracing::debug!(
            "Logged fold {} epoch {}: valid_loss={:.4}",
            m.fold,
            m.epoch,
            m.valid_loss()
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
