// ============================================================
// Layer 3 — Fold Domain Types
// ============================================================
// Everything the fold orchestrator decides on, without any
// tensors involved:
//
//   FoldSplit       — train/dev index sets of one fold
//   ImprovementRule — what counts as "validation loss improved"
//   EarlyStopping   — the per-fold patience state machine
//   FoldOutcome     — how a fold ended and its best scores
//   CrossValidationSummary — mean ± std of the best 3D IoU
//
// The per-fold state machine:
//
//   INIT ──► EPOCH ──► improved?  ── yes ─► save, counter = 0 ──┐
//              ▲                  └─ no ──► counter += 1 ───────┤
//              │                                                ▼
//              └──────────── counter <= patience ◄──── check ───┘
//                                                        │
//                               counter > patience ──────► STOP
//
// Reference: Rust Book §6 (Enums), §5 (Structs)

use serde::{Deserialize, Serialize};

/// Train/dev partition of the file index set for one fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSplit {
    /// 1-based fold number, used in checkpoint names
    pub fold:  usize,
    pub train: Vec<usize>,
    pub dev:   Vec<usize>,
}

/// Comparison used to decide whether an epoch improved on the best
/// validation loss seen so far in the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementRule {
    /// `loss <= best`: an equal loss counts as an improvement, resets
    /// patience and re-saves the checkpoint.
    #[default]
    AllowTies,
    /// `loss < best`
    Strict,
}

impl ImprovementRule {
    pub fn improves(self, loss: f64, best: f64) -> bool {
        match self {
            ImprovementRule::AllowTies => loss <= best,
            ImprovementRule::Strict    => loss < best,
        }
    }
}

/// Patience counter and best loss of one fold.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    rule:           ImprovementRule,
    max_no_improve: usize,
    best_loss:      f64,
    no_improve:     usize,
}

impl EarlyStopping {
    /// Fresh tracker: no loss observed yet, so the first finite loss
    /// always improves.
    pub fn new(max_no_improve: usize, rule: ImprovementRule) -> Self {
        Self::resume(max_no_improve, rule, f64::INFINITY)
    }

    /// Tracker for a fold resumed from a checkpoint with `best_loss`.
    pub fn resume(max_no_improve: usize, rule: ImprovementRule, best_loss: f64) -> Self {
        Self { rule, max_no_improve, best_loss, no_improve: 0 }
    }

    /// Feed one epoch's mean validation loss. Returns true when the
    /// epoch improved (caller saves a checkpoint).
    pub fn observe(&mut self, loss: f64) -> bool {
        if self.rule.improves(loss, self.best_loss) {
            self.best_loss  = loss;
            self.no_improve = 0;
            true
        } else {
            self.no_improve += 1;
            false
        }
    }

    /// True once the no-improve counter has exceeded the patience.
    pub fn should_stop(&self) -> bool {
        self.no_improve > self.max_no_improve
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.no_improve
    }
}

/// Why a fold stopped training. Both are normal terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Patience exceeded after this 1-based epoch
    EarlyStopped { epoch: usize },
    /// All configured epochs ran; `last_epoch` is 1-based
    BudgetExhausted { last_epoch: usize },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EarlyStopped { epoch } => {
                write!(f, "early stopped at epoch {epoch}")
            }
            StopReason::BudgetExhausted { last_epoch } => {
                write!(f, "epoch budget exhausted at epoch {last_epoch}")
            }
        }
    }
}

/// Result of one fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldOutcome {
    pub fold:          usize,
    pub stop:          StopReason,
    /// Lowest mean validation loss seen (infinite if no epoch ran)
    pub best_loss:     f64,
    /// Mean validation 3D IoU of the epoch that produced `best_loss`
    pub best_iou_3d:   f64,
}

/// Headline result over all folds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossValidationSummary {
    pub folds:       usize,
    pub mean_iou_3d: f64,
    pub std_iou_3d:  f64,
}

impl CrossValidationSummary {
    /// Mean and population standard deviation of each fold's best 3D IoU.
    pub fn from_outcomes(outcomes: &[FoldOutcome]) -> Self {
        let scores: Vec<f64> = outcomes.iter().map(|o| o.best_iou_3d).collect();
        let n = scores.len();
        if n == 0 {
            return Self { folds: 0, mean_iou_3d: f64::NAN, std_iou_3d: f64::NAN };
        }
        let mean = scores.iter().sum::<f64>() / n as f64;
        let var  = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        Self { folds: n, mean_iou_3d: mean, std_iou_3d: var.sqrt() }
    }
}
