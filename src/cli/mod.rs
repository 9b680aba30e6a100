// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses command line arguments with `clap` and routes them to
// Layer 2 (application).
//
// Two commands are supported:
//   1. `train`   — k-fold cross-validation of the U-Net
//   2. `segment` — writes masks for new volumes with a trained fold
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, SegmentArgs, TrainArgs};

use crate::application::train_use_case::TrainConfig;

#[derive(Parser, Debug)]
#[command(
    name = "volume-seg-cv",
    version = "0.1.0",
    about = "K-fold cross-validated U-Net segmentation of 3D scan volumes."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)   => run_train(args),
            Commands::Segment(args) => run_segment(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let cfg: TrainConfig = match args.config.clone() {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Cannot read config '{}'", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Invalid config '{}'", path.display()))?
        }
        None => args.into(),
    };

    tracing::info!(
        "Starting {}-fold training on '{}' / '{}'",
        cfg.k_folds,
        cfg.train_dir,
        cfg.labels_dir
    );
    let summary = TrainUseCase::new(cfg).execute()?;

    println!("Training complete over {} fold(s).", summary.folds);
    Ok(())
}

fn run_segment(args: SegmentArgs) -> Result<()> {
    use crate::application::segment_use_case::SegmentUseCase;

    let use_case = SegmentUseCase::new(args.checkpoint_dir, args.fold, args.backend.into());
    let written  = use_case.execute(&args.input_dir, &args.output_dir)?;

    println!("Wrote {} mask(s) to '{}'", written.len(), args.output_dir.display());
    Ok(())
}
