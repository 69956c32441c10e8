//! Train the CBOW Stanford Reader on a pre-indexed dataset.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yomite_core::{RaggedWindowPolicy, StopReason, TrainingConfig};
use yomite_trainer::{run_training, Placement, ReaderConfig, RunOptions};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Train a CBOW Stanford Reader for cloze-style reading comprehension")]
#[command(version)]
struct Args {
    /// Directory with x_{train,val}_{d,q}, y_{train,val}[_choices] and vocab.json
    #[arg(long, env = "YOMITE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Runs are written under <output-root>/runs/<timestamp>
    #[arg(long, env = "YOMITE_OUTPUT_ROOT", default_value = ".")]
    output_root: PathBuf,

    /// Answer identifier to entity slot map
    #[arg(long, env = "YOMITE_ANSWER_INDEX", default_value = "config/answer_index.json")]
    answer_index: PathBuf,

    /// Dropout keep probability
    #[arg(long, env = "YOMITE_DROPOUT_KEEP_PROB", default_value_t = 0.5)]
    dropout_keep_prob: f32,

    /// Width of the hidden layer
    #[arg(long, env = "YOMITE_HIDDEN_UNITS", default_value_t = 16)]
    hidden_units: usize,

    #[arg(long, env = "YOMITE_EMBEDDING_DIM", default_value_t = 100)]
    embedding_dim: usize,

    /// Entity slots; must equal the answer index's max_entities
    #[arg(long, env = "YOMITE_MAX_ENTITIES", default_value_t = 5)]
    max_entities: usize,

    #[arg(long, env = "YOMITE_LEARNING_RATE", default_value_t = 0.1)]
    learning_rate: f64,

    /// L2 regularization weight
    #[arg(long, env = "YOMITE_L2_REG_LAMBDA", default_value_t = 0.0)]
    l2_reg_lambda: f64,

    #[arg(long, env = "YOMITE_BATCH_SIZE", default_value_t = 32)]
    batch_size: usize,

    #[arg(long, env = "YOMITE_NUM_EPOCHS", default_value_t = 20)]
    num_epochs: usize,

    /// CBOW window size for training batches
    #[arg(long, env = "YOMITE_WINDOW_SIZE", default_value_t = 27)]
    window_size: usize,

    /// CBOW window size for the validation split
    #[arg(long, env = "YOMITE_VALIDATION_WINDOW_SIZE", default_value_t = 26)]
    validation_window_size: usize,

    /// How to treat a window size that does not divide the document length
    #[arg(long, env = "YOMITE_RAGGED_POLICY", default_value_t = RaggedWindowPolicy::Reject)]
    ragged_policy: RaggedWindowPolicy,

    /// Documents are cut to this many tokens
    #[arg(long, env = "YOMITE_MAX_DOCUMENT_LENGTH", default_value_t = 2943)]
    max_document_length: usize,

    /// Evaluate on the validation split after this many steps
    #[arg(long, env = "YOMITE_EVALUATE_EVERY", default_value_t = 100)]
    evaluate_every: u64,

    /// Save a checkpoint after this many steps
    #[arg(long, env = "YOMITE_CHECKPOINT_EVERY", default_value_t = 500)]
    checkpoint_every: u64,

    /// Per-tensor gradient norm limit
    #[arg(long, env = "YOMITE_CLIP_NORM", default_value_t = 10.0)]
    clip_norm: f64,

    /// Shuffle seed; taken from the clock when absent
    #[arg(long, env = "YOMITE_SEED")]
    seed: Option<u64>,

    /// Keep only the first N samples of each split
    #[arg(long, env = "YOMITE_LIMIT_SAMPLES")]
    limit_samples: Option<usize>,

    /// Stop when validation loss has not improved for this many evaluations
    /// once the step count reaches the patience
    #[arg(long, env = "YOMITE_PATIENCE")]
    patience: Option<u64>,

    #[arg(long, env = "YOMITE_PATIENCE_INCREASE", default_value_t = 6)]
    patience_increase: usize,

    /// Train on a CUDA device
    #[arg(long, env = "YOMITE_CUDA")]
    cuda: bool,

    #[arg(long, env = "YOMITE_CUDA_ORDINAL", default_value_t = 0)]
    cuda_ordinal: usize,

    /// Fall back to the CPU when the CUDA device is unavailable
    #[arg(long, env = "YOMITE_ALLOW_SOFT_PLACEMENT", default_value_t = true, action = ArgAction::Set)]
    allow_soft_placement: bool,

    /// Log the device the run is placed on
    #[arg(long, env = "YOMITE_LOG_DEVICE_PLACEMENT", default_value_t = false, action = ArgAction::Set)]
    log_device_placement: bool,
}

impl Args {
    fn parameters(&self) -> BTreeMap<&'static str, String> {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map_or_else(|| "None".to_string(), T::to_string)
        }

        BTreeMap::from([
            ("ALLOW_SOFT_PLACEMENT", self.allow_soft_placement.to_string()),
            ("ANSWER_INDEX", self.answer_index.display().to_string()),
            ("BATCH_SIZE", self.batch_size.to_string()),
            ("CHECKPOINT_EVERY", self.checkpoint_every.to_string()),
            ("CLIP_NORM", self.clip_norm.to_string()),
            ("CUDA", self.cuda.to_string()),
            ("CUDA_ORDINAL", self.cuda_ordinal.to_string()),
            ("DATA_DIR", self.data_dir.display().to_string()),
            ("DROPOUT_KEEP_PROB", self.dropout_keep_prob.to_string()),
            ("EMBEDDING_DIM", self.embedding_dim.to_string()),
            ("EVALUATE_EVERY", self.evaluate_every.to_string()),
            ("HIDDEN_UNITS", self.hidden_units.to_string()),
            ("L2_REG_LAMBDA", self.l2_reg_lambda.to_string()),
            ("LEARNING_RATE", self.learning_rate.to_string()),
            ("LIMIT_SAMPLES", opt(&self.limit_samples)),
            ("LOG_DEVICE_PLACEMENT", self.log_device_placement.to_string()),
            ("MAX_DOCUMENT_LENGTH", self.max_document_length.to_string()),
            ("MAX_ENTITIES", self.max_entities.to_string()),
            ("NUM_EPOCHS", self.num_epochs.to_string()),
            ("OUTPUT_ROOT", self.output_root.display().to_string()),
            ("PATIENCE", opt(&self.patience)),
            ("PATIENCE_INCREASE", self.patience_increase.to_string()),
            ("RAGGED_POLICY", self.ragged_policy.to_string()),
            ("SEED", opt(&self.seed)),
            ("VALIDATION_WINDOW_SIZE", self.validation_window_size.to_string()),
            ("WINDOW_SIZE", self.window_size.to_string()),
        ])
    }

    fn into_options(self) -> RunOptions {
        let mut training = TrainingConfig::new()
            .with_batch_size(self.batch_size)
            .with_num_epochs(self.num_epochs)
            .with_window_sizes(self.window_size, self.validation_window_size)
            .with_ragged_policy(self.ragged_policy)
            .with_intervals(self.evaluate_every, self.checkpoint_every)
            .with_clip_norm(self.clip_norm);
        if let Some(seed) = self.seed {
            training = training.with_seed(seed);
        }
        if let Some(patience) = self.patience {
            training = training.with_early_stopping(patience, self.patience_increase);
        }

        RunOptions {
            data_dir: self.data_dir,
            output_root: self.output_root,
            answer_index: self.answer_index,
            max_document_length: self.max_document_length,
            limit_samples: self.limit_samples,
            learning_rate: self.learning_rate,
            training,
            reader: ReaderConfig {
                vocab_size: 0,
                embedding_dim: self.embedding_dim,
                hidden_units: self.hidden_units,
                max_entities: self.max_entities,
                dropout_keep_prob: self.dropout_keep_prob,
                l2_reg_lambda: self.l2_reg_lambda,
            },
            placement: Placement {
                cuda: self.cuda,
                cuda_ordinal: self.cuda_ordinal,
                allow_soft_placement: self.allow_soft_placement,
                log_device_placement: self.log_device_placement,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Parameters:");
    for (name, value) in args.parameters() {
        info!("{}={}", name, value);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let listener = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            listener.store(true, Ordering::Relaxed);
        }
    });

    let options = args.into_options();
    let report = tokio::task::spawn_blocking(move || run_training(options, stop))
        .await
        .context("Training task panicked")??;

    if report.stop_reason == StopReason::Interrupted {
        info!("Interrupted at step {}", report.state.global_step);
    }
    Ok(())
}
