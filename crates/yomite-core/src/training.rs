//! # Training Loop
//!
//! Draws batches from the training split, runs a training step on each and
//! checks two independent gates against the global step afterwards:
//! evaluate on the whole validation split every `evaluate_every` steps and
//! save a checkpoint every `checkpoint_every` steps. The loop ends when the
//! batch iterator is exhausted, unless early stopping or the stop flag ends
//! it first.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::Device;
use candle_nn::Optimizer;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data::{BatchIterator, DatasetSplit};
use crate::error::Result;
use crate::step::{LoopState, ReaderModel, StepMode, StepReport, StepRunner};
use crate::summary::{CheckpointSink, SummarySink};
use crate::window::{BatchMask, WindowMask};

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    Running,
    Evaluating,
    Checkpointing,
    Completed,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopPhase::Initializing => "initializing",
            LoopPhase::Running => "running",
            LoopPhase::Evaluating => "evaluating",
            LoopPhase::Checkpointing => "checkpointing",
            LoopPhase::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every batch of every epoch was consumed.
    Exhausted,
    /// Validation loss stopped improving.
    EarlyStopped,
    /// The stop flag was raised.
    Interrupted,
}

/// Loss and accuracy on the validation split at a given step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationResult {
    pub step: u64,
    pub loss: f64,
    pub accuracy: f64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub state: LoopState,
    pub batches_seen: usize,
    pub evaluations: usize,
    pub checkpoints: usize,
    pub last_validation: Option<ValidationResult>,
    pub stop_reason: StopReason,
}

/// Whether a periodic gate fires at `step`.
pub fn gate_fires(step: u64, every: u64) -> bool {
    every != 0 && step % every == 0
}

/// Ends the run after `patience_increase` consecutive evaluations whose
/// loss did not drop, once `patience` steps have passed.
#[derive(Debug, Clone)]
struct EarlyStopping {
    patience: u64,
    patience_increase: usize,
    previous_loss: Option<f64>,
    strikes: usize,
}

impl EarlyStopping {
    fn new(patience: u64, patience_increase: usize) -> Self {
        Self {
            patience,
            patience_increase,
            previous_loss: None,
            strikes: 0,
        }
    }

    fn observe(&mut self, step: u64, loss: f64) -> bool {
        match self.previous_loss {
            Some(previous) if loss >= previous => self.strikes += 1,
            _ => self.strikes = 0,
        }
        self.previous_loss = Some(loss);
        step >= self.patience && self.strikes >= self.patience_increase
    }
}

/// The train/evaluate/checkpoint driver.
pub struct TrainingLoop<'a, M, O> {
    config: TrainingConfig,
    runner: StepRunner<M, O>,
    train: &'a DatasetSplit,
    validation: &'a DatasetSplit,
    train_mask: BatchMask,
    validation_mask: BatchMask,
    seed: u64,
    phase: LoopPhase,
    early_stopping: Option<EarlyStopping>,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl<'a, M: ReaderModel, O: Optimizer> TrainingLoop<'a, M, O> {
    /// Prepare a run: validate the configuration, check every answer id of
    /// both splits against the runner's answer index and build both window
    /// masks.
    pub fn new(
        config: TrainingConfig,
        runner: StepRunner<M, O>,
        train: &'a DatasetSplit,
        validation: &'a DatasetSplit,
        device: &Device,
    ) -> Result<Self> {
        debug!("Loop phase: {}", LoopPhase::Initializing);
        config.validate()?;

        runner.answer_index().validate_split(train)?;
        runner.answer_index().validate_split(validation)?;

        let train_window = WindowMask::build(
            train.token_axis_length(),
            config.window_size,
            config.ragged_policy,
        )?;
        let validation_window = WindowMask::build(
            validation.token_axis_length(),
            config.validation_window_size,
            config.ragged_policy,
        )?;
        info!(
            "Window masks: train {}x{}, validation {}x{}",
            train_window.num_windows(),
            train_window.token_axis_length(),
            validation_window.num_windows(),
            validation_window.token_axis_length()
        );

        let train_mask = BatchMask::new(&train_window, config.batch_size, device)?;
        let validation_mask = BatchMask::new(&validation_window, validation.len(), device)?;

        let seed = config.seed.unwrap_or_else(seed_from_clock);
        if config.shuffle {
            info!("Shuffle seed: {}", seed);
        }

        let early_stopping = config
            .patience
            .map(|patience| EarlyStopping::new(patience, config.patience_increase));

        Ok(Self {
            config,
            runner,
            train,
            validation,
            train_mask,
            validation_mask,
            seed,
            phase: LoopPhase::Initializing,
            early_stopping,
            stop_flag: None,
        })
    }

    /// Check `flag` between batches and stop when it is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn runner(&self) -> &StepRunner<M, O> {
        &self.runner
    }

    fn transition(&mut self, phase: LoopPhase) {
        debug!("Loop phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Run the validation split through the model as a single batch.
    pub fn evaluate(&mut self, state: &mut LoopState) -> Result<StepReport> {
        let batch = self.validation.as_batch();
        let report = self
            .runner
            .run_step(state, &batch, &self.validation_mask, StepMode::Evaluate)?;
        info!(
            "Evaluation: step {}, loss {:.6}, acc {:.6}",
            report.step, report.loss, report.accuracy
        );
        Ok(report)
    }

    /// Train until the batches run out, writing summaries to the sinks.
    /// The loop is `Completed` afterwards, including when a step fails.
    pub fn run(
        &mut self,
        train_sink: &mut dyn SummarySink,
        dev_sink: &mut dyn SummarySink,
        checkpoints: &mut dyn CheckpointSink,
    ) -> Result<TrainingReport> {
        let result = self.run_batches(train_sink, dev_sink, checkpoints);
        self.transition(LoopPhase::Completed);
        result
    }

    fn run_batches(
        &mut self,
        train_sink: &mut dyn SummarySink,
        dev_sink: &mut dyn SummarySink,
        checkpoints: &mut dyn CheckpointSink,
    ) -> Result<TrainingReport> {
        let mut state = LoopState::new();
        let mut batches_seen = 0usize;
        let mut evaluations = 0usize;
        let mut saved = 0usize;
        let mut last_validation = None;
        let mut stop_reason = StopReason::Exhausted;

        let mut batches = BatchIterator::new(
            self.train,
            self.config.batch_size,
            self.config.num_epochs,
            self.config.shuffle,
            self.seed,
        )?;
        info!(
            "Training for {} epochs, {} batches per epoch",
            self.config.num_epochs,
            batches.batches_per_epoch()
        );

        self.transition(LoopPhase::Running);
        loop {
            if self.stop_requested() {
                info!("Stop requested after step {}", state.global_step);
                stop_reason = StopReason::Interrupted;
                break;
            }
            let Some(batch) = batches.next() else {
                break;
            };

            let batch = batch?;
            let report =
                self.runner
                    .run_step(&mut state, &batch, &self.train_mask, StepMode::Train)?;
            batches_seen += 1;
            info!(
                "step {}, loss {:.6}, acc {:.6}",
                report.step, report.loss, report.accuracy
            );
            warn_on_failure("train summary", train_sink.write(report.step, &report.summary));

            let step = state.global_step;
            let mut early_stop = false;

            if gate_fires(step, self.config.evaluate_every) {
                self.transition(LoopPhase::Evaluating);
                let eval = self.evaluate(&mut state)?;
                warn_on_failure("dev summary", dev_sink.write(step, &eval.summary));
                evaluations += 1;
                last_validation = Some(ValidationResult {
                    step,
                    loss: eval.loss,
                    accuracy: eval.accuracy,
                });
                if let Some(early) = self.early_stopping.as_mut() {
                    early_stop = early.observe(step, eval.loss);
                }
                self.transition(LoopPhase::Running);
            }

            if gate_fires(step, self.config.checkpoint_every) {
                self.transition(LoopPhase::Checkpointing);
                match checkpoints.save(step) {
                    Ok(path) => {
                        info!("Saved model checkpoint to {}", path.display());
                        saved += 1;
                    }
                    Err(e) => warn!("Checkpoint at step {} failed: {}", step, e),
                }
                self.transition(LoopPhase::Running);
            }

            if early_stop {
                info!("Validation loss stopped improving, stopping at step {}", step);
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        info!("Training finished at step {} ({:?})", state.global_step, stop_reason);

        Ok(TrainingReport {
            state,
            batches_seen,
            evaluations,
            checkpoints: saved,
            last_validation,
            stop_reason,
        })
    }
}

fn warn_on_failure(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Failed to write {}: {}", what, e);
    }
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
}
