//! # Training Configuration
//!
//! Loop-level settings: batching, windowing, gate intervals, gradient
//! clipping and early stopping. Model hyperparameters live with the model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, YomiteError};

/// What to do with token-axis columns left over after the last full window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaggedWindowPolicy {
    /// Refuse to build a mask unless the window size divides the axis.
    #[default]
    Reject,
    /// Leave the trailing columns at zero in every row.
    Truncate,
    /// Fold the trailing columns into the final window.
    Merge,
}

impl fmt::Display for RaggedWindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaggedWindowPolicy::Reject => "reject",
            RaggedWindowPolicy::Truncate => "truncate",
            RaggedWindowPolicy::Merge => "merge",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RaggedWindowPolicy {
    type Err = YomiteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(RaggedWindowPolicy::Reject),
            "truncate" => Ok(RaggedWindowPolicy::Truncate),
            "merge" => Ok(RaggedWindowPolicy::Merge),
            other => Err(YomiteError::InvalidConfig(format!(
                "unknown ragged window policy {other:?} (expected reject, truncate or merge)"
            ))),
        }
    }
}

/// Settings for the batch iterator and the train/evaluate/checkpoint loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Samples per training batch.
    pub batch_size: usize,
    /// Passes over the training split.
    pub num_epochs: usize,
    /// CBOW window size for the training split.
    pub window_size: usize,
    /// CBOW window size for the validation split.
    pub validation_window_size: usize,
    /// How to treat a window size that does not divide the token axis.
    pub ragged_policy: RaggedWindowPolicy,
    /// Evaluate on the validation split every this many steps.
    pub evaluate_every: u64,
    /// Save a checkpoint every this many steps.
    pub checkpoint_every: u64,
    /// Per-tensor gradient norm ceiling.
    pub clip_norm: f64,
    /// Reshuffle the training split at the start of every epoch.
    pub shuffle: bool,
    /// Seed for the shuffle RNG. `None` derives one from the clock.
    pub seed: Option<u64>,
    /// Minimum steps before early stopping may trigger. `None` disables it.
    pub patience: Option<u64>,
    /// Consecutive non-improving evaluations that end the run.
    pub patience_increase: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_epochs: 20,
            window_size: 27,
            validation_window_size: 26,
            ragged_policy: RaggedWindowPolicy::Reject,
            evaluate_every: 100,
            checkpoint_every: 500,
            clip_norm: 10.0,
            shuffle: true,
            seed: None,
            patience: None,
            patience_increase: 6,
        }
    }
}

impl TrainingConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of epochs.
    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the training and validation window sizes.
    pub fn with_window_sizes(mut self, train: usize, validation: usize) -> Self {
        self.window_size = train;
        self.validation_window_size = validation;
        self
    }

    /// Set the ragged window policy.
    pub fn with_ragged_policy(mut self, policy: RaggedWindowPolicy) -> Self {
        self.ragged_policy = policy;
        self
    }

    /// Set the evaluate and checkpoint intervals.
    pub fn with_intervals(mut self, evaluate_every: u64, checkpoint_every: u64) -> Self {
        self.evaluate_every = evaluate_every;
        self.checkpoint_every = checkpoint_every;
        self
    }

    /// Set the per-tensor gradient clip norm.
    pub fn with_clip_norm(mut self, clip_norm: f64) -> Self {
        self.clip_norm = clip_norm;
        self
    }

    /// Enable or disable per-epoch shuffling.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Fix the shuffle seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enable patience-based early stopping.
    pub fn with_early_stopping(mut self, patience: u64, patience_increase: usize) -> Self {
        self.patience = Some(patience);
        self.patience_increase = patience_increase;
        self
    }

    /// Check that every setting is usable before any data is touched.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(YomiteError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.num_epochs == 0 {
            return Err(YomiteError::InvalidConfig("num_epochs must be positive".into()));
        }
        if self.window_size == 0 || self.validation_window_size == 0 {
            return Err(YomiteError::InvalidConfig("window sizes must be positive".into()));
        }
        if self.evaluate_every == 0 || self.checkpoint_every == 0 {
            return Err(YomiteError::InvalidConfig(
                "evaluate_every and checkpoint_every must be positive".into(),
            ));
        }
        if !(self.clip_norm.is_finite() && self.clip_norm > 0.0) {
            return Err(YomiteError::InvalidConfig(format!(
                "clip_norm must be a positive finite number, got {}",
                self.clip_norm
            )));
        }
        if self.patience.is_some() && self.patience_increase == 0 {
            return Err(YomiteError::InvalidConfig(
                "patience_increase must be positive when early stopping is enabled".into(),
            ));
        }
        Ok(())
    }
}
