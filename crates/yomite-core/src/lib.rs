//! # Yomite Core
//!
//! Data pipeline and loop control for training a CBOW-windowed Stanford
//! Reader: window masks, epoch/batch iteration over pre-indexed splits,
//! answer-slot remapping, gradient-clipped training steps and the
//! train/evaluate/checkpoint driver. The model is any [`ReaderModel`].
//!
//! ## Quick Start
//!
//! ```rust
//! use yomite_core::{RaggedWindowPolicy, WindowMask};
//!
//! let mask = WindowMask::build(2943, 27, RaggedWindowPolicy::Reject).unwrap();
//! assert_eq!(mask.num_windows(), 109);
//! assert!(WindowMask::build(2184, 27, RaggedWindowPolicy::Reject).is_err());
//! ```
pub mod answer;
pub mod config;
pub mod data;
pub mod error;
pub mod step;
pub mod summary;
pub mod training;
pub mod window;

// Re-export primary API
pub use answer::AnswerIndex;
pub use config::{RaggedWindowPolicy, TrainingConfig};
pub use data::{Batch, BatchIterator, DatasetSplit, Vocabulary};
pub use error::{Result, YomiteError};
pub use step::{
    candidate_counts, clip_by_norm, LoopState, ReaderFeed, ReaderModel, ReaderOutputs,
    StepMode, StepReport, StepRunner,
};
pub use summary::{CheckpointSink, Histogram, JsonlSummaryWriter, Summary, SummarySink};
pub use training::{
    gate_fires, LoopPhase, StopReason, TrainingLoop, TrainingReport, ValidationResult,
};
pub use window::{BatchMask, WindowMask};
