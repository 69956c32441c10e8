//! # Yomite Trainer
//!
//! The CBOW Stanford Reader built on candle-nn, safetensors checkpoints,
//! and the wiring that turns a data directory into a finished training run.

pub mod checkpoint;
pub mod model;
pub mod trainer;

pub use checkpoint::VarMapCheckpointer;
pub use model::{ReaderConfig, StanfordReader};
pub use trainer::{run_training, select_device, Placement, RunDirectory, RunOptions};
