use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while preparing data for or driving a training run.
#[derive(Debug, Error)]
pub enum YomiteError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A dataset or vocabulary file could not be read.
    #[error("failed to load dataset file {path:?}: {reason}")]
    DatasetLoad {
        /// The file that could not be loaded.
        path: PathBuf,
        /// Why loading failed.
        reason: String,
    },

    /// Parallel arrays or tensors disagree on their shapes.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A gold answer id has no slot in the answer index.
    #[error("unknown answer identifier {id}")]
    UnknownAnswerIdentifier {
        /// The raw entity id that failed to resolve.
        id: u32,
    },

    /// The answer index file is malformed or ambiguous.
    #[error("invalid answer index: {0}")]
    InvalidAnswerIndex(String),

    /// The window size cannot partition the token axis.
    #[error("invalid window: size {window_size} for token axis of length {token_axis_length}")]
    InvalidWindow {
        /// Requested window size.
        window_size: usize,
        /// Length of the token axis.
        token_axis_length: usize,
    },

    /// The window size leaves trailing columns and the policy rejects them.
    #[error(
        "window size {window_size} does not divide token axis length {token_axis_length} \
         ({remainder} trailing columns)"
    )]
    RaggedWindow {
        /// Requested window size.
        window_size: usize,
        /// Length of the token axis.
        token_axis_length: usize,
        /// Columns left over after the last full window.
        remainder: usize,
    },

    /// A summary or checkpoint sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// Candle tensor framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Yomite operations.
pub type Result<T> = std::result::Result<T, YomiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = YomiteError::UnknownAnswerIdentifier { id: 999 };
        assert_eq!(err.to_string(), "unknown answer identifier 999");

        let err = YomiteError::RaggedWindow {
            window_size: 27,
            token_axis_length: 2184,
            remainder: 24,
        };
        assert!(err.to_string().contains("24 trailing columns"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<YomiteError>();
    }
}
