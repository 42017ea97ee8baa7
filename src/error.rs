// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-qanet.

/// Errors that can occur while building or running a QANet model.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    /// Tensor operation or weight loading error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid hyperparameters or construction arguments.
    #[error("config error: {0}")]
    Config(String),

    /// Input tensor has the wrong shape, length, or value range.
    #[error("shape error: {0}")]
    Shape(String),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-qanet operations.
pub type Result<T> = std::result::Result<T, QaError>;
