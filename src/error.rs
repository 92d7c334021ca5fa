/* ------------------------------------------------------------------ */
/* Error type shared across the crate                                 */
/* ------------------------------------------------------------------ */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("activation cache has no `{hook}` entry for layer {layer}")]
    MissingActivation { hook: String, layer: usize },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("data source: {0}")]
    Data(String),

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },

    #[error("metrics sink: {0}")]
    Metrics(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SqkError>;
