//! Error taxonomy for model loading, tokenizer construction, and inference.

use std::path::PathBuf;

/// Error type for all transcription operations.
///
/// Load-time integrity failures (`ManifestMissing`, `TensorMissing`,
/// `ShapeMismatch`, `VocabMissing`, `MergesMissing`) are fatal for the load
/// attempt; there is no partial-load recovery. Forward-pass shape errors after
/// a successful load surface as `Tensor` and indicate a malformed weight set,
/// not a recoverable runtime condition.
#[derive(Debug, thiserror::Error)]
pub enum WhisperError {
    /// No weight set has been prepared for this transcriber.
    #[error("no model has been prepared")]
    ModelUnavailable,
    /// The model directory exists but carries no manifest.
    #[error("manifest.json not found in {0}")]
    ManifestMissing(PathBuf),
    /// A tensor required by the configuration is absent from the weight set.
    #[error("missing tensor: {0}")]
    TensorMissing(String),
    /// A tensor's shape disagrees with the shape the configuration implies,
    /// or its element count disagrees with its declared shape.
    #[error("shape mismatch for tensor: {0}")]
    ShapeMismatch(String),
    /// The tokenizer vocabulary file is absent or unreadable.
    #[error("tokenizer vocabulary missing")]
    VocabMissing,
    /// The tokenizer merge-rule file is absent or unreadable.
    #[error("tokenizer merges missing")]
    MergesMissing,
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transcription operations.
pub type Result<T> = std::result::Result<T, WhisperError>;
