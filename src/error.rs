use thiserror::Error;

use crate::param::ApplyReport;

/// Errors raised while building, importing into, running or checkpointing the classifier.
#[derive(Error, Debug)]
pub enum LoraError {
    /// The architecture cannot be built from the given configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The input is longer than the model block size.
    #[error("Cannot forward sequence of length {len}, block size is only {block_size}")]
    SequenceTooLong { len: usize, block_size: usize },

    /// The input has no tokens.
    #[error("Cannot forward an empty sequence")]
    EmptySequence,

    /// The padding mask does not have the token ids shape.
    #[error("Mask shape {mask:?} does not match token shape {tokens:?}")]
    MaskShapeMismatch { tokens: [usize; 2], mask: [usize; 2] },

    /// A padding mask row marks every position as padding.
    #[error("Mask row {row} has no real token")]
    EmptyMaskRow { row: usize },

    /// Pretrained weights do not fit the module graph.
    #[error("Pretrained weights do not fit the model:\n{0}")]
    Import(ApplyReport),

    /// A trainable checkpoint does not fit the module graph.
    #[error("Trainable checkpoint does not fit the model:\n{0}")]
    Checkpoint(ApplyReport),

    /// A trainable checkpoint was written for another architecture.
    #[error("Checkpoint `{key}` is {found}, the model expects {expected}")]
    CheckpointArchitecture {
        key: String,
        expected: String,
        found: String,
    },

    /// Generation settings are out of range.
    #[error("Invalid generation settings: {0}")]
    Generation(String),

    /// A weight file holds a tensor type that cannot be read as floats.
    #[error("Tensor `{name}` has unsupported dtype {dtype}")]
    UnsupportedDType { name: String, dtype: String },

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type of the crate.
pub type Result<T> = core::result::Result<T, LoraError>;
