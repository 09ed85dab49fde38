//! Error types for confmeta.

use thiserror::Error;

/// Unified error type for all meta-training operations.
///
/// Configuration and checkpoint-schema problems are fatal and never retried; everything a
/// device or the OS reports bubbles up unchanged.
#[derive(Error, Debug)]
pub enum MetaError {
    /// Invalid or inconsistent run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint exists and decodes, but does not match the active run layout
    #[error("Checkpoint schema mismatch: {0}")]
    CheckpointSchema(String),

    /// Checkpoint could not be located or decoded
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Shape mismatches, unknown handles and other tape misuse
    #[error("Autograd error: {0}")]
    Autograd(String),

    /// Malformed conformation data
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Non-finite losses or gradients
    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl MetaError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        MetaError::Config(message.into())
    }

    /// Creates a checkpoint schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        MetaError::CheckpointSchema(message.into())
    }

    /// Creates a checkpoint load/store error.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        MetaError::Checkpoint(message.into())
    }

    /// Creates an autograd error.
    pub fn autograd(message: impl Into<String>) -> Self {
        MetaError::Autograd(message.into())
    }

    /// Creates a dataset error.
    pub fn dataset(message: impl Into<String>) -> Self {
        MetaError::Dataset(message.into())
    }

    /// Creates a numerical error.
    pub fn numerical(message: impl Into<String>) -> Self {
        MetaError::Numerical(message.into())
    }

    /// True for errors that must stop the run before (or at) the first dependent operation.
    pub fn is_config_error(&self) -> bool {
        matches!(self, MetaError::Config(_) | MetaError::CheckpointSchema(_))
    }

    /// Returns a user-friendly error message with actionable guidance.
    pub fn user_message(&self) -> String {
        match self {
            MetaError::Config(msg) => {
                format!(
                    "Configuration error: {}\n\
                     → Review the YAML config; train.batch_size must be at least\n\
                     → train.maml.num_examples_per_task, which must be at least 2.",
                    msg
                )
            }
            MetaError::CheckpointSchema(msg) => {
                format!(
                    "Checkpoint schema mismatch: {}\n\
                     → The checkpoint was written by a run with a different optimizer layout\n\
                     → or model definition. Resume with the matching config.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Result type alias for confmeta operations.
pub type Result<T> = std::result::Result<T, MetaError>;
