//! Error types for framebatch.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameBatchError {
    // Caller bugs
    #[error("Usage error: {message}")]
    Usage { message: String },

    // Broken engine invariants
    #[error("State inconsistency: {message}")]
    StateInconsistency { message: String },

    // Inference collaborator
    #[error("Inference failed: {message}")]
    Inference { message: String },

    // Feature source failures (degrade a single stream, never abort a step)
    #[error("Feature source for stream {stream} failed: {message}")]
    FeatureSource { stream: usize, message: String },

    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl FrameBatchError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn inconsistency(message: impl Into<String>) -> Self {
        Self::StateInconsistency {
            message: message.into(),
        }
    }

    /// True for errors that abort the whole batch.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::FeatureSource { .. })
    }
}

pub type Result<T> = std::result::Result<T, FrameBatchError>;
