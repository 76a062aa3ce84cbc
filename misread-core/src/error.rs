//! Error types for the misread-core crate.

use thiserror::Error;

/// Top-level error type for training orchestration.
#[derive(Debug, Error)]
pub enum MisreadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Augmentation error: {0}")]
    Augmentation(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Model fitter error: {0}")]
    Fitter(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Job state locked: {0}")]
    Locked(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MisreadError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn augmentation(msg: impl Into<String>) -> Self {
        Self::Augmentation(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn fitter(msg: impl Into<String>) -> Self {
        Self::Fitter(msg.into())
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error is the cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<image::ImageError> for MisreadError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}
