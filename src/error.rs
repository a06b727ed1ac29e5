//! Error types for the forecasting core.

use thiserror::Error;

use crate::ml::model::PredictorError;
use crate::ml::persistence::ArtifactError;

pub type Result<T> = std::result::Result<T, ForecastError>;

#[derive(Error, Debug)]
pub enum ForecastError {
    /// Seed shorter than the model window. Callers recover via the profile.
    #[error("insufficient history: need at least {needed} hourly points, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("predictor failed: {0}")]
    Predictor(#[from] PredictorError),

    #[error("invalid seed series: {0}")]
    InvalidSeed(String),

    /// Only raised when strict feature alignment is enabled.
    #[error("feature row is missing named features: {}", missing.join(", "))]
    FeatureAlignment { missing: Vec<String> },

    #[error("rollout of {steps} steps exceeds the maximum of {max}")]
    HorizonTooLong { steps: usize, max: usize },

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("observation store error: {0}")]
    Store(String),
}

impl ForecastError {
    /// Whether the profile fallback can serve the request instead.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}
