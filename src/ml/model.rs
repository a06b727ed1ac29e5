//! Predictor abstraction and the immutable artifact bundle built around it.

use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::persistence::ArtifactError;
use super::preprocessing::{OccupancyScaler, OneHotEncoder};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictorError {
    #[error("input shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("predictor produced a non-finite value")]
    NonFinite,
}

/// A trained sequence model: `[window x n_features]` input, one scaled output.
pub trait Predictor: Send + Sync + fmt::Debug {
    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<f64, PredictorError>;

    /// Expected `(window, n_features)` input, if the model declares one.
    fn input_shape(&self) -> Option<(usize, usize)> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Linear read-out over the flattened input window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    window: usize,
    n_features: usize,
    /// Row-major `[window x n_features]` weights.
    weights: Vec<f64>,
    intercept: f64,
    #[serde(default)]
    activation: Activation,
}

impl LinearPredictor {
    pub fn new(
        window: usize,
        n_features: usize,
        weights: Vec<f64>,
        intercept: f64,
    ) -> Result<Self, PredictorError> {
        if weights.len() != window * n_features {
            return Err(PredictorError::ShapeMismatch {
                expected: (window, n_features),
                got: (weights.len(), 1),
            });
        }
        Ok(Self {
            window,
            n_features,
            weights,
            intercept,
            activation: Activation::Identity,
        })
    }

    /// Same weight on every input cell.
    pub fn uniform(window: usize, n_features: usize, weight: f64, intercept: f64) -> Self {
        Self {
            window,
            n_features,
            weights: vec![weight; window * n_features],
            intercept,
            activation: Activation::Identity,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

impl Predictor for LinearPredictor {
    fn predict(&self, input: ArrayView2<'_, f64>) -> Result<f64, PredictorError> {
        let expected = (self.window, self.n_features);
        if input.dim() != expected {
            return Err(PredictorError::ShapeMismatch {
                expected,
                got: input.dim(),
            });
        }

        let z: f64 = input
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.intercept;
        let y = self.activation.apply(z);

        if y.is_finite() {
            Ok(y)
        } else {
            Err(PredictorError::NonFinite)
        }
    }

    fn input_shape(&self) -> Option<(usize, usize)> {
        Some((self.window, self.n_features))
    }
}

/// On-disk predictor formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PersistedPredictor {
    Linear(LinearPredictor),
}

impl PersistedPredictor {
    pub fn into_predictor(self) -> Box<dyn Predictor> {
        match self {
            PersistedPredictor::Linear(p) => Box::new(p),
        }
    }
}

/// Model architectures with artifacts on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Cnn,
    Lstm,
    CnnLstm,
    CnnLstmAttn,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 4] = [
        ModelFamily::Cnn,
        ModelFamily::Lstm,
        ModelFamily::CnnLstm,
        ModelFamily::CnnLstmAttn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Cnn => "cnn",
            ModelFamily::Lstm => "lstm",
            ModelFamily::CnnLstm => "cnn_lstm",
            ModelFamily::CnnLstmAttn => "cnn_lstm_attn",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == normalized)
            .ok_or_else(|| ArtifactError::UnknownFamily(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMetadata {
    pub model_version: String,
    pub family: ModelFamily,
}

/// Predictor plus everything needed to build its inputs. Immutable once
/// loaded.
#[derive(Debug)]
pub struct ArtifactBundle {
    pub predictor: Box<dyn Predictor>,
    pub scaler: Option<OccupancyScaler>,
    pub encoder: Option<OneHotEncoder>,
    pub window_size: usize,
    /// Feature names in training order; empty for classic bundles.
    pub feature_order: Vec<String>,
    pub metadata: ModelMetadata,
}

impl ArtifactBundle {
    pub fn new(predictor: Box<dyn Predictor>, window_size: usize, metadata: ModelMetadata) -> Self {
        Self {
            predictor,
            scaler: None,
            encoder: None,
            window_size,
            feature_order: Vec::new(),
            metadata,
        }
    }

    pub fn with_scaler(mut self, scaler: OccupancyScaler) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_encoder(mut self, encoder: OneHotEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_feature_order<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.feature_order = names.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the bundle can build full feature rows.
    pub fn supports_hybrid(&self) -> bool {
        !self.feature_order.is_empty() && self.encoder.is_some()
    }

    /// Check internal consistency of the bundle.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("window size must be positive".to_string());
        }
        if let Some(encoder) = &self.encoder {
            let inputs = encoder.inputs().len();
            if inputs != encoder.categories.len() {
                return Err(format!(
                    "encoder has {inputs} inputs but {} category lists",
                    encoder.categories.len()
                ));
            }
        }
        if let Some((window, n_features)) = self.predictor.input_shape() {
            if window != self.window_size {
                return Err(format!(
                    "predictor window {window} does not match preprocessing window {}",
                    self.window_size
                ));
            }
            let expected_features = if self.supports_hybrid() {
                self.feature_order.len()
            } else {
                1
            };
            if n_features != expected_features {
                return Err(format!(
                    "predictor expects {n_features} features per step, bundle provides {expected_features}"
                ));
            }
        }
        Ok(())
    }
}
