//! Error types for the scenario engine

use thiserror::Error;

/// Errors that can occur while pricing positions or evaluating scenarios
///
/// Most numerical anomalies never surface as errors: the pricing kernel clamps
/// bad inputs and reports them through [`crate::Diagnostics`]. The variants
/// below are the failures that abort a single position or a single scenario.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid scenario '{name}': {reason}")]
    InvalidScenario { name: String, reason: String },

    #[error("Missing market data for {symbol}: {what}")]
    MissingMarketData { symbol: String, what: String },

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Pricing failed for {symbol}: {reason}")]
    PricingFailed { symbol: String, reason: String },

    #[error("Invalid confidence level: {0} (must be between 0 and 1)")]
    InvalidConfidenceLevel(f64),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Batch deadline of {deadline_ms} ms exceeded before scenario '{scenario}'")]
    DeadlineExceeded { scenario: String, deadline_ms: u64 },

    #[error("Scenario '{scenario}' panicked: {message}")]
    ScenarioPanicked { scenario: String, message: String },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScenarioError {
    /// Whether the failure is contained at the position level
    ///
    /// Position-level failures carry the position's current value forward;
    /// everything else aborts the whole scenario.
    pub fn is_position_level(&self) -> bool {
        matches!(
            self,
            ScenarioError::MissingMarketData { .. }
                | ScenarioError::PricingFailed { .. }
                | ScenarioError::NumericalInstability(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScenarioError>;
