//! Engine configuration
//!
//! Every field has a default, so an empty YAML/JSON document is a valid
//! configuration.

use crate::error::{Result, ScenarioError};
use crate::iv_model::MoneynessConvention;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scenario engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Annual continuously compounded risk-free rate
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    /// As-of date used to derive days to expiration
    #[serde(default = "default_valuation_date")]
    pub valuation_date: NaiveDate,

    /// Implied volatility assumed for option legs that carry none
    #[serde(default = "default_volatility")]
    pub default_volatility: f64,

    /// Days to expiration assumed for option legs without an expiration date
    #[serde(default = "default_dte")]
    pub default_dte: i64,

    /// How moneyness ratios are oriented for puts
    #[serde(default)]
    pub moneyness_convention: MoneynessConvention,

    /// Implied volatility solver settings
    #[serde(default)]
    pub implied_vol: ImpliedVolConfig,

    /// Parallel execution settings
    #[serde(default)]
    pub parallel: ParallelConfig,

    /// Deadline for a `run_many` batch, checked between whole scenarios
    #[serde(default)]
    pub batch_deadline_ms: Option<u64>,
}

impl EngineConfig {
    /// Parse configuration from a YAML string
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::EngineConfig;
    ///
    /// let yaml = r#"
    /// risk_free_rate: 0.04
    /// valuation_date: 2024-03-15
    /// parallel:
    ///   max_threads: 2
    /// "#;
    ///
    /// let config = EngineConfig::from_yaml(yaml).unwrap();
    /// assert_eq!(config.risk_free_rate, 0.04);
    /// assert_eq!(config.parallel.max_threads, Some(2));
    /// assert_eq!(config.default_volatility, 0.30);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings the engine cannot safely run with
    pub fn validate(&self) -> Result<()> {
        if !self.risk_free_rate.is_finite() {
            return Err(ScenarioError::InvalidParameter(format!(
                "risk_free_rate must be finite, got {}",
                self.risk_free_rate
            )));
        }
        if !(self.default_volatility > 0.0 && self.default_volatility.is_finite()) {
            return Err(ScenarioError::InvalidParameter(format!(
                "default_volatility must be positive, got {}",
                self.default_volatility
            )));
        }
        self.implied_vol.validate()
    }

    /// Builder-style override of the valuation date
    pub fn with_valuation_date(mut self, date: NaiveDate) -> Self {
        self.valuation_date = date;
        self
    }

    /// Builder-style override of the moneyness convention
    pub fn with_moneyness_convention(mut self, convention: MoneynessConvention) -> Self {
        self.moneyness_convention = convention;
        self
    }

    /// Batch deadline as a Duration
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: default_risk_free_rate(),
            valuation_date: default_valuation_date(),
            default_volatility: default_volatility(),
            default_dte: default_dte(),
            moneyness_convention: MoneynessConvention::default(),
            implied_vol: ImpliedVolConfig::default(),
            parallel: ParallelConfig::default(),
            batch_deadline_ms: None,
        }
    }
}

/// Newton-Raphson implied volatility solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpliedVolConfig {
    /// Starting volatility
    #[serde(default = "default_volatility")]
    pub initial_guess: f64,

    /// Absolute price difference at which the solve is converged
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: f64,

    /// Iteration budget
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Lower clamp applied after every step
    #[serde(default = "default_min_volatility")]
    pub min_volatility: f64,

    /// Upper clamp applied after every step
    #[serde(default = "default_max_volatility")]
    pub max_volatility: f64,
}

impl ImpliedVolConfig {
    /// Bounds must satisfy 0 < min <= max; guess and tolerance must be finite
    pub fn validate(&self) -> Result<()> {
        let (min, max) = (self.min_volatility, self.max_volatility);
        if !(min > 0.0 && min.is_finite() && max.is_finite() && min <= max) {
            return Err(ScenarioError::InvalidParameter(format!(
                "implied_vol bounds need 0 < min_volatility <= max_volatility, got [{}, {}]",
                min, max
            )));
        }
        if !self.initial_guess.is_finite() {
            return Err(ScenarioError::InvalidParameter(format!(
                "implied_vol initial_guess must be finite, got {}",
                self.initial_guess
            )));
        }
        if !(self.price_tolerance > 0.0 && self.price_tolerance.is_finite()) {
            return Err(ScenarioError::InvalidParameter(format!(
                "implied_vol price_tolerance must be positive, got {}",
                self.price_tolerance
            )));
        }
        Ok(())
    }
}

impl Default for ImpliedVolConfig {
    fn default() -> Self {
        Self {
            initial_guess: default_volatility(),
            price_tolerance: default_price_tolerance(),
            max_iterations: default_max_iterations(),
            min_volatility: default_min_volatility(),
            max_volatility: default_max_volatility(),
        }
    }
}

/// Bounds on data and task parallelism
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Worker threads for `run_many` (None = number of CPU cores)
    #[serde(default)]
    pub max_threads: Option<usize>,

    /// Minimum batch length before `batch()` prices in parallel
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl ParallelConfig {
    /// Whether a batch of `n_items` should be priced in parallel
    #[inline]
    pub fn should_parallelize(&self, n_items: usize) -> bool {
        n_items >= self.parallel_threshold
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

fn default_risk_free_rate() -> f64 {
    0.05
}

fn default_valuation_date() -> NaiveDate {
    Utc::now().date_naive()
}

fn default_volatility() -> f64 {
    0.30
}

fn default_dte() -> i64 {
    30
}

fn default_price_tolerance() -> f64 {
    0.001
}

fn default_max_iterations() -> usize {
    100
}

fn default_min_volatility() -> f64 {
    0.01
}

fn default_max_volatility() -> f64 {
    3.0
}

fn default_parallel_threshold() -> usize {
    256
}
