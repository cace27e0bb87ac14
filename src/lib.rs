//! # ag-scenario: Option Valuation and Portfolio Scenario Engine
//!
//! This library revalues an options/equity portfolio under hypothetical
//! market scenarios (spot moves, volatility shifts, time decay) and
//! aggregates the resulting P&L and risk sensitivities.
//!
//! ## Core Components
//!
//! - **BlackScholes**: Closed-form pricing, Greeks, batch evaluation and
//!   implied volatility
//! - **IvShiftModel**: Beta-weighted volatility shift per position
//! - **ScenarioCatalog**: Named, versioned scenario definitions
//! - **ScenarioAggregator**: Scenario revaluation, VaR and correlation
//!
//! ## Example Usage
//!
//! ```rust
//! use ag_scenario::{
//!     EngineConfig, OptionLeg, OptionType, Position, ScenarioAggregator, ScenarioCatalog,
//! };
//! use chrono::NaiveDate;
//!
//! let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
//! let config = EngineConfig::default().with_valuation_date(today);
//! let aggregator = ScenarioAggregator::new(config);
//!
//! let put = OptionLeg::new("SPY", 500.0, OptionType::Put)
//!     .with_expiration(NaiveDate::from_ymd_opt(2024, 3, 29).unwrap())
//!     .with_implied_volatility(0.18);
//!
//! let positions = vec![
//!     Position::stock("SPY", 100.0, 480.0, 505.0),
//!     Position::option("SPY 240329P500", 1.0, 6.0, 5.2, put),
//! ];
//!
//! let batch = aggregator.run_many(&positions, &ScenarioCatalog::builtin());
//! assert_eq!(batch.len(), 16);
//!
//! // The protective put cushions the crash
//! let crash = batch.get("Black Swan").unwrap();
//! assert!(crash.pnl < 0.0);
//! assert!(crash.position_results[1].pnl > 0.0);
//!
//! let var_95 = ScenarioAggregator::value_at_risk(&batch, 0.95).unwrap();
//! assert!(var_95 <= 0.0);
//! ```

pub mod aggregator;
pub mod analytics;
pub mod catalog;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod iv_model;
pub mod position;
pub mod pricing;

pub use aggregator::{
    CorrelationMatrix, Drawdown, PortfolioMetrics, PositionDetail, PositionResult,
    ScenarioAggregator, ScenarioBatch, ScenarioResult, ScenarioSummaryRow,
};
pub use catalog::{ScenarioCatalog, ScenarioSpec};
pub use config::{EngineConfig, ImpliedVolConfig, ParallelConfig};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use error::{Result, ScenarioError};
pub use iv_model::{
    DteBucket, DteScaling, IvMultipliers, IvShiftModel, MoneynessCategory, MoneynessConvention,
    VolShock,
};
pub use position::{OptionLeg, Position, PositionKind};
pub use pricing::{BlackScholes, Greeks, ImpliedVolResult, OptionInput, OptionPricer, OptionType};

/// Install a `tracing` subscriber driven by `RUST_LOG`
///
/// Intended for binaries and demos; the library itself never installs one.
/// Calling it again after a subscriber is set is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
