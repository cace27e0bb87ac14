//! Portfolio scenario aggregation
//!
//! Revalues every position under a scenario and aggregates P&L and Greeks:
//! - Underlying spots are shocked once per symbol
//! - Option legs get a beta-weighted IV shift and are repriced after the
//!   scenario's elapsed days
//! - A position that cannot be repriced keeps its current value (fail-open)
//! - `run_many` evaluates scenarios on a bounded rayon pool; a failed or
//!   panicking scenario is omitted from the batch
//!
//! Risk summaries (VaR, correlation, drawdown) work on any collection of
//! [`ScenarioResult`]s.

use crate::catalog::ScenarioSpec;
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{Result, ScenarioError};
use crate::iv_model::IvShiftModel;
use crate::position::{Position, PositionKind};
use crate::pricing::{BlackScholes, Greeks, OptionInput, OptionPricer};
use indexmap::IndexMap;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Aggregate value and Greeks of a position set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub total_value: f64,
    pub stock_value: f64,
    pub option_value: f64,

    /// Unrealized P&L against entry prices
    pub unrealized_pnl: f64,

    /// Option Greeks weighted by quantity * multiplier, plus stock delta
    pub greeks: Greeks,

    pub position_count: usize,
    pub stock_count: usize,
    pub option_count: usize,

    /// Largest position value as a percent of total value
    pub max_concentration: f64,

    pub diagnostics: Diagnostics,
}

/// Outcome for one position under one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionResult {
    pub symbol: String,
    pub kind: PositionKind,
    pub current_value: f64,
    pub scenario_value: f64,
    pub pnl: f64,

    /// P&L in percent of current value (0 when current value is 0)
    pub pnl_pct: f64,

    /// Shifted IV used for repricing (options only)
    pub scenario_iv: Option<f64>,

    /// False when repricing failed and the current value was carried forward
    pub repriced: bool,
}

/// Outcome of one scenario over a whole portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub current_value: f64,
    pub scenario_value: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub worst_position: Option<PositionResult>,
    pub best_position: Option<PositionResult>,
    pub position_results: Vec<PositionResult>,
    pub diagnostics: Diagnostics,
}

/// Results of `run_many`, keyed by scenario name in input order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioBatch {
    pub results: IndexMap<String, ScenarioResult>,

    /// One `ScenarioFailure` entry per omitted scenario
    pub diagnostics: Diagnostics,
}

impl ScenarioBatch {
    pub fn get(&self, scenario: &str) -> Option<&ScenarioResult> {
        self.results.get(scenario)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.values()
    }
}

impl<'a> IntoIterator for &'a ScenarioBatch {
    type Item = &'a ScenarioResult;
    type IntoIter = indexmap::map::Values<'a, String, ScenarioResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.values()
    }
}

/// Pairwise Pearson correlation of position P&L across scenarios
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationMatrix {
    /// Row and column labels
    pub symbols: Vec<String>,
    pub matrix: DMatrix<f64>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.symbols.iter().position(|s| s == a)?;
        let j = self.symbols.iter().position(|s| s == b)?;
        Some(self.matrix[(i, j)])
    }
}

/// Worst portfolio loss across scenarios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawdown {
    /// Most negative portfolio P&L, 0 when no scenario loses money
    pub max_drawdown: f64,
    pub worst_scenario: Option<String>,
}

/// One row of the scenario summary table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummaryRow {
    pub scenario: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub worst_position: Option<String>,
    pub worst_pnl: f64,
    pub best_position: Option<String>,
    pub best_pnl: f64,
}

/// P&L of one position across every scenario it appeared in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDetail {
    pub symbol: String,
    pub current_value: f64,
    pub pnl_by_scenario: IndexMap<String, f64>,
    pub max_loss: f64,
    pub max_gain: f64,
}

/// Scenario revaluation engine
pub struct ScenarioAggregator {
    config: EngineConfig,
    kernel: BlackScholes,
    pricer: Arc<dyn OptionPricer>,
    iv_model: IvShiftModel,
}

impl ScenarioAggregator {
    /// Create an aggregator pricing with Black-Scholes
    pub fn new(config: EngineConfig) -> Self {
        let kernel = Self::build_kernel(&config);
        Self::with_pricer(config, Arc::new(kernel))
    }

    /// Create an aggregator that reprices options through `pricer`
    ///
    /// Greeks and implied volatility still come from the Black-Scholes kernel.
    pub fn with_pricer(config: EngineConfig, pricer: Arc<dyn OptionPricer>) -> Self {
        let kernel = Self::build_kernel(&config);
        let iv_model = IvShiftModel::new(config.moneyness_convention);

        Self {
            config,
            kernel,
            pricer,
            iv_model,
        }
    }

    fn build_kernel(config: &EngineConfig) -> BlackScholes {
        BlackScholes::new(config.risk_free_rate)
            .with_solver(config.implied_vol.clone())
            .with_parallel(config.parallel.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn kernel(&self) -> &BlackScholes {
        &self.kernel
    }

    /// Current value and Greeks of a position set
    ///
    /// Option legs contribute their last known Greeks; a leg without Greeks
    /// contributes zero and is reported (see [`Self::with_model_greeks`]).
    pub fn current_metrics(&self, positions: &[Position]) -> PortfolioMetrics {
        let mut diagnostics = Diagnostics::new();
        let mut total_value = 0.0;
        let mut stock_value = 0.0;
        let mut option_value = 0.0;
        let mut unrealized_pnl = 0.0;
        let mut greeks = Greeks::ZERO;
        let mut max_position = f64::NEG_INFINITY;

        for position in positions {
            let value = position.position_value();
            total_value += value;
            unrealized_pnl += position.unrealized_pnl();
            max_position = max_position.max(value);

            match &position.option {
                Some(leg) => {
                    option_value += value;
                    match leg.greeks {
                        Some(leg_greeks) => {
                            greeks += leg_greeks.scale(position.quantity * leg.multiplier)
                        }
                        None => diagnostics.push(
                            DiagnosticKind::DefaultApplied,
                            position.symbol.as_str(),
                            "No Greeks on option leg, contributing zero",
                        ),
                    }
                }
                None => {
                    stock_value += value;
                    greeks.delta += position.quantity;
                }
            }
        }

        let option_count = positions.iter().filter(|p| p.is_option()).count();
        let max_concentration = if total_value > 0.0 {
            max_position / total_value * 100.0
        } else {
            0.0
        };

        PortfolioMetrics {
            total_value,
            stock_value,
            option_value,
            unrealized_pnl,
            greeks,
            position_count: positions.len(),
            stock_count: positions.len() - option_count,
            option_count,
            max_concentration,
            diagnostics,
        }
    }

    /// Revalue a portfolio under one scenario
    ///
    /// Fails when the scenario itself is malformed or the pricer reports an
    /// error that is not position-level (see
    /// [`ScenarioError::is_position_level`]). Position-level problems are
    /// contained: the position keeps its current value and a
    /// `PositionRepriceFailure` diagnostic is attached to the result.
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::{EngineConfig, Position, ScenarioAggregator, ScenarioSpec};
    ///
    /// let aggregator = ScenarioAggregator::new(EngineConfig::default());
    /// let positions = vec![
    ///     Position::stock("SPY", 100.0, 440.0, 450.0),
    ///     Position::stock("QQQ", -50.0, 380.0, 370.0),
    /// ];
    ///
    /// let result = aggregator
    ///     .run_scenario(&positions, &ScenarioSpec::new("Down 10%", -0.10))
    ///     .unwrap();
    ///
    /// assert!((result.pnl - (-4_500.0 + 1_850.0)).abs() < 1e-9);
    /// assert_eq!(result.worst_position.unwrap().symbol, "SPY");
    /// assert_eq!(result.best_position.unwrap().symbol, "QQQ");
    /// ```
    pub fn run_scenario(
        &self,
        positions: &[Position],
        spec: &ScenarioSpec,
    ) -> Result<ScenarioResult> {
        spec.validate()?;
        tracing::debug!(scenario = %spec.name, positions = positions.len(), "Running scenario");

        let shocked_spots = self.shocked_spots(positions, spec.spot_change);

        let parallel = self.config.parallel.should_parallelize(positions.len());
        let evaluated: Vec<(PositionResult, Diagnostics)> = if parallel {
            positions
                .par_iter()
                .map(|position| self.evaluate_position(position, spec, &shocked_spots))
                .collect::<Result<_>>()?
        } else {
            positions
                .iter()
                .map(|position| self.evaluate_position(position, spec, &shocked_spots))
                .collect::<Result<_>>()?
        };

        let mut diagnostics = Diagnostics::new();
        let mut position_results = Vec::with_capacity(evaluated.len());
        for (result, position_diagnostics) in evaluated {
            diagnostics.absorb(position_diagnostics);
            position_results.push(result);
        }

        let current_value: f64 = position_results.iter().map(|r| r.current_value).sum();
        let scenario_value: f64 = position_results.iter().map(|r| r.scenario_value).sum();
        let pnl = scenario_value - current_value;

        let mut worst: Option<&PositionResult> = None;
        let mut best: Option<&PositionResult> = None;
        for result in &position_results {
            if worst.map_or(true, |w| result.pnl < w.pnl) {
                worst = Some(result);
            }
            if best.map_or(true, |b| result.pnl > b.pnl) {
                best = Some(result);
            }
        }
        let worst_position = worst.cloned();
        let best_position = best.cloned();

        Ok(ScenarioResult {
            scenario_name: spec.name.clone(),
            current_value,
            scenario_value,
            pnl,
            pnl_pct: percent_of(pnl, current_value),
            worst_position,
            best_position,
            position_results,
            diagnostics,
        })
    }

    /// Evaluate many scenarios concurrently
    ///
    /// Parallelism is bounded by `parallel.max_threads` (or the CPU count).
    /// A scenario that errors, panics or starts after the batch deadline is
    /// left out of the results and reported in the batch diagnostics.
    pub fn run_many<'a, I>(&self, positions: &[Position], scenarios: I) -> ScenarioBatch
    where
        I: IntoIterator<Item = &'a ScenarioSpec>,
    {
        let specs: Vec<&ScenarioSpec> = scenarios.into_iter().collect();
        let started = Instant::now();

        tracing::info!(
            scenarios = specs.len(),
            positions = positions.len(),
            "Running scenario batch"
        );

        let run = || -> Vec<Result<ScenarioResult>> {
            specs
                .par_iter()
                .map(|spec| self.run_guarded(positions, spec, started))
                .collect()
        };

        let outcomes = match self.config.parallel.max_threads {
            Some(threads) => match rayon::ThreadPoolBuilder::new()
                .num_threads(threads.max(1))
                .build()
            {
                Ok(pool) => pool.install(run),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to build scenario thread pool, using the global pool"
                    );
                    run()
                }
            },
            None => run(),
        };

        let mut batch = ScenarioBatch::default();
        for (spec, outcome) in specs.iter().zip(outcomes) {
            match outcome {
                Ok(result) => {
                    batch.results.insert(spec.name.clone(), result);
                }
                Err(e) => {
                    tracing::error!(
                        scenario = %spec.name,
                        error = %e,
                        "Scenario omitted from batch"
                    );
                    batch
                        .diagnostics
                        .push(DiagnosticKind::ScenarioFailure, spec.name.as_str(), e.to_string());
                }
            }
        }

        tracing::info!(
            completed = batch.len(),
            failed = batch.diagnostics.count(DiagnosticKind::ScenarioFailure),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scenario batch finished"
        );

        batch
    }

    /// Historical-simulation VaR over scenario P&L
    ///
    /// Sorts portfolio P&L ascending and picks index `floor((1 - c) * N)`
    /// clamped into the valid range. Losses are negative. Returns 0 for an
    /// empty result set.
    pub fn value_at_risk<'a, I>(results: I, confidence: f64) -> Result<f64>
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(ScenarioError::InvalidConfidenceLevel(confidence));
        }

        let mut pnls: Vec<f64> = results.into_iter().map(|r| r.pnl).collect();
        if pnls.is_empty() {
            return Ok(0.0);
        }
        pnls.sort_by(f64::total_cmp);

        let index = ((1.0 - confidence) * pnls.len() as f64).floor() as usize;
        Ok(pnls[index.min(pnls.len() - 1)])
    }

    /// VaR in percent of the current portfolio value (0 when that value is 0)
    pub fn value_at_risk_pct<'a, I>(results: I, confidence: f64) -> Result<f64>
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        let results: Vec<&ScenarioResult> = results.into_iter().collect();
        let var = Self::value_at_risk(results.iter().copied(), confidence)?;
        let current_value = results.first().map_or(0.0, |r| r.current_value);
        Ok(percent_of(var, current_value))
    }

    /// Pearson correlation of per-position P&L across scenarios
    ///
    /// Every symbol must appear in the same set of scenarios; results from
    /// `run_scenario` over a single position list always satisfy this. A
    /// symbol whose P&L never varies has undefined correlation, reported as
    /// NaN off the diagonal.
    pub fn correlation_matrix<'a, I>(
        positions: &[Position],
        results: I,
    ) -> Result<CorrelationMatrix>
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        let mut series: IndexMap<&str, Vec<f64>> = IndexMap::new();
        for position in positions {
            series.entry(position.symbol.as_str()).or_default();
        }

        for result in results {
            for position_result in &result.position_results {
                if let Some(pnls) = series.get_mut(position_result.symbol.as_str()) {
                    pnls.push(position_result.pnl);
                }
            }
        }

        let symbols: Vec<String> = series.keys().map(|s| s.to_string()).collect();
        let observations = series.values().next().map_or(0, Vec::len);
        if symbols.is_empty() || observations == 0 {
            return Ok(CorrelationMatrix {
                symbols: Vec::new(),
                matrix: DMatrix::zeros(0, 0),
            });
        }

        for (symbol, pnls) in &series {
            if pnls.len() != observations {
                return Err(ScenarioError::InvalidParameter(format!(
                    "{} has {} scenario observations, expected {}",
                    symbol,
                    pnls.len(),
                    observations
                )));
            }
        }
        if observations < 2 {
            return Err(ScenarioError::InsufficientData(
                "Correlation needs at least 2 scenarios".to_string(),
            ));
        }

        let n = symbols.len();
        let mut data = DMatrix::from_fn(observations, n, |row, col| series[col][row]);
        for mut column in data.column_iter_mut() {
            let mean = column.mean();
            column.add_scalar_mut(-mean);
        }
        let covariance = data.transpose() * &data / (observations - 1) as f64;

        let matrix = DMatrix::from_fn(n, n, |i, j| {
            let scale = (covariance[(i, i)] * covariance[(j, j)]).sqrt();
            if i == j && scale > 0.0 {
                1.0
            } else if scale > 0.0 {
                (covariance[(i, j)] / scale).clamp(-1.0, 1.0)
            } else {
                f64::NAN
            }
        });

        Ok(CorrelationMatrix { symbols, matrix })
    }

    /// Most negative portfolio P&L and the scenario that produced it
    pub fn max_drawdown<'a, I>(results: I) -> Drawdown
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        let mut drawdown = Drawdown {
            max_drawdown: 0.0,
            worst_scenario: None,
        };
        for result in results {
            if result.pnl < drawdown.max_drawdown {
                drawdown.max_drawdown = result.pnl;
                drawdown.worst_scenario = Some(result.scenario_name.clone());
            }
        }
        drawdown
    }

    /// One summary row per scenario, sorted by portfolio P&L ascending
    pub fn scenario_summary<'a, I>(results: I) -> Vec<ScenarioSummaryRow>
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        let mut rows: Vec<ScenarioSummaryRow> = results
            .into_iter()
            .map(|result| ScenarioSummaryRow {
                scenario: result.scenario_name.clone(),
                pnl: result.pnl,
                pnl_pct: result.pnl_pct,
                worst_position: result.worst_position.as_ref().map(|p| p.symbol.clone()),
                worst_pnl: result.worst_position.as_ref().map_or(0.0, |p| p.pnl),
                best_position: result.best_position.as_ref().map(|p| p.symbol.clone()),
                best_pnl: result.best_position.as_ref().map_or(0.0, |p| p.pnl),
            })
            .collect();

        rows.sort_by(|a, b| a.pnl.total_cmp(&b.pnl));
        rows
    }

    /// Per-position P&L across scenarios, in order of first appearance
    pub fn position_detail<'a, I>(results: I) -> Vec<PositionDetail>
    where
        I: IntoIterator<Item = &'a ScenarioResult>,
    {
        let mut details: IndexMap<String, PositionDetail> = IndexMap::new();

        for result in results {
            for position_result in &result.position_results {
                let detail = details
                    .entry(position_result.symbol.clone())
                    .or_insert_with(|| PositionDetail {
                        symbol: position_result.symbol.clone(),
                        current_value: position_result.current_value,
                        pnl_by_scenario: IndexMap::new(),
                        max_loss: 0.0,
                        max_gain: 0.0,
                    });

                detail
                    .pnl_by_scenario
                    .insert(result.scenario_name.clone(), position_result.pnl);
                detail.max_loss = detail.max_loss.min(position_result.pnl);
                detail.max_gain = detail.max_gain.max(position_result.pnl);
            }
        }

        details.into_values().collect()
    }

    /// Fresh position snapshots whose option legs carry model Greeks
    ///
    /// A leg without implied volatility has it backed out of its current
    /// price first. Legs whose underlying spot cannot be resolved are copied
    /// unchanged. The input slice is never modified.
    pub fn with_model_greeks(&self, positions: &[Position]) -> (Vec<Position>, Diagnostics) {
        let spots = self.shocked_spots(positions, 0.0);
        let mut diagnostics = Diagnostics::new();

        let updated = positions
            .iter()
            .map(|position| {
                let mut snapshot = position.clone();
                let Some(leg) = snapshot.option.as_mut() else {
                    return snapshot;
                };
                let Some(&spot) = spots.get(leg.underlying.as_str()) else {
                    diagnostics.push(
                        DiagnosticKind::PositionRepriceFailure,
                        position.symbol.as_str(),
                        format!("No spot price for underlying {}", leg.underlying),
                    );
                    return snapshot;
                };

                let dte = self.days_to_expiration(position, &mut diagnostics);
                let t = dte.max(0) as f64 / 365.0;

                let on_file = leg.implied_volatility.filter(|iv| *iv > 0.0 && iv.is_finite());
                let volatility = match on_file {
                    Some(iv) => iv,
                    None => {
                        let solved = self.kernel.implied_vol(
                            position.current_price,
                            spot,
                            leg.strike,
                            t,
                            leg.option_type,
                            0.0,
                        );
                        diagnostics.absorb(solved.diagnostics);
                        leg.implied_volatility = Some(solved.volatility);
                        solved.volatility
                    }
                };

                let input = OptionInput::new(spot, leg.strike, t, volatility, leg.option_type);
                leg.greeks = Some(self.kernel.greeks_with_diagnostics(&input, &mut diagnostics));
                snapshot
            })
            .collect();

        (updated, diagnostics)
    }

    fn run_guarded(
        &self,
        positions: &[Position],
        spec: &ScenarioSpec,
        started: Instant,
    ) -> Result<ScenarioResult> {
        if let Some(deadline) = self.config.batch_deadline() {
            if started.elapsed() > deadline {
                return Err(ScenarioError::DeadlineExceeded {
                    scenario: spec.name.clone(),
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.run_scenario(positions, spec))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Err(ScenarioError::ScenarioPanicked {
                    scenario: spec.name.clone(),
                    message,
                })
            }
        }
    }

    /// Spot per underlying symbol, shocked by `spot_change`
    ///
    /// A stock position's current price takes precedence over the spot
    /// snapshot carried on option legs.
    fn shocked_spots<'p>(
        &self,
        positions: &'p [Position],
        spot_change: f64,
    ) -> IndexMap<&'p str, f64> {
        let mut spots: IndexMap<&str, f64> = IndexMap::new();

        for position in positions.iter().filter(|p| !p.is_option()) {
            spots.entry(position.symbol.as_str()).or_insert(position.current_price);
        }
        for leg in positions.iter().filter_map(|p| p.option.as_ref()) {
            if let Some(price) = leg.underlying_price {
                spots.entry(leg.underlying.as_str()).or_insert(price);
            }
        }

        for spot in spots.values_mut() {
            *spot *= 1.0 + spot_change;
        }
        spots
    }

    fn evaluate_position(
        &self,
        position: &Position,
        spec: &ScenarioSpec,
        shocked_spots: &IndexMap<&str, f64>,
    ) -> Result<(PositionResult, Diagnostics)> {
        let mut diagnostics = Diagnostics::new();
        let current_value = position.position_value();

        let (scenario_value, scenario_iv, repriced) =
            match self.scenario_value(position, spec, shocked_spots, &mut diagnostics) {
                Ok((value, iv)) => (value, iv, true),
                Err(e) if !e.is_position_level() => {
                    tracing::error!(
                        scenario = %spec.name,
                        symbol = %position.symbol,
                        error = %e,
                        "Repricing failed outside the position, aborting scenario"
                    );
                    return Err(e);
                }
                Err(e) => {
                    diagnostics.push(
                        DiagnosticKind::PositionRepriceFailure,
                        position.symbol.as_str(),
                        format!("{}; carrying current value {:.2} forward", e, current_value),
                    );
                    (current_value, None, false)
                }
            };

        let pnl = scenario_value - current_value;
        let result = PositionResult {
            symbol: position.symbol.clone(),
            kind: position.kind(),
            current_value,
            scenario_value,
            pnl,
            pnl_pct: percent_of(pnl, current_value),
            scenario_iv,
            repriced,
        };

        Ok((result, diagnostics))
    }

    fn scenario_value(
        &self,
        position: &Position,
        spec: &ScenarioSpec,
        shocked_spots: &IndexMap<&str, f64>,
        diagnostics: &mut Diagnostics,
    ) -> Result<(f64, Option<f64>)> {
        let underlying = position.underlying_symbol();
        let spot = *shocked_spots
            .get(underlying)
            .ok_or_else(|| ScenarioError::MissingMarketData {
                symbol: underlying.to_string(),
                what: "underlying spot price".to_string(),
            })?;

        let Some(leg) = position.option.as_ref() else {
            return Ok((spot * position.quantity, None));
        };

        let base_iv = match leg.implied_volatility.filter(|iv| *iv > 0.0 && iv.is_finite()) {
            Some(iv) => iv,
            None => {
                diagnostics.push(
                    DiagnosticKind::DefaultApplied,
                    position.symbol.as_str(),
                    format!("No IV data, using default {:.2}", self.config.default_volatility),
                );
                self.config.default_volatility
            }
        };

        let dte = self.days_to_expiration(position, diagnostics);
        let shifted = self
            .iv_model
            .resolve(base_iv, spot, leg.strike, leg.option_type, dte, &spec.vol);

        let new_dte = (dte - i64::from(spec.days_pass)).max(0);
        let input = OptionInput::new(
            spot,
            leg.strike,
            new_dte as f64 / 365.0,
            shifted.volatility,
            leg.option_type,
        );

        let price = self.pricer.price_option(&input, diagnostics)?;
        let value = price * position.quantity * leg.multiplier;
        if !value.is_finite() {
            return Err(ScenarioError::NumericalInstability(format!(
                "scenario value {} is not finite",
                value
            )));
        }

        tracing::trace!(
            symbol = %position.symbol,
            category = %shifted.category,
            iv = shifted.volatility,
            price,
            "Repriced option"
        );

        Ok((value, Some(shifted.volatility)))
    }

    fn days_to_expiration(&self, position: &Position, diagnostics: &mut Diagnostics) -> i64 {
        match position.days_to_expiration(self.config.valuation_date) {
            Some(dte) => dte,
            None => {
                diagnostics.push(
                    DiagnosticKind::DefaultApplied,
                    position.symbol.as_str(),
                    format!("No expiration date, using {} DTE", self.config.default_dte),
                );
                self.config.default_dte
            }
        }
    }
}

fn percent_of(amount: f64, base: f64) -> f64 {
    if base == 0.0 {
        0.0
    } else {
        amount / base * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iv_model::IvMultipliers;
    use crate::position::OptionLeg;
    use crate::pricing::OptionType;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn valuation_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn aggregator() -> ScenarioAggregator {
        ScenarioAggregator::new(EngineConfig::default().with_valuation_date(valuation_date()))
    }

    fn call(symbol: &str, strike: f64, quantity: f64, days: i64) -> Position {
        let leg = OptionLeg::new("XYZ", strike, OptionType::Call)
            .with_expiration(valuation_date() + chrono::Duration::days(days))
            .with_implied_volatility(0.30)
            .with_greeks(Greeks {
                delta: 0.5,
                gamma: 0.03,
                theta: -0.05,
                vega: 0.12,
                rho: 0.04,
            });
        Position::option(symbol, quantity, 2.0, 2.5, leg)
    }

    fn result_with_pnl(name: &str, pnl: f64) -> ScenarioResult {
        ScenarioResult {
            scenario_name: name.to_string(),
            current_value: 10_000.0,
            scenario_value: 10_000.0 + pnl,
            pnl,
            pnl_pct: pnl / 100.0,
            worst_position: None,
            best_position: None,
            position_results: Vec::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    #[test]
    fn test_current_metrics_greek_additivity() {
        let positions = vec![
            Position::stock("XYZ", 200.0, 95.0, 100.0),
            call("XYZ C105", 105.0, 3.0, 30),
            call("XYZ C110", 110.0, -2.0, 30),
        ];

        let metrics = aggregator().current_metrics(&positions);

        let leg = positions[1].option.as_ref().unwrap().greeks.unwrap();
        let expected_delta = 200.0 + leg.delta * 300.0 + leg.delta * -200.0;
        assert_relative_eq!(metrics.greeks.delta, expected_delta, epsilon = 1e-9);
        assert_relative_eq!(metrics.greeks.vega, leg.vega * 100.0, epsilon = 1e-9);
        assert_eq!(metrics.stock_count, 1);
        assert_eq!(metrics.option_count, 2);
        assert_relative_eq!(metrics.total_value, 20_000.0 + 750.0 - 500.0);
        assert_relative_eq!(metrics.max_concentration, 20_000.0 / 20_250.0 * 100.0);
        assert!(metrics.diagnostics.is_empty());
    }

    #[test]
    fn test_current_metrics_empty() {
        let metrics = aggregator().current_metrics(&[]);
        assert_eq!(metrics.total_value, 0.0);
        assert_eq!(metrics.max_concentration, 0.0);
        assert_eq!(metrics.greeks, Greeks::ZERO);
    }

    #[test]
    fn test_missing_option_greeks_reported() {
        let leg = OptionLeg::new("XYZ", 100.0, OptionType::Put);
        let positions = vec![Position::option("XYZ P100", 1.0, 1.0, 1.0, leg)];

        let metrics = aggregator().current_metrics(&positions);
        assert_eq!(metrics.greeks, Greeks::ZERO);
        assert_eq!(metrics.diagnostics.count(DiagnosticKind::DefaultApplied), 1);
    }

    #[test]
    fn test_stock_only_scenario() {
        let positions = vec![Position::stock("SPY", 10.0, 400.0, 450.0)];
        let result = aggregator()
            .run_scenario(&positions, &ScenarioSpec::new("Up", 0.02))
            .unwrap();

        assert_relative_eq!(result.scenario_value, 4_590.0, epsilon = 1e-9);
        assert_relative_eq!(result.pnl, 90.0, epsilon = 1e-9);
        assert_relative_eq!(result.pnl_pct, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_option_uses_stock_spot_and_days_pass() {
        let positions = vec![
            Position::stock("XYZ", 0.0, 100.0, 100.0),
            call("XYZ C100", 100.0, 1.0, 10),
        ];
        let spec = ScenarioSpec::new("Decay", 0.0).with_days_pass(4);
        let result = aggregator().run_scenario(&positions, &spec).unwrap();

        let kernel = BlackScholes::new(0.05);
        let input = OptionInput::new(100.0, 100.0, 6.0 / 365.0, 0.30, OptionType::Call);
        let expected = kernel.price(&input) * 100.0;

        let option = &result.position_results[1];
        assert!(option.repriced);
        assert_eq!(option.scenario_iv, Some(0.30));
        assert_relative_eq!(option.scenario_value, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_days_pass_beyond_expiry_gives_intrinsic() {
        let positions = vec![
            Position::stock("XYZ", 0.0, 110.0, 110.0),
            call("XYZ C100", 100.0, 2.0, 3),
        ];
        let spec = ScenarioSpec::new("Expire", 0.0).with_days_pass(10);
        let result = aggregator().run_scenario(&positions, &spec).unwrap();

        assert_eq!(result.position_results[1].scenario_value, 10.0 * 2.0 * 100.0);
    }

    #[test]
    fn test_unresolved_underlying_fails_open() {
        let leg = OptionLeg::new("NOPE", 50.0, OptionType::Call).with_implied_volatility(0.4);
        let positions = vec![
            Position::stock("SPY", 10.0, 400.0, 400.0),
            Position::option("NOPE C50", 1.0, 3.0, 3.0, leg),
        ];

        let result = aggregator()
            .run_scenario(&positions, &ScenarioSpec::new("Down", -0.10))
            .unwrap();

        let orphan = &result.position_results[1];
        assert!(!orphan.repriced);
        assert_eq!(orphan.scenario_value, orphan.current_value);
        assert_eq!(orphan.pnl, 0.0);
        assert_eq!(result.diagnostics.count(DiagnosticKind::PositionRepriceFailure), 1);
        assert_relative_eq!(result.pnl, -400.0, epsilon = 1e-9);
    }

    #[test]
    fn test_missing_iv_and_expiration_use_defaults() {
        let leg = OptionLeg::new("XYZ", 100.0, OptionType::Put).with_underlying_price(100.0);
        let positions = vec![Position::option("XYZ P100", 1.0, 3.0, 3.0, leg)];

        let result = aggregator()
            .run_scenario(&positions, &ScenarioSpec::new("Flat", 0.0))
            .unwrap();

        let kernel = BlackScholes::new(0.05);
        let input = OptionInput::new(100.0, 100.0, 30.0 / 365.0, 0.30, OptionType::Put);
        let expected = kernel.price(&input) * 100.0;
        assert_relative_eq!(result.scenario_value, expected, epsilon = 1e-9);
        assert_eq!(result.diagnostics.count(DiagnosticKind::DefaultApplied), 2);
    }

    #[test]
    fn test_best_worst_ties_keep_first() {
        let positions = vec![
            Position::stock("A", 10.0, 10.0, 10.0),
            Position::stock("B", 10.0, 10.0, 10.0),
            Position::stock("C", -10.0, 10.0, 10.0),
            Position::stock("D", -10.0, 10.0, 10.0),
        ];
        let result = aggregator()
            .run_scenario(&positions, &ScenarioSpec::new("Up", 0.10))
            .unwrap();

        assert_eq!(result.best_position.unwrap().symbol, "A");
        assert_eq!(result.worst_position.unwrap().symbol, "C");
    }

    #[test]
    fn test_invalid_scenario_is_an_error() {
        let positions = vec![Position::stock("A", 1.0, 1.0, 1.0)];
        let err = aggregator()
            .run_scenario(&positions, &ScenarioSpec::new("Bad", f64::NAN))
            .unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidScenario { .. }));
    }

    #[test]
    fn test_run_many_omits_failures_and_keeps_order() {
        let positions = vec![Position::stock("SPY", 10.0, 400.0, 400.0)];
        let scenarios = vec![
            ScenarioSpec::new("First", 0.01),
            ScenarioSpec::new("Broken", -2.0),
            ScenarioSpec::new("Third", -0.01),
        ];

        let batch = aggregator().run_many(&positions, &scenarios);

        assert_eq!(batch.results.keys().collect::<Vec<_>>(), vec!["First", "Third"]);
        assert_eq!(batch.diagnostics.count(DiagnosticKind::ScenarioFailure), 1);
        assert_eq!(batch.diagnostics.iter().next().unwrap().subject, "Broken");
    }

    #[test]
    fn test_run_many_bounded_pool() {
        let config = EngineConfig {
            parallel: crate::config::ParallelConfig {
                max_threads: Some(2),
                parallel_threshold: 256,
            },
            ..EngineConfig::default()
        };
        let aggregator = ScenarioAggregator::new(config);
        let positions = vec![Position::stock("SPY", 1.0, 100.0, 100.0)];
        let scenarios: Vec<_> = (0..20)
            .map(|i| ScenarioSpec::new(format!("S{}", i), i as f64 / 100.0))
            .collect();

        let batch = aggregator.run_many(&positions, &scenarios);
        assert_eq!(batch.len(), 20);
        assert_relative_eq!(batch.get("S7").unwrap().pnl, 7.0, epsilon = 1e-9);
    }

    #[test]
    fn test_run_many_deadline() {
        let config = EngineConfig {
            batch_deadline_ms: Some(0),
            ..EngineConfig::default()
        };
        let aggregator = ScenarioAggregator::new(config);
        let positions = vec![Position::stock("SPY", 1.0, 100.0, 100.0)];
        let scenarios = vec![ScenarioSpec::new("Late", 0.0)];

        let batch = aggregator.run_many(&positions, &scenarios);
        // Whether or not the zero deadline already passed, the scenario is accounted for once
        assert_eq!(batch.len() + batch.diagnostics.count(DiagnosticKind::ScenarioFailure), 1);
        if let Some(failure) = batch.diagnostics.iter().next() {
            assert!(failure.message.contains("deadline"));
        };
    }

    struct PanickingPricer;

    impl OptionPricer for PanickingPricer {
        fn price_option(
            &self,
            _input: &OptionInput,
            _diagnostics: &mut Diagnostics,
        ) -> Result<f64> {
            panic!("pricer exploded");
        }
    }

    #[test]
    fn test_run_many_contains_panics() {
        let aggregator = ScenarioAggregator::with_pricer(
            EngineConfig::default().with_valuation_date(valuation_date()),
            Arc::new(PanickingPricer),
        );
        let positions = vec![
            call("XYZ C100", 100.0, 1.0, 30),
            Position::stock("XYZ", 1.0, 100.0, 100.0),
        ];
        let scenarios = vec![ScenarioSpec::new("Boom", 0.0)];

        let batch = aggregator.run_many(&positions, &scenarios);
        assert!(batch.is_empty());
        let failure = batch.diagnostics.iter().next().unwrap();
        assert_eq!(failure.kind, DiagnosticKind::ScenarioFailure);
        assert!(failure.message.contains("pricer exploded"));
    }

    /// Fails with whichever error it was built with
    struct FailingPricer(fn() -> ScenarioError);

    impl OptionPricer for FailingPricer {
        fn price_option(
            &self,
            _input: &OptionInput,
            _diagnostics: &mut Diagnostics,
        ) -> Result<f64> {
            Err((self.0)())
        }
    }

    #[test]
    fn test_position_level_pricing_error_carries_value_forward() {
        let aggregator = ScenarioAggregator::with_pricer(
            EngineConfig::default().with_valuation_date(valuation_date()),
            Arc::new(FailingPricer(|| ScenarioError::PricingFailed {
                symbol: "XYZ C100".to_string(),
                reason: "no quote".to_string(),
            })),
        );
        let positions = vec![
            call("XYZ C100", 100.0, 1.0, 30),
            Position::stock("XYZ", 1.0, 100.0, 100.0),
        ];

        let result = aggregator
            .run_scenario(&positions, &ScenarioSpec::new("Down", -0.10))
            .unwrap();
        let option = &result.position_results[0];
        assert!(!option.repriced);
        assert_eq!(option.scenario_value, option.current_value);
        assert_eq!(result.diagnostics.count(DiagnosticKind::PositionRepriceFailure), 1);
    }

    #[test]
    fn test_scenario_level_pricing_error_fails_scenario() {
        let aggregator = ScenarioAggregator::with_pricer(
            EngineConfig::default().with_valuation_date(valuation_date()),
            Arc::new(FailingPricer(|| {
                ScenarioError::InvalidParameter("pricer is misconfigured".to_string())
            })),
        );
        let positions = vec![
            call("XYZ C100", 100.0, 1.0, 30),
            Position::stock("XYZ", 1.0, 100.0, 100.0),
        ];
        let scenarios = vec![ScenarioSpec::new("Down", -0.10)];

        let err = aggregator.run_scenario(&positions, &scenarios[0]).unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidParameter(_)));

        let batch = aggregator.run_many(&positions, &scenarios);
        assert!(batch.is_empty());
        let failure = batch.diagnostics.iter().next().unwrap();
        assert_eq!(failure.kind, DiagnosticKind::ScenarioFailure);
        assert!(failure.message.contains("misconfigured"));
    }

    #[test]
    fn test_with_model_greeks_survives_inverted_solver_bounds() {
        let mut config = EngineConfig::default().with_valuation_date(valuation_date());
        config.implied_vol.min_volatility = 5.0;
        let aggregator = ScenarioAggregator::new(config);

        let mut position = call("XYZ C100", 100.0, 1.0, 30);
        if let Some(leg) = position.option.as_mut() {
            leg.implied_volatility = None;
            leg.underlying_price = Some(100.0);
        }

        let (updated, diagnostics) = aggregator.with_model_greeks(&[position]);
        let leg = updated[0].option.as_ref().unwrap();
        let iv = leg.implied_volatility.unwrap();
        assert!(iv.is_finite() && iv > 0.0);
        assert!(leg.greeks.is_some());
        assert!(diagnostics.iter().any(|d| {
            d.kind == DiagnosticKind::InvalidInput && d.message.contains("default solver")
        }));
    }

    #[test]
    fn test_value_at_risk_index() {
        let results: Vec<_> = (0..20)
            .map(|i| result_with_pnl(&format!("S{}", i), (i as f64 - 10.0) * 100.0))
            .collect();

        // floor(0.05 * 20) = 1 -> second smallest
        assert_eq!(ScenarioAggregator::value_at_risk(&results, 0.95).unwrap(), -900.0);
        // floor(0.01 * 20) = 0 -> smallest
        assert_eq!(ScenarioAggregator::value_at_risk(&results, 0.99).unwrap(), -1_000.0);
        assert_eq!(ScenarioAggregator::value_at_risk(&results, 0.50).unwrap(), 0.0);

        assert_relative_eq!(
            ScenarioAggregator::value_at_risk_pct(&results, 0.95).unwrap(),
            -9.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_value_at_risk_edge_cases() {
        let empty: Vec<ScenarioResult> = Vec::new();
        assert_eq!(ScenarioAggregator::value_at_risk(&empty, 0.95).unwrap(), 0.0);
        assert!(ScenarioAggregator::value_at_risk(&empty, 1.5).is_err());
        assert!(ScenarioAggregator::value_at_risk(&empty, 0.0).is_err());
    }

    #[test]
    fn test_max_drawdown_and_summary() {
        let results = vec![
            result_with_pnl("Flat", 0.0),
            result_with_pnl("Crash", -800.0),
            result_with_pnl("Dip", -200.0),
            result_with_pnl("Rally", 300.0),
        ];

        let drawdown = ScenarioAggregator::max_drawdown(&results);
        assert_eq!(drawdown.max_drawdown, -800.0);
        assert_eq!(drawdown.worst_scenario.as_deref(), Some("Crash"));

        let summary = ScenarioAggregator::scenario_summary(&results);
        let order: Vec<_> = summary.iter().map(|r| r.scenario.as_str()).collect();
        assert_eq!(order, vec!["Crash", "Dip", "Flat", "Rally"]);

        let gains_only = vec![result_with_pnl("Rally", 300.0)];
        let none = ScenarioAggregator::max_drawdown(&gains_only);
        assert_eq!(none.max_drawdown, 0.0);
        assert!(none.worst_scenario.is_none());
    }

    #[test]
    fn test_correlation_and_position_detail() {
        let positions = vec![
            Position::stock("LONG", 10.0, 100.0, 100.0),
            Position::stock("SHORT", -5.0, 100.0, 100.0),
            Position::stock("CASH", 0.0, 1.0, 1.0),
        ];
        let aggregator = aggregator();
        let scenarios = vec![
            ScenarioSpec::new("Down", -0.05),
            ScenarioSpec::new("Flat", 0.0),
            ScenarioSpec::new("Up", 0.08),
        ];
        let batch = aggregator.run_many(&positions, &scenarios);

        let correlation = ScenarioAggregator::correlation_matrix(&positions, &batch).unwrap();
        assert_eq!(correlation.symbols, vec!["LONG", "SHORT", "CASH"]);
        assert_relative_eq!(correlation.get("LONG", "LONG").unwrap(), 1.0);
        assert_relative_eq!(correlation.get("LONG", "SHORT").unwrap(), -1.0, epsilon = 1e-12);
        assert!(correlation.get("LONG", "CASH").unwrap().is_nan());

        let detail = ScenarioAggregator::position_detail(&batch);
        assert_eq!(detail[0].symbol, "LONG");
        assert_relative_eq!(detail[0].max_loss, -50.0, epsilon = 1e-9);
        assert_relative_eq!(detail[0].max_gain, 80.0, epsilon = 1e-9);
        assert_eq!(detail[0].pnl_by_scenario.len(), 3);
    }

    #[test]
    fn test_correlation_requires_two_scenarios() {
        let positions = vec![Position::stock("A", 1.0, 1.0, 1.0)];
        let batch = aggregator().run_many(&positions, &[ScenarioSpec::new("Only", 0.1)]);
        assert!(ScenarioAggregator::correlation_matrix(&positions, &batch).is_err());

        let empty = ScenarioAggregator::correlation_matrix(&[], &batch).unwrap();
        assert!(empty.symbols.is_empty());
    }

    #[test]
    fn test_with_model_greeks_backs_out_iv() {
        let kernel = BlackScholes::new(0.05);
        let t = 45.0 / 365.0;
        let market_price = kernel.price(&OptionInput::new(100.0, 105.0, t, 0.35, OptionType::Call));

        let leg = OptionLeg::new("XYZ", 105.0, OptionType::Call)
            .with_expiration(valuation_date() + chrono::Duration::days(45));
        let positions = vec![
            Position::stock("XYZ", 100.0, 100.0, 100.0),
            Position::option("XYZ C105", 2.0, market_price, market_price, leg),
        ];

        let (updated, _diagnostics) = aggregator().with_model_greeks(&positions);

        assert!(positions[1].option.as_ref().unwrap().greeks.is_none());
        let leg = updated[1].option.as_ref().unwrap();
        assert_relative_eq!(leg.implied_volatility.unwrap(), 0.35, epsilon = 1e-3);
        let greeks = leg.greeks.unwrap();
        assert!(greeks.delta > 0.0 && greeks.delta < 1.0);

        let metrics = aggregator().current_metrics(&updated);
        assert_relative_eq!(metrics.greeks.delta, 100.0 + greeks.delta * 200.0, epsilon = 1e-9);
    }

    #[test]
    fn test_category_multiplier_scenario() {
        let leg = OptionLeg::new("XYZ", 100.0, OptionType::Call)
            .with_expiration(valuation_date() + chrono::Duration::days(60))
            .with_underlying_price(100.0)
            .with_implied_volatility(0.25);
        let positions = vec![Position::option("XYZ C100", 1.0, 4.0, 4.0, leg)];
        let spec =
            ScenarioSpec::new("Spike", 0.0).with_iv_multipliers(IvMultipliers::uniform(0.40));

        let result = aggregator().run_scenario(&positions, &spec).unwrap();
        // ATM (beta 1.0), 60 DTE (beta 0.7)
        assert_relative_eq!(
            result.position_results[0].scenario_iv.unwrap(),
            0.25 * (1.0 + 0.40 * 0.7),
            epsilon = 1e-12
        );
    }
}
