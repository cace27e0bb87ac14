//! Integration tests for the scenario engine
//!
//! These tests drive the public API end to end: configuration and catalog
//! loading, scenario revaluation, fail-open repricing and risk summaries.

use ag_scenario::{
    BlackScholes, DiagnosticKind, Diagnostics, EngineConfig, Greeks, IvMultipliers,
    MoneynessCategory, MoneynessConvention, OptionInput, OptionLeg, OptionPricer, OptionType,
    Position, Result, ScenarioAggregator, ScenarioCatalog, ScenarioError, ScenarioSpec,
};
use approx::assert_relative_eq;
use chrono::{Duration, NaiveDate};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fs;
use std::sync::Arc;

fn valuation_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
}

fn config(convention: MoneynessConvention) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_valuation_date(valuation_date())
        .with_moneyness_convention(convention);
    config.risk_free_rate = 0.05;
    config
}

/// Textbook Black-Scholes put, no dividends
fn reference_put(spot: f64, strike: f64, t: f64, vol: f64, rate: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * t) / (vol * t.sqrt());
    let d2 = d1 - vol * t.sqrt();
    strike * (-rate * t).exp() * normal.cdf(-d2) - spot * normal.cdf(-d1)
}

fn atm_put_30d() -> Position {
    let leg = OptionLeg::new("XYZ", 100.0, OptionType::Put)
        .with_expiration(valuation_date() + Duration::days(30))
        .with_multiplier(100.0)
        .with_underlying_price(100.0)
        .with_implied_volatility(0.30);
    Position::option("XYZ 30D P100", 1.0, 4.0, 3.60, leg)
}

fn atm_skew_scenario() -> ScenarioSpec {
    ScenarioSpec::new("Skew Shock", -0.05)
        .with_iv_multipliers(IvMultipliers::default().with(MoneynessCategory::Atm, 0.35))
}

#[test]
fn test_atm_put_skew_shock_spot_over_strike() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::SpotOverStrike));
    let positions = vec![atm_put_30d()];

    let result = aggregator.run_scenario(&positions, &atm_skew_scenario()).unwrap();
    let put = &result.position_results[0];

    // Moneyness 0.95 is ATM with beta 1.2; 30 DTE has time beta 1.0
    let expected_iv = 0.30 * (1.0 + 0.35 * 1.2 * 1.0);
    assert_relative_eq!(put.scenario_iv.unwrap(), expected_iv, epsilon = 1e-12);

    let expected_value = reference_put(95.0, 100.0, 30.0 / 365.0, expected_iv, 0.05) * 100.0;
    assert_relative_eq!(put.scenario_value, expected_value, epsilon = 1e-6);
    assert_relative_eq!(put.current_value, 360.0, epsilon = 1e-9);
    assert_relative_eq!(result.pnl, expected_value - 360.0, epsilon = 1e-6);
    assert!(put.repriced);
}

#[test]
fn test_atm_put_skew_shock_direction_adjusted() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let positions = vec![atm_put_30d()];

    let result = aggregator.run_scenario(&positions, &atm_skew_scenario()).unwrap();
    let put = &result.position_results[0];

    // strike/spot = 1.053 classifies as ITM_PUT, which has no multiplier
    assert_relative_eq!(put.scenario_iv.unwrap(), 0.30, epsilon = 1e-12);

    let expected_value = reference_put(95.0, 100.0, 30.0 / 365.0, 0.30, 0.05) * 100.0;
    assert_relative_eq!(put.scenario_value, expected_value, epsilon = 1e-6);
}

/// Positions marked at the model's own prices
fn model_marked_book(aggregator: &ScenarioAggregator) -> Vec<Position> {
    let kernel = aggregator.kernel();
    let legs = [
        ("SPY", 500.0, 510.0, OptionType::Call, 21_i64, 0.16, 3.0),
        ("SPY", 500.0, 480.0, OptionType::Put, 45, 0.21, -2.0),
        ("QQQ", 440.0, 440.0, OptionType::Call, 5, 0.24, 1.0),
        ("QQQ", 440.0, 400.0, OptionType::Put, 120, 0.29, 4.0),
    ];

    let mut positions = vec![
        Position::stock("SPY", 100.0, 480.0, 500.0),
        Position::stock("QQQ", -50.0, 450.0, 440.0),
    ];

    for (underlying, spot, strike, option_type, dte, iv, quantity) in legs {
        let input = OptionInput::new(spot, strike, dte as f64 / 365.0, iv, option_type);
        let mark = kernel.price(&input);
        let leg = OptionLeg::new(underlying, strike, option_type)
            .with_expiration(valuation_date() + Duration::days(dte))
            .with_implied_volatility(iv);
        positions.push(Position::option(
            format!("{} {}D {:?} {}", underlying, dte, option_type, strike),
            quantity,
            mark,
            mark,
            leg,
        ));
    }

    positions
}

#[test]
fn test_zero_change_scenario_is_idempotent() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let positions = model_marked_book(&aggregator);

    for spec in [
        ScenarioSpec::new("Flat", 0.0),
        ScenarioCatalog::builtin().get("Normal Day").unwrap().clone(),
    ] {
        let result = aggregator.run_scenario(&positions, &spec).unwrap();
        assert_eq!(result.pnl, 0.0, "scenario {}", spec.name);
        assert_eq!(result.scenario_value, result.current_value);
        for position in &result.position_results {
            assert_eq!(position.scenario_value, position.current_value, "{}", position.symbol);
            assert!(position.repriced);
        }
    }
}

/// Fails every option struck at 105, prices the rest with Black-Scholes
struct FlakyPricer {
    inner: BlackScholes,
}

impl OptionPricer for FlakyPricer {
    fn price_option(&self, input: &OptionInput, diagnostics: &mut Diagnostics) -> Result<f64> {
        if input.strike == 105.0 {
            return Err(ScenarioError::PricingFailed {
                symbol: "XYZ".to_string(),
                reason: "quote feed down".to_string(),
            });
        }
        self.inner.price_option(input, diagnostics)
    }
}

#[test]
fn test_failed_position_keeps_current_value() {
    let config = config(MoneynessConvention::DirectionAdjusted);
    let pricer = Arc::new(FlakyPricer {
        inner: BlackScholes::new(config.risk_free_rate),
    });
    let aggregator = ScenarioAggregator::with_pricer(config, pricer);

    let expiry = valuation_date() + Duration::days(30);
    let positions = vec![
        Position::stock("XYZ", 100.0, 95.0, 100.0),
        Position::option(
            "XYZ C100",
            2.0,
            3.0,
            3.5,
            OptionLeg::new("XYZ", 100.0, OptionType::Call)
                .with_expiration(expiry)
                .with_implied_volatility(0.3),
        ),
        Position::option(
            "XYZ C105",
            2.0,
            1.0,
            1.5,
            OptionLeg::new("XYZ", 105.0, OptionType::Call)
                .with_expiration(expiry)
                .with_implied_volatility(0.3),
        ),
    ];

    let result = aggregator
        .run_scenario(&positions, &ScenarioSpec::new("Rally", 0.05))
        .unwrap();

    assert_eq!(result.position_results.len(), 3);

    let failed = &result.position_results[2];
    assert!(!failed.repriced);
    assert_eq!(failed.scenario_value, failed.current_value);
    assert_eq!(failed.pnl, 0.0);
    assert!(failed.scenario_iv.is_none());

    assert!(result.position_results[0].repriced);
    assert!(result.position_results[1].repriced);
    assert!(result.position_results[1].pnl > 0.0);
    assert_relative_eq!(result.position_results[0].pnl, 500.0, epsilon = 1e-9);

    let failures: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::PositionRepriceFailure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].subject, "XYZ C105");
    assert!(failures[0].message.contains("quote feed down"));
}

#[test]
fn test_var_ordering_over_builtin_catalog() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let positions = model_marked_book(&aggregator);

    let batch = aggregator.run_many(&positions, &ScenarioCatalog::builtin());
    assert_eq!(batch.len(), 16);
    assert!(batch.diagnostics.is_empty());

    let var_99 = ScenarioAggregator::value_at_risk(&batch, 0.99).unwrap();
    let var_95 = ScenarioAggregator::value_at_risk(&batch, 0.95).unwrap();
    let var_50 = ScenarioAggregator::value_at_risk(&batch, 0.50).unwrap();
    assert!(var_99 <= var_95);
    assert!(var_95 <= var_50);

    let worst = batch.iter().map(|r| r.pnl).fold(f64::INFINITY, f64::min);
    assert_eq!(var_99, worst);

    let drawdown = ScenarioAggregator::max_drawdown(&batch);
    assert_eq!(drawdown.max_drawdown, worst.min(0.0));
}

#[test]
fn test_run_many_omits_malformed_scenario() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let positions = model_marked_book(&aggregator);
    let snapshot = positions.clone();

    let scenarios = vec![
        ScenarioSpec::new("Dip", -0.03),
        ScenarioSpec::new("Wipeout", -1.5),
        ScenarioSpec::new("Pop", 0.03).with_iv_change(-0.1),
    ];

    let batch = aggregator.run_many(&positions, &scenarios);

    assert_eq!(batch.results.keys().collect::<Vec<_>>(), vec!["Dip", "Pop"]);
    assert_eq!(batch.diagnostics.count(DiagnosticKind::ScenarioFailure), 1);
    assert_eq!(batch.diagnostics.iter().next().unwrap().subject, "Wipeout");
    assert_eq!(positions, snapshot);
}

#[test]
fn test_model_greeks_are_additive() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let positions = model_marked_book(&aggregator);

    let (with_greeks, diagnostics) = aggregator.with_model_greeks(&positions);
    assert!(diagnostics.is_empty());

    let metrics = aggregator.current_metrics(&with_greeks);
    assert!(metrics.diagnostics.is_empty());

    let mut expected = Greeks::ZERO;
    for position in &with_greeks {
        match &position.option {
            Some(leg) => expected += leg.greeks.unwrap().scale(position.quantity * leg.multiplier),
            None => expected.delta += position.quantity,
        }
    }

    assert_relative_eq!(metrics.greeks.delta, expected.delta, epsilon = 1e-9);
    assert_relative_eq!(metrics.greeks.gamma, expected.gamma, epsilon = 1e-9);
    assert_relative_eq!(metrics.greeks.theta, expected.theta, epsilon = 1e-9);
    assert_relative_eq!(metrics.greeks.vega, expected.vega, epsilon = 1e-9);
    assert_relative_eq!(metrics.greeks.rho, expected.rho, epsilon = 1e-9);

    // Stock delta alone: 100 SPY long, 50 QQQ short
    let stock_only = aggregator.current_metrics(&with_greeks[..2]);
    assert_relative_eq!(stock_only.greeks.delta, 50.0, epsilon = 1e-12);
}

#[test]
fn test_load_engine_config() {
    let config_path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/engine.yaml");
    let yaml = fs::read_to_string(config_path).expect("Failed to read engine config");

    let config = EngineConfig::from_yaml(&yaml).expect("Failed to parse engine config");

    assert_eq!(config.risk_free_rate, 0.045);
    assert_eq!(config.valuation_date, valuation_date());
    assert_eq!(config.moneyness_convention, MoneynessConvention::SpotOverStrike);
    assert_eq!(config.parallel.max_threads, Some(4));
    assert_eq!(config.implied_vol.max_iterations, 100);
    assert_eq!(config.batch_deadline_ms, Some(30_000));
}

#[test]
fn test_load_earnings_catalog() {
    let catalog_path = concat!(env!("CARGO_MANIFEST_DIR"), "/scenarios/earnings_week.yaml");
    let yaml = fs::read_to_string(catalog_path).expect("Failed to read scenario catalog");

    let catalog = ScenarioCatalog::from_yaml(&yaml).expect("Failed to parse scenario catalog");
    assert_eq!(catalog.version(), 2);
    assert_eq!(
        catalog.names().collect::<Vec<_>>(),
        vec!["Gap Down Crush", "Gap Up Crush", "Skew Bid", "Drift Into Print"]
    );
    assert_eq!(catalog.get("Drift Into Print").unwrap().days_pass, 3);

    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let expiry = valuation_date() + Duration::days(4);
    let straddle = vec![
        Position::option(
            "XYZ C100",
            1.0,
            4.0,
            4.0,
            OptionLeg::new("XYZ", 100.0, OptionType::Call)
                .with_expiration(expiry)
                .with_underlying_price(100.0)
                .with_implied_volatility(0.80),
        ),
        Position::option(
            "XYZ P100",
            1.0,
            4.0,
            4.0,
            OptionLeg::new("XYZ", 100.0, OptionType::Put)
                .with_expiration(expiry)
                .with_underlying_price(100.0)
                .with_implied_volatility(0.80),
        ),
    ];

    let batch = aggregator.run_many(&straddle, &catalog);
    assert_eq!(batch.len(), 4);

    // Front-week bucket scales flat, whatever the moneyness
    let crash = batch.get("Gap Down Crush").unwrap();
    for position in &crash.position_results {
        assert_relative_eq!(position.scenario_iv.unwrap(), 0.80 * (1.0 - 0.45), epsilon = 1e-12);
    }

    let summary = ScenarioAggregator::scenario_summary(&batch);
    assert_eq!(summary.len(), 4);
    assert!(summary.windows(2).all(|pair| pair[0].pnl <= pair[1].pnl));
}

#[test]
fn test_earnings_inline_crush_on_front_week_leg() {
    let aggregator = ScenarioAggregator::new(config(MoneynessConvention::DirectionAdjusted));
    let leg = OptionLeg::new("XYZ", 100.0, OptionType::Call)
        .with_expiration(valuation_date() + Duration::days(5))
        .with_underlying_price(100.0)
        .with_implied_volatility(0.30);
    let positions = vec![Position::option("XYZ 5D C100", 1.0, 2.0, 2.0, leg)];

    let catalog = ScenarioCatalog::builtin();
    let spec = catalog.get("Earnings Inline").unwrap();
    let result = aggregator.run_scenario(&positions, spec).unwrap();
    let call = &result.position_results[0];

    // "0-7" bucket is -0.40, applied without the 1.5 short-dated time beta
    assert_relative_eq!(call.scenario_iv.unwrap(), 0.30 * (1.0 - 0.40), epsilon = 1e-12);

    // One day passes: repriced at 4 DTE
    let expected = aggregator
        .kernel()
        .price(&OptionInput::new(100.0, 100.0, 4.0 / 365.0, 0.30 * (1.0 - 0.40), OptionType::Call));
    assert_relative_eq!(call.scenario_value, expected * 100.0, epsilon = 1e-9);
}
