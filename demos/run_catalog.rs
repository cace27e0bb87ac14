//! Scenario catalog example
//!
//! Revalues a small options book under the built-in scenario catalog plus a
//! custom scenario, then prints VaR, the worst scenarios and P&L correlation.
//!
//! Run with: cargo run --example run_catalog

use ag_scenario::{
    init_tracing, EngineConfig, OptionLeg, OptionType, Position, ScenarioAggregator,
    ScenarioCatalog, ScenarioSpec,
};
use chrono::{Duration, NaiveDate};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    println!("=== Scenario Catalog Example ===\n");

    // 1. Engine configuration
    let today = NaiveDate::from_ymd_opt(2024, 6, 3).ok_or("invalid date")?;
    let config = EngineConfig::default().with_valuation_date(today);
    let aggregator = ScenarioAggregator::new(config);

    // 2. Portfolio: long stock, a protective put, a covered call and a short-dated call
    let positions = vec![
        Position::stock("AAPL", 200.0, 170.0, 192.0),
        Position::option(
            "AAPL P180",
            2.0,
            3.10,
            2.45,
            OptionLeg::new("AAPL", 180.0, OptionType::Put)
                .with_expiration(today + Duration::days(45))
                .with_implied_volatility(0.24),
        ),
        Position::option(
            "AAPL C210",
            -2.0,
            2.80,
            1.95,
            OptionLeg::new("AAPL", 210.0, OptionType::Call)
                .with_expiration(today + Duration::days(30))
                .with_implied_volatility(0.22),
        ),
        Position::option(
            "NVDA C1200",
            1.0,
            28.0,
            41.0,
            // No IV on file: backed out of the current price below
            OptionLeg::new("NVDA", 1200.0, OptionType::Call)
                .with_expiration(today + Duration::days(4))
                .with_underlying_price(1150.0),
        ),
    ];

    let (positions, diagnostics) = aggregator.with_model_greeks(&positions);
    let metrics = aggregator.current_metrics(&positions);
    println!("Portfolio value: ${:.2}", metrics.total_value);
    println!(
        "  Delta {:.1}  Gamma {:.3}  Theta {:.2}/day  Vega {:.2}/vol pt",
        metrics.greeks.delta, metrics.greeks.gamma, metrics.greeks.theta, metrics.greeks.vega
    );
    println!("  Largest position: {:.1}% of value", metrics.max_concentration);
    for diagnostic in diagnostics.iter() {
        println!("  note: {}", diagnostic);
    }
    println!();

    // 3. Built-in templates plus one custom scenario
    let mut catalog = ScenarioCatalog::builtin();
    catalog.insert(ScenarioSpec::custom("Vol Crush Rally", 0.03, Some(-0.25), None, 1))?;
    println!("Catalog v{} with {} scenarios\n", catalog.version(), catalog.len());

    let batch = aggregator.run_many(&positions, &catalog);

    // 4. Scenario table, worst first
    println!("{:<20} {:>12} {:>9}  {}", "Scenario", "P&L", "P&L %", "Worst position");
    for row in ScenarioAggregator::scenario_summary(&batch) {
        println!(
            "{:<20} {:>12.2} {:>8.2}%  {} ({:.2})",
            row.scenario,
            row.pnl,
            row.pnl_pct,
            row.worst_position.as_deref().unwrap_or("-"),
            row.worst_pnl
        );
    }
    println!();

    // 5. Risk summary
    for confidence in [0.95, 0.99] {
        let var = ScenarioAggregator::value_at_risk(&batch, confidence)?;
        let var_pct = ScenarioAggregator::value_at_risk_pct(&batch, confidence)?;
        println!("VaR {:.0}%: ${:.2} ({:.2}%)", confidence * 100.0, var, var_pct);
    }

    let drawdown = ScenarioAggregator::max_drawdown(&batch);
    println!(
        "Max drawdown: ${:.2} in {}",
        drawdown.max_drawdown,
        drawdown.worst_scenario.as_deref().unwrap_or("-")
    );
    println!();

    // 6. Which positions move together across scenarios
    let correlation = ScenarioAggregator::correlation_matrix(&positions, &batch)?;
    println!("P&L correlation:");
    for a in &correlation.symbols {
        let row: Vec<String> = correlation
            .symbols
            .iter()
            .map(|b| match correlation.get(a, b) {
                Some(rho) if rho.is_finite() => format!("{:>6.2}", rho),
                _ => format!("{:>6}", "n/a"),
            })
            .collect();
        println!("  {:<12} {}", a, row.join(" "));
    }

    Ok(())
}
