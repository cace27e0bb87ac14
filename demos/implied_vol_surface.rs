//! Implied volatility surface example
//!
//! Generates quotes from a synthetic volatility smile, backs the implied
//! volatility out of every quote and reprices the whole grid in one batch.
//!
//! Run with: cargo run --example implied_vol_surface

use ag_scenario::analytics::iv_rank;
use ag_scenario::{init_tracing, BlackScholes, EngineConfig, OptionInput, OptionType};

/// Skewed smile: puts richer than calls, short expiries steeper
fn smile(moneyness: f64, years: f64) -> f64 {
    let skew = -0.35 * (moneyness - 1.0);
    let curvature = 0.9 * (moneyness - 1.0).powi(2);
    (0.20 + (skew + curvature) / years.sqrt().max(0.25)).max(0.05)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    println!("=== Implied Volatility Surface Example ===\n");

    let config = EngineConfig::default();
    let kernel = BlackScholes::new(config.risk_free_rate).with_solver(config.implied_vol.clone());

    let spot = 100.0;
    let strikes = [80.0, 90.0, 95.0, 100.0, 105.0, 110.0, 120.0];
    let expiries = [30.0 / 365.0, 90.0 / 365.0, 0.5, 1.0];

    // 1. Quotes from the smile; OTM puts below spot, OTM calls above
    let mut quotes = Vec::new();
    for &t in &expiries {
        for &strike in &strikes {
            let option_type = if strike < spot {
                OptionType::Put
            } else {
                OptionType::Call
            };
            let vol = smile(strike / spot, t);
            let price = kernel.price(&OptionInput::new(spot, strike, t, vol, option_type));
            quotes.push((strike, t, option_type, price, vol));
        }
    }

    // 2. Back out the surface
    print!("{:>8}", "T \\ K");
    for strike in &strikes {
        print!("{:>9.0}", strike);
    }
    println!();

    let mut solved_vols = Vec::with_capacity(quotes.len());
    let mut failures = 0;
    for row in quotes.chunks(strikes.len()) {
        print!("{:>7.0}d", row[0].1 * 365.0);
        for &(strike, t, option_type, price, _) in row {
            let result = kernel.implied_vol(price, spot, strike, t, option_type, 0.0);
            if result.converged {
                print!("{:>8.1}%", result.volatility * 100.0);
            } else {
                failures += 1;
                print!("{:>9}", "--");
            }
            solved_vols.push(result.volatility);
        }
        println!();
    }
    println!("\n{} of {} quotes failed to converge\n", failures, quotes.len());

    // 3. Reprice the grid at the solved volatilities in one call
    let spots = vec![spot; quotes.len()];
    let grid_strikes: Vec<f64> = quotes.iter().map(|q| q.0).collect();
    let grid_expiries: Vec<f64> = quotes.iter().map(|q| q.1).collect();
    let grid_types: Vec<OptionType> = quotes.iter().map(|q| q.2).collect();

    let repriced = kernel.batch(
        &spots,
        &grid_strikes,
        &grid_expiries,
        &solved_vols,
        &grid_types,
        None,
    )?;
    let max_error = quotes
        .iter()
        .zip(&repriced)
        .map(|(quote, price)| (quote.3 - price).abs())
        .fold(0.0, f64::max);
    println!("Max repricing error: {:.6}", max_error);

    let max_vol_error = quotes
        .iter()
        .zip(&solved_vols)
        .map(|(quote, vol)| (quote.4 - vol).abs())
        .fold(0.0, f64::max);
    println!("Max volatility error: {:.4}%", max_vol_error * 100.0);

    // 4. Where does the 30-day ATM vol sit within the surface?
    let atm_index = strikes.iter().position(|k| *k == spot).unwrap_or(0);
    let rank = iv_rank(solved_vols[atm_index], &solved_vols)?;
    println!(
        "\n30d ATM IV {:.1}%: rank {:.0}, percentile {:.0} (range {:.1}%-{:.1}%)",
        rank.current * 100.0,
        rank.rank,
        rank.percentile,
        rank.min * 100.0,
        rank.max * 100.0
    );

    Ok(())
}
