//! Position-level risk analytics
//!
//! - Greeks exposure: net delta and gamma split into long and short sides
//! - Concentration: positions whose value exceeds a share of the portfolio
//! - IV rank / IV percentile of a volatility against its own history

use crate::error::{Result, ScenarioError};
use crate::position::Position;
use serde::{Deserialize, Serialize};

/// Concentration threshold used by alerting collaborators
pub const DEFAULT_CONCENTRATION_THRESHOLD: f64 = 0.25;

/// Portfolio Greeks split by direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GreeksExposure {
    pub total_delta: f64,
    pub delta_long: f64,
    pub delta_short: f64,
    pub total_gamma: f64,
    pub gamma_long: f64,
    pub gamma_short: f64,
    pub total_theta: f64,
    pub total_vega: f64,
}

/// A position above the concentration threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concentration {
    pub symbol: String,

    /// Share of portfolio value, in percent
    pub concentration_pct: f64,

    pub value: f64,

    /// Threshold that was exceeded, in percent
    pub threshold_pct: f64,
}

/// Where a volatility sits within its history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvRank {
    /// (current - min) / (max - min), scaled to 0-100; 50 for a flat history
    pub rank: f64,

    /// Share of history strictly below the current value, 0-100
    pub percentile: f64,

    pub current: f64,
    pub min: f64,
    pub max: f64,
}

/// Delta, gamma, theta and vega exposure across positions
///
/// Options contribute last known Greeks weighted by quantity * multiplier;
/// stock contributes its quantity as delta. A position counts toward the
/// long side only when its exposure is strictly positive.
pub fn greeks_exposure(positions: &[Position]) -> GreeksExposure {
    let mut exposure = GreeksExposure::default();

    for position in positions {
        let (delta, gamma, theta, vega) = match &position.option {
            Some(leg) => match leg.greeks {
                Some(greeks) => {
                    let weighted = greeks.scale(position.quantity * leg.multiplier);
                    (weighted.delta, weighted.gamma, weighted.theta, weighted.vega)
                }
                None => continue,
            },
            None => (position.quantity, 0.0, 0.0, 0.0),
        };

        exposure.total_delta += delta;
        if delta > 0.0 {
            exposure.delta_long += delta;
        } else {
            exposure.delta_short += delta;
        }

        if position.is_option() {
            exposure.total_gamma += gamma;
            if gamma > 0.0 {
                exposure.gamma_long += gamma;
            } else {
                exposure.gamma_short += gamma;
            }
        }

        exposure.total_theta += theta;
        exposure.total_vega += vega;
    }

    exposure
}

/// Positions whose value exceeds `threshold` of `portfolio_value`, largest first
///
/// Nothing is reported when the portfolio value is not positive.
pub fn risk_concentrations(
    positions: &[Position],
    portfolio_value: f64,
    threshold: f64,
) -> Vec<Concentration> {
    if portfolio_value <= 0.0 {
        return Vec::new();
    }

    let mut concentrations: Vec<Concentration> = positions
        .iter()
        .filter_map(|position| {
            let value = position.position_value();
            let share = value / portfolio_value;
            (share > threshold).then(|| Concentration {
                symbol: position.symbol.clone(),
                concentration_pct: share * 100.0,
                value,
                threshold_pct: threshold * 100.0,
            })
        })
        .collect();

    concentrations.sort_by(|a, b| b.concentration_pct.total_cmp(&a.concentration_pct));
    concentrations
}

/// IV rank and percentile of `current_iv` against `history`
///
/// # Example
///
/// ```
/// use ag_scenario::analytics::iv_rank;
///
/// let rank = iv_rank(0.30, &[0.20, 0.25, 0.40]).unwrap();
/// assert!((rank.rank - 50.0).abs() < 1e-9);
/// assert!((rank.percentile - 200.0 / 3.0).abs() < 1e-9);
/// ```
pub fn iv_rank(current_iv: f64, history: &[f64]) -> Result<IvRank> {
    if history.is_empty() {
        return Err(ScenarioError::InsufficientData("No IV history".to_string()));
    }
    if !current_iv.is_finite() || history.iter().any(|iv| !iv.is_finite()) {
        return Err(ScenarioError::InvalidParameter(
            "IV values must be finite".to_string(),
        ));
    }

    let min = history.iter().copied().fold(f64::INFINITY, f64::min);
    let max = history.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let rank = if max > min {
        (current_iv - min) / (max - min) * 100.0
    } else {
        50.0
    };

    let below = history.iter().filter(|iv| **iv < current_iv).count();
    let percentile = below as f64 / history.len() as f64 * 100.0;

    Ok(IvRank {
        rank,
        percentile,
        current: current_iv,
        min,
        max,
    })
}
