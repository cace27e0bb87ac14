//! Vectorized batch pricing over column arrays
//!
//! Each element goes through the same closed form as [`BlackScholes::price`],
//! so for volatilities at or above [`MIN_BATCH_VOLATILITY`] a batch is
//! bit-for-bit equal to repeated scalar calls. Large batches are split across
//! the rayon pool.

use super::black_scholes::{
    closed_form_price, floor_price_input, intrinsic_value, BlackScholes, OptionType,
};
use crate::error::{Result, ScenarioError};
use rayon::prelude::*;

/// Volatility floor applied to every batch element
pub const MIN_BATCH_VOLATILITY: f64 = 0.01;

impl BlackScholes {
    /// Price equal-length arrays of options
    ///
    /// Entries with a non-positive expiry are valued at intrinsic value.
    /// `dividend_yields` defaults to zero for every entry when `None`.
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::{BlackScholes, OptionType};
    ///
    /// let kernel = BlackScholes::new(0.05);
    /// let prices = kernel
    ///     .batch(
    ///         &[100.0, 110.0],
    ///         &[100.0, 100.0],
    ///         &[1.0, 0.0],
    ///         &[0.20, 0.20],
    ///         &[OptionType::Call, OptionType::Call],
    ///         None,
    ///     )
    ///     .unwrap();
    ///
    /// assert!((prices[0] - 10.4506).abs() < 1e-4);
    /// assert_eq!(prices[1], 10.0);
    /// ```
    pub fn batch(
        &self,
        spots: &[f64],
        strikes: &[f64],
        expiries: &[f64],
        volatilities: &[f64],
        option_types: &[OptionType],
        dividend_yields: Option<&[f64]>,
    ) -> Result<Vec<f64>> {
        let n = spots.len();
        let lengths = [
            ("strikes", strikes.len()),
            ("expiries", expiries.len()),
            ("volatilities", volatilities.len()),
            ("option_types", option_types.len()),
            ("dividend_yields", dividend_yields.map_or(n, <[f64]>::len)),
        ];
        if let Some((name, len)) = lengths.iter().find(|(_, len)| *len != n) {
            return Err(ScenarioError::InvalidParameter(format!(
                "batch input '{}' has {} entries, expected {}",
                name, len, n
            )));
        }

        let r = self.risk_free_rate();
        let evaluate = |i: usize| -> f64 {
            let t = expiries[i];
            if t <= 0.0 {
                return intrinsic_value(spots[i], strikes[i], option_types[i]);
            }
            closed_form_price(
                floor_price_input(spots[i]),
                floor_price_input(strikes[i]),
                t,
                volatilities[i].max(MIN_BATCH_VOLATILITY),
                r,
                dividend_yields.map_or(0.0, |q| q[i]),
                option_types[i],
            )
        };

        let prices = if self.parallel.should_parallelize(n) {
            tracing::debug!(entries = n, "Pricing batch in parallel");
            (0..n).into_par_iter().map(evaluate).collect()
        } else {
            (0..n).map(evaluate).collect()
        };

        Ok(prices)
    }
}
