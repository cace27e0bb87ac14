//! Newton-Raphson implied volatility solver
//!
//! The solve never fails: a non-converged or degenerate search returns its
//! last iterate with `converged = false` and a diagnostic explaining why.

use super::black_scholes::{closed_form_price, floor_price_input, BlackScholes, OptionType};
use crate::config::ImpliedVolConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use serde::{Deserialize, Serialize};

/// Vega (per unit of volatility) below which a Newton step is meaningless
const VEGA_FLOOR: f64 = 1e-12;

/// Outcome of an implied volatility solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpliedVolResult {
    /// Best volatility estimate found
    pub volatility: f64,

    /// Number of model evaluations performed
    pub iterations: usize,

    /// Whether the model price matched the observed price within tolerance
    pub converged: bool,

    /// Warnings raised during the search
    pub diagnostics: Diagnostics,
}

impl BlackScholes {
    /// Solve for the volatility that reproduces `observed_price`
    ///
    /// The search starts at the configured initial guess, clamps every
    /// iterate to the configured volatility bounds and stops early when vega
    /// collapses. Use [`BlackScholes::with_solver`] to change the iteration
    /// budget or tolerance.
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::{BlackScholes, OptionInput, OptionType};
    ///
    /// let kernel = BlackScholes::new(0.05);
    /// let price = kernel.price(&OptionInput::new(100.0, 105.0, 0.5, 0.42, OptionType::Call));
    ///
    /// let result = kernel.implied_vol(price, 100.0, 105.0, 0.5, OptionType::Call, 0.0);
    /// assert!(result.converged);
    /// assert!((result.volatility - 0.42).abs() < 1e-3);
    /// ```
    pub fn implied_vol(
        &self,
        observed_price: f64,
        spot: f64,
        strike: f64,
        time_to_expiry: f64,
        option_type: OptionType,
        dividend_yield: f64,
    ) -> ImpliedVolResult {
        let mut diagnostics = Diagnostics::new();
        let fallback;
        let solver = match self.solver.validate() {
            Ok(()) => &self.solver,
            Err(e) => {
                diagnostics.push(
                    DiagnosticKind::InvalidInput,
                    "implied_vol",
                    format!("{}; using default solver settings", e),
                );
                fallback = ImpliedVolConfig::default();
                &fallback
            }
        };
        let mut sigma = solver.initial_guess.clamp(solver.min_volatility, solver.max_volatility);

        if !observed_price.is_finite() || observed_price < 0.0 {
            diagnostics.push(
                DiagnosticKind::InvalidInput,
                "implied_vol",
                format!("Observed price {} is not a valid option price", observed_price),
            );
            return ImpliedVolResult {
                volatility: sigma,
                iterations: 0,
                converged: false,
                diagnostics,
            };
        }

        if time_to_expiry <= 0.0 {
            diagnostics.push(
                DiagnosticKind::ConvergenceFailure,
                "implied_vol",
                "Option has expired, price carries no volatility information",
            );
            return ImpliedVolResult {
                volatility: sigma,
                iterations: 0,
                converged: false,
                diagnostics,
            };
        }

        let s = floor_price_input(spot);
        let k = floor_price_input(strike);
        let r = self.risk_free_rate();

        for iteration in 1..=solver.max_iterations {
            let model_price =
                closed_form_price(s, k, time_to_expiry, sigma, r, dividend_yield, option_type);
            let diff = model_price - observed_price;

            if diff.abs() < solver.price_tolerance {
                tracing::trace!(
                    iterations = iteration,
                    volatility = sigma,
                    "Implied volatility converged"
                );
                return ImpliedVolResult {
                    volatility: sigma,
                    iterations: iteration,
                    converged: true,
                    diagnostics,
                };
            }

            let vega = self.raw_vega(s, k, time_to_expiry, sigma, dividend_yield);
            if !(vega > VEGA_FLOOR) {
                diagnostics.push(
                    DiagnosticKind::ConvergenceFailure,
                    "implied_vol",
                    format!(
                        "Vega collapsed at volatility {:.4} after {} iterations (error {:.6})",
                        sigma, iteration, diff
                    ),
                );
                return ImpliedVolResult {
                    volatility: sigma,
                    iterations: iteration,
                    converged: false,
                    diagnostics,
                };
            }

            sigma = (sigma - diff / vega).clamp(solver.min_volatility, solver.max_volatility);
        }

        diagnostics.push(
            DiagnosticKind::ConvergenceFailure,
            "implied_vol",
            format!(
                "No convergence within {} iterations, returning {:.4}",
                solver.max_iterations, sigma
            ),
        );

        ImpliedVolResult {
            volatility: sigma,
            iterations: solver.max_iterations,
            converged: false,
            diagnostics,
        }
    }
}
