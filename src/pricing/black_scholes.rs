//! Closed-form Black-Scholes-Merton pricing and Greeks for European options
//!
//! - Delta (∂V/∂S): Sensitivity to underlying price
//! - Gamma (∂²V/∂S²): Rate of change of Delta
//! - Vega (∂V/∂σ): Sensitivity to volatility, per 1 vol point
//! - Theta (∂V/∂t): Time decay, per calendar day
//! - Rho (∂V/∂r): Sensitivity to interest rate, per 1% rate move
//!
//! Inputs outside the model's domain are clamped rather than rejected: a
//! non-positive volatility becomes [`DEFAULT_VOLATILITY`], a non-positive spot
//! or strike becomes [`MIN_PRICE_INPUT`]. Every clamp is reported through
//! [`Diagnostics`].

use crate::config::{ImpliedVolConfig, ParallelConfig};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::{Result, ScenarioError};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::{PI, SQRT_2};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Volatility substituted for non-positive inputs
pub const DEFAULT_VOLATILITY: f64 = 0.30;

/// Smallest spot or strike the closed form is evaluated with
pub const MIN_PRICE_INPUT: f64 = 1e-8;

/// Option type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(alias = "C", alias = "CALL", alias = "call")]
    Call,
    #[serde(alias = "P", alias = "PUT", alias = "put")]
    Put,
}

/// Greeks for a single option, or a weighted sum of them
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta: ∂V/∂S
    pub delta: f64,

    /// Gamma: ∂²V/∂S²
    pub gamma: f64,

    /// Theta: ∂V/∂t (per day)
    pub theta: f64,

    /// Vega: ∂V/∂σ (per 1% change in volatility)
    pub vega: f64,

    /// Rho: ∂V/∂r (per 1% change in interest rate)
    pub rho: f64,
}

impl Greeks {
    pub const ZERO: Greeks = Greeks {
        delta: 0.0,
        gamma: 0.0,
        theta: 0.0,
        vega: 0.0,
        rho: 0.0,
    };

    /// Multiply every sensitivity by `factor` (e.g. quantity * multiplier)
    pub fn scale(&self, factor: f64) -> Greeks {
        Greeks {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            theta: self.theta * factor,
            vega: self.vega * factor,
            rho: self.rho * factor,
        }
    }
}

impl Add for Greeks {
    type Output = Greeks;

    fn add(self, other: Greeks) -> Greeks {
        Greeks {
            delta: self.delta + other.delta,
            gamma: self.gamma + other.gamma,
            theta: self.theta + other.theta,
            vega: self.vega + other.vega,
            rho: self.rho + other.rho,
        }
    }
}

impl AddAssign for Greeks {
    fn add_assign(&mut self, other: Greeks) {
        *self = *self + other;
    }
}

impl Sum for Greeks {
    fn sum<I: Iterator<Item = Greeks>>(iter: I) -> Greeks {
        iter.fold(Greeks::ZERO, Add::add)
    }
}

/// Inputs to a single closed-form evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptionInput {
    /// Underlying spot price
    pub spot: f64,

    /// Strike price
    pub strike: f64,

    /// Time to expiration in years
    pub time_to_expiry: f64,

    /// Annualized volatility (0.30 = 30%)
    pub volatility: f64,

    /// Call or put
    pub option_type: OptionType,

    /// Continuous dividend yield
    #[serde(default)]
    pub dividend_yield: f64,
}

impl OptionInput {
    pub fn new(
        spot: f64,
        strike: f64,
        time_to_expiry: f64,
        volatility: f64,
        option_type: OptionType,
    ) -> Self {
        Self {
            spot,
            strike,
            time_to_expiry,
            volatility,
            option_type,
            dividend_yield: 0.0,
        }
    }

    pub fn with_dividend_yield(mut self, dividend_yield: f64) -> Self {
        self.dividend_yield = dividend_yield;
        self
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }
}

/// Repricing seam used by the scenario aggregator
///
/// [`BlackScholes`] is the production implementation; alternative models or
/// test doubles can be injected through
/// [`ScenarioAggregator::with_pricer`](crate::ScenarioAggregator::with_pricer).
pub trait OptionPricer: Send + Sync {
    /// Price one option, recording any input corrections in `diagnostics`
    fn price_option(&self, input: &OptionInput, diagnostics: &mut Diagnostics) -> Result<f64>;
}

/// Black-Scholes-Merton pricing kernel
#[derive(Debug, Clone)]
pub struct BlackScholes {
    risk_free_rate: f64,
    pub(crate) solver: ImpliedVolConfig,
    pub(crate) parallel: ParallelConfig,
}

impl BlackScholes {
    /// Create a kernel with the given annual risk-free rate
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            solver: ImpliedVolConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }

    /// Override the implied volatility solver settings
    pub fn with_solver(mut self, solver: ImpliedVolConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Override when batch pricing switches to the rayon pool
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Option price; input corrections are logged and discarded
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::{BlackScholes, OptionInput, OptionType};
    ///
    /// let kernel = BlackScholes::new(0.05);
    /// let price = kernel.price(&OptionInput::new(100.0, 100.0, 1.0, 0.20, OptionType::Call));
    /// assert!((price - 10.4506).abs() < 1e-4);
    ///
    /// // Expired options are worth exactly their intrinsic value
    /// let expired = kernel.price(&OptionInput::new(110.0, 100.0, 0.0, 0.20, OptionType::Call));
    /// assert_eq!(expired, 10.0);
    /// ```
    pub fn price(&self, input: &OptionInput) -> f64 {
        self.price_with_diagnostics(input, &mut Diagnostics::new())
    }

    /// Option price, recording input corrections in `diagnostics`
    pub fn price_with_diagnostics(
        &self,
        input: &OptionInput,
        diagnostics: &mut Diagnostics,
    ) -> f64 {
        if input.time_to_expiry <= 0.0 {
            return intrinsic_value(input.spot, input.strike, input.option_type);
        }

        let (spot, strike, volatility) = sanitize(input, "price", diagnostics);
        closed_form_price(
            spot,
            strike,
            input.time_to_expiry,
            volatility,
            self.risk_free_rate,
            input.dividend_yield,
            input.option_type,
        )
    }

    /// Greeks; input corrections are logged and discarded
    pub fn greeks(&self, input: &OptionInput) -> Greeks {
        self.greeks_with_diagnostics(input, &mut Diagnostics::new())
    }

    /// Greeks, recording input corrections in `diagnostics`
    ///
    /// At or past expiry delta is 1.0 for an in-the-money call and 0.0
    /// otherwise; every other sensitivity is 0.0.
    pub fn greeks_with_diagnostics(
        &self,
        input: &OptionInput,
        diagnostics: &mut Diagnostics,
    ) -> Greeks {
        let t = input.time_to_expiry;
        if t <= 0.0 {
            let itm_call = input.option_type == OptionType::Call && input.spot > input.strike;
            return Greeks {
                delta: if itm_call { 1.0 } else { 0.0 },
                ..Greeks::ZERO
            };
        }

        let (s, k, sigma) = sanitize(input, "greeks", diagnostics);
        let r = self.risk_free_rate;
        let q = input.dividend_yield;

        let sqrt_t = t.sqrt();
        let (d1, d2) = d1_d2(s, k, t, sigma, r, q);
        let pdf_d1 = normal_pdf(d1);
        let div_discount = (-q * t).exp();
        let rate_discount = (-r * t).exp();

        // Gamma and vega are the same for calls and puts
        let gamma = div_discount * pdf_d1 / (s * sigma * sqrt_t);
        let vega = s * div_discount * pdf_d1 * sqrt_t / 100.0;

        let decay = -s * pdf_d1 * sigma * div_discount / (2.0 * sqrt_t);

        let (delta, theta, rho) = match input.option_type {
            OptionType::Call => {
                let delta = div_discount * normal_cdf(d1);
                let theta = (decay - r * k * rate_discount * normal_cdf(d2)
                    + q * s * div_discount * normal_cdf(d1))
                    / 365.0;
                let rho = k * t * rate_discount * normal_cdf(d2) / 100.0;
                (delta, theta, rho)
            }
            OptionType::Put => {
                let delta = -div_discount * normal_cdf(-d1);
                let theta = (decay + r * k * rate_discount * normal_cdf(-d2)
                    - q * s * div_discount * normal_cdf(-d1))
                    / 365.0;
                let rho = -k * t * rate_discount * normal_cdf(-d2) / 100.0;
                (delta, theta, rho)
            }
        };

        Greeks {
            delta,
            gamma,
            theta,
            vega,
            rho,
        }
    }

    /// Analytic vega per unit of volatility (not per vol point)
    pub(crate) fn raw_vega(&self, spot: f64, strike: f64, t: f64, sigma: f64, q: f64) -> f64 {
        if t <= 0.0 || sigma <= 0.0 || spot <= 0.0 || strike <= 0.0 {
            return 0.0;
        }
        let (d1, _) = d1_d2(spot, strike, t, sigma, self.risk_free_rate, q);
        spot * (-q * t).exp() * normal_pdf(d1) * t.sqrt()
    }
}

impl Default for BlackScholes {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl OptionPricer for BlackScholes {
    fn price_option(&self, input: &OptionInput, diagnostics: &mut Diagnostics) -> Result<f64> {
        let price = self.price_with_diagnostics(input, diagnostics);
        if !price.is_finite() {
            return Err(ScenarioError::NumericalInstability(format!(
                "non-finite option price {} for strike {} at spot {}",
                price, input.strike, input.spot
            )));
        }
        Ok(price)
    }
}

/// Payoff at expiry
pub fn intrinsic_value(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Closed-form price for inputs already inside the model's domain
///
/// Shared by the scalar and batch paths so both produce identical bits.
pub(crate) fn closed_form_price(
    spot: f64,
    strike: f64,
    t: f64,
    sigma: f64,
    r: f64,
    q: f64,
    option_type: OptionType,
) -> f64 {
    let (d1, d2) = d1_d2(spot, strike, t, sigma, r, q);
    let forward_leg = spot * (-q * t).exp();
    let strike_leg = strike * (-r * t).exp();

    let price = match option_type {
        OptionType::Call => forward_leg * normal_cdf(d1) - strike_leg * normal_cdf(d2),
        OptionType::Put => strike_leg * normal_cdf(-d2) - forward_leg * normal_cdf(-d1),
    };

    price.max(0.0)
}

/// Clamp spot and strike to [`MIN_PRICE_INPUT`]
#[inline]
pub(crate) fn floor_price_input(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        MIN_PRICE_INPUT
    }
}

fn sanitize(input: &OptionInput, routine: &str, diagnostics: &mut Diagnostics) -> (f64, f64, f64) {
    let volatility = if input.volatility > 0.0 && input.volatility.is_finite() {
        input.volatility
    } else {
        diagnostics.push(
            DiagnosticKind::InvalidInput,
            routine,
            format!("Invalid volatility {}, using {:.2}", input.volatility, DEFAULT_VOLATILITY),
        );
        DEFAULT_VOLATILITY
    };

    let spot = floor_price_input(input.spot);
    if spot != input.spot {
        diagnostics.push(
            DiagnosticKind::InvalidInput,
            routine,
            format!("Invalid spot {}, using {}", input.spot, MIN_PRICE_INPUT),
        );
    }

    let strike = floor_price_input(input.strike);
    if strike != input.strike {
        diagnostics.push(
            DiagnosticKind::InvalidInput,
            routine,
            format!("Invalid strike {}, using {}", input.strike, MIN_PRICE_INPUT),
        );
    }

    (spot, strike, volatility)
}

#[inline]
fn d1_d2(s: f64, k: f64, t: f64, sigma: f64, r: f64, q: f64) -> (f64, f64) {
    let vol_sqrt_t = sigma * t.sqrt();
    let d1 = ((s / k).ln() + (r - q + 0.5 * sigma * sigma) * t) / vol_sqrt_t;
    (d1, d1 - vol_sqrt_t)
}

/// Standard normal CDF
#[inline]
pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal PDF
#[inline]
fn normal_pdf(x: f64) -> f64 {
    (1.0 / (2.0 * PI).sqrt()) * (-0.5 * x * x).exp()
}
