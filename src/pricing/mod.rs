//! Option pricing kernel
//!
//! Closed-form Black-Scholes-Merton prices and Greeks, a vectorized batch
//! path that shares the scalar closed form, and a Newton-Raphson implied
//! volatility solver. The kernel holds no mutable state and is safe to share
//! across threads.

mod batch;
mod black_scholes;
mod implied_vol;

pub use batch::MIN_BATCH_VOLATILITY;
pub use black_scholes::{
    intrinsic_value, BlackScholes, Greeks, OptionInput, OptionPricer, OptionType,
    DEFAULT_VOLATILITY, MIN_PRICE_INPUT,
};
pub use implied_vol::ImpliedVolResult;
