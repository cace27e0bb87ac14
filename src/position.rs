//! Position snapshots consumed by the engine
//!
//! Positions are supplied by the ingestion side and treated as immutable
//! inputs: nothing in this crate writes back into a caller's `Position`.

use crate::pricing::{Greeks, OptionType};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Contract multiplier used when none is given
pub const DEFAULT_CONTRACT_MULTIPLIER: f64 = 100.0;

/// Stock or option, as reported in per-position results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionKind {
    Stock,
    Option,
}

impl fmt::Display for PositionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionKind::Stock => f.write_str("STOCK"),
            PositionKind::Option => f.write_str("OPTION"),
        }
    }
}

/// Option-specific attributes of a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLeg {
    /// Underlying symbol
    pub underlying: String,

    /// Strike price
    pub strike: f64,

    /// Expiration date (None = unknown, the configured default DTE applies)
    #[serde(default)]
    pub expiration: Option<NaiveDate>,

    /// Call or put
    pub option_type: OptionType,

    /// Contract multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Last observed underlying spot price
    #[serde(default)]
    pub underlying_price: Option<f64>,

    /// Last known Greeks (per contract, vega per vol point, theta per day)
    #[serde(default)]
    pub greeks: Option<Greeks>,

    /// Last known implied volatility
    #[serde(default)]
    pub implied_volatility: Option<f64>,
}

fn default_multiplier() -> f64 {
    DEFAULT_CONTRACT_MULTIPLIER
}

impl OptionLeg {
    pub fn new(underlying: impl Into<String>, strike: f64, option_type: OptionType) -> Self {
        Self {
            underlying: underlying.into(),
            strike,
            expiration: None,
            option_type,
            multiplier: DEFAULT_CONTRACT_MULTIPLIER,
            underlying_price: None,
            greeks: None,
            implied_volatility: None,
        }
    }

    pub fn with_expiration(mut self, expiration: NaiveDate) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_underlying_price(mut self, price: f64) -> Self {
        self.underlying_price = Some(price);
        self
    }

    pub fn with_greeks(mut self, greeks: Greeks) -> Self {
        self.greeks = Some(greeks);
        self
    }

    pub fn with_implied_volatility(mut self, iv: f64) -> Self {
        self.implied_volatility = Some(iv);
        self
    }
}

/// A stock or option holding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Position identifier (ticker for stocks, contract symbol for options)
    pub symbol: String,

    /// Signed quantity (positive = long, negative = short)
    pub quantity: f64,

    /// Average entry price
    pub entry_price: f64,

    /// Current market price (per share, or per contract unit for options)
    pub current_price: f64,

    /// Option attributes; None for stock positions
    #[serde(default)]
    pub option: Option<OptionLeg>,
}

impl Position {
    /// Create a stock position
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::Position;
    ///
    /// let stock = Position::stock("SPY", 100.0, 440.0, 450.0);
    /// assert_eq!(stock.position_value(), 45_000.0);
    /// assert_eq!(stock.unrealized_pnl(), 1_000.0);
    /// ```
    pub fn stock(
        symbol: impl Into<String>,
        quantity: f64,
        entry_price: f64,
        current_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            entry_price,
            current_price,
            option: None,
        }
    }

    /// Create an option position
    pub fn option(
        symbol: impl Into<String>,
        quantity: f64,
        entry_price: f64,
        current_price: f64,
        leg: OptionLeg,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            entry_price,
            current_price,
            option: Some(leg),
        }
    }

    pub fn is_option(&self) -> bool {
        self.option.is_some()
    }

    pub fn kind(&self) -> PositionKind {
        if self.is_option() {
            PositionKind::Option
        } else {
            PositionKind::Stock
        }
    }

    /// Contract multiplier (1 for stock)
    pub fn multiplier(&self) -> f64 {
        self.option.as_ref().map_or(1.0, |leg| leg.multiplier)
    }

    /// Symbol whose spot drives this position's value
    pub fn underlying_symbol(&self) -> &str {
        self.option
            .as_ref()
            .map_or(self.symbol.as_str(), |leg| leg.underlying.as_str())
    }

    /// Market value: price * quantity * multiplier
    pub fn position_value(&self) -> f64 {
        self.current_price * self.quantity * self.multiplier()
    }

    /// Unrealized P&L against the entry price
    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.quantity * self.multiplier()
    }

    /// Unrealized P&L in percent of the entry price (0 when entry is 0)
    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price * 100.0
    }

    /// Calendar days from `as_of` to expiration, None for stock or unknown expiry
    pub fn days_to_expiration(&self, as_of: NaiveDate) -> Option<i64> {
        self.option
            .as_ref()
            .and_then(|leg| leg.expiration)
            .map(|expiration| (expiration - as_of).num_days())
    }

    /// Direction-adjusted moneyness: spot/strike for calls, strike/spot for puts
    pub fn moneyness(&self, spot: f64) -> Option<f64> {
        let leg = self.option.as_ref()?;
        if leg.strike <= 0.0 || spot <= 0.0 {
            return None;
        }
        Some(match leg.option_type {
            OptionType::Call => spot / leg.strike,
            OptionType::Put => leg.strike / spot,
        })
    }

    /// Whether the option is in the money at `spot`
    pub fn is_itm(&self, spot: f64) -> Option<bool> {
        let leg = self.option.as_ref()?;
        Some(match leg.option_type {
            OptionType::Call => spot > leg.strike,
            OptionType::Put => spot < leg.strike,
        })
    }
}
