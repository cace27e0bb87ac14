//! Beta-weighted implied volatility shift model
//!
//! A scenario's volatility shock is scaled per position by two betas: one
//! keyed by moneyness (out-of-the-money options move more) and one keyed by
//! days to expiry (short-dated options move more):
//!
//! ```text
//! new_iv = clamp(base_iv * (1 + multiplier * moneyness_beta * time_beta), 0.01, 3.0)
//! ```
//!
//! Which multiplier applies is decided by [`VolShock`] in three tiers:
//! per-category multipliers, then DTE-bucket scaling, then a uniform change.
//! DTE buckets are already keyed by time to expiry, so that tier scales
//! flat as `base_iv * (1 + multiplier)` without betas.

use crate::pricing::{OptionType, MIN_PRICE_INPUT};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower bound of a shifted volatility
pub const MIN_SHIFTED_IV: f64 = 0.01;

/// Upper bound of a shifted volatility
pub const MAX_SHIFTED_IV: f64 = 3.0;

/// Orientation of the moneyness ratio for puts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneynessConvention {
    /// spot/strike for calls, strike/spot for puts
    #[default]
    DirectionAdjusted,

    /// spot/strike for both calls and puts
    SpotOverStrike,
}

/// Five-bucket moneyness classification used to look up scenario multipliers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoneynessCategory {
    OtmPut,
    OtmCall,
    Atm,
    ItmPut,
    ItmCall,
}

impl MoneynessCategory {
    /// Classify a moneyness ratio: below 0.95 is OTM, [0.95, 1.05) ATM, above ITM
    pub fn classify(moneyness: f64, option_type: OptionType) -> Self {
        match (moneyness, option_type) {
            (m, OptionType::Put) if m < 0.95 => MoneynessCategory::OtmPut,
            (m, OptionType::Call) if m < 0.95 => MoneynessCategory::OtmCall,
            (m, _) if m < 1.05 => MoneynessCategory::Atm,
            (_, OptionType::Put) => MoneynessCategory::ItmPut,
            (_, OptionType::Call) => MoneynessCategory::ItmCall,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MoneynessCategory::OtmPut => "OTM_PUT",
            MoneynessCategory::OtmCall => "OTM_CALL",
            MoneynessCategory::Atm => "ATM",
            MoneynessCategory::ItmPut => "ITM_PUT",
            MoneynessCategory::ItmCall => "ITM_CALL",
        }
    }
}

impl fmt::Display for MoneynessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Days-to-expiry bucket used by DTE scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DteBucket {
    /// 0-7 days (anything already expired lands here too)
    Week,
    /// 8-30 days
    Month,
    /// 31-90 days
    Quarter,
    /// more than 90 days
    Long,
}

impl DteBucket {
    pub fn from_dte(dte: i64) -> Self {
        match dte {
            d if d <= 7 => DteBucket::Week,
            d if d <= 30 => DteBucket::Month,
            d if d <= 90 => DteBucket::Quarter,
            _ => DteBucket::Long,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DteBucket::Week => "0-7",
            DteBucket::Month => "8-30",
            DteBucket::Quarter => "31-90",
            DteBucket::Long => "90+",
        }
    }
}

/// Scenario IV multipliers keyed by moneyness category, with a catch-all
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IvMultipliers {
    #[serde(rename = "OTM_PUT", default, skip_serializing_if = "Option::is_none")]
    pub otm_put: Option<f64>,

    #[serde(rename = "OTM_CALL", default, skip_serializing_if = "Option::is_none")]
    pub otm_call: Option<f64>,

    #[serde(rename = "ATM", default, skip_serializing_if = "Option::is_none")]
    pub atm: Option<f64>,

    #[serde(rename = "ITM_PUT", default, skip_serializing_if = "Option::is_none")]
    pub itm_put: Option<f64>,

    #[serde(rename = "ITM_CALL", default, skip_serializing_if = "Option::is_none")]
    pub itm_call: Option<f64>,

    /// Used when a category has no entry of its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

impl IvMultipliers {
    /// Same multiplier for every category
    pub fn uniform(multiplier: f64) -> Self {
        Self {
            default: Some(multiplier),
            ..Self::default()
        }
    }

    /// Builder-style setter for one category
    pub fn with(mut self, category: MoneynessCategory, multiplier: f64) -> Self {
        *self.slot(category) = Some(multiplier);
        self
    }

    /// Builder-style setter for the catch-all entry
    pub fn with_default(mut self, multiplier: f64) -> Self {
        self.default = Some(multiplier);
        self
    }

    /// Multiplier for `category`, falling back to the catch-all entry
    pub fn get(&self, category: MoneynessCategory) -> Option<f64> {
        let own = match category {
            MoneynessCategory::OtmPut => self.otm_put,
            MoneynessCategory::OtmCall => self.otm_call,
            MoneynessCategory::Atm => self.atm,
            MoneynessCategory::ItmPut => self.itm_put,
            MoneynessCategory::ItmCall => self.itm_call,
        };
        own.or(self.default)
    }

    /// Every populated entry, labelled by its key
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        [
            ("OTM_PUT", self.otm_put),
            ("OTM_CALL", self.otm_call),
            ("ATM", self.atm),
            ("ITM_PUT", self.itm_put),
            ("ITM_CALL", self.itm_call),
            ("default", self.default),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
    }

    fn slot(&mut self, category: MoneynessCategory) -> &mut Option<f64> {
        match category {
            MoneynessCategory::OtmPut => &mut self.otm_put,
            MoneynessCategory::OtmCall => &mut self.otm_call,
            MoneynessCategory::Atm => &mut self.atm,
            MoneynessCategory::ItmPut => &mut self.itm_put,
            MoneynessCategory::ItmCall => &mut self.itm_call,
        }
    }
}

/// Scenario IV multipliers keyed by DTE bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DteScaling {
    #[serde(rename = "0-7", default, skip_serializing_if = "Option::is_none")]
    pub week: Option<f64>,

    #[serde(rename = "8-30", default, skip_serializing_if = "Option::is_none")]
    pub month: Option<f64>,

    #[serde(rename = "31-90", default, skip_serializing_if = "Option::is_none")]
    pub quarter: Option<f64>,

    #[serde(rename = "90+", default, skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
}

impl DteScaling {
    /// All four buckets populated
    pub fn new(week: f64, month: f64, quarter: f64, long: f64) -> Self {
        Self {
            week: Some(week),
            month: Some(month),
            quarter: Some(quarter),
            long: Some(long),
        }
    }

    pub fn get(&self, bucket: DteBucket) -> Option<f64> {
        match bucket {
            DteBucket::Week => self.week,
            DteBucket::Month => self.month,
            DteBucket::Quarter => self.quarter,
            DteBucket::Long => self.long,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        [DteBucket::Week, DteBucket::Month, DteBucket::Quarter, DteBucket::Long]
            .into_iter()
            .filter_map(|bucket| self.get(bucket).map(|v| (bucket.label(), v)))
    }
}

/// Which volatility transform of a scenario takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolTransformKind {
    CategoryMultipliers,
    DteScaling,
    Uniform,
    None,
}

/// Volatility fields of a scenario
///
/// Normally only one field is populated. When several are, the lookup order
/// is `iv_multipliers`, then `dte_scaling`, then `iv_change`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolShock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_multipliers: Option<IvMultipliers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dte_scaling: Option<DteScaling>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_change: Option<f64>,
}

impl VolShock {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn uniform(iv_change: f64) -> Self {
        Self {
            iv_change: Some(iv_change),
            ..Self::default()
        }
    }

    pub fn by_category(multipliers: IvMultipliers) -> Self {
        Self {
            iv_multipliers: Some(multipliers),
            ..Self::default()
        }
    }

    pub fn by_dte(scaling: DteScaling) -> Self {
        Self {
            dte_scaling: Some(scaling),
            ..Self::default()
        }
    }

    /// Highest-priority transform that is populated
    pub fn kind(&self) -> VolTransformKind {
        if self.iv_multipliers.is_some() {
            VolTransformKind::CategoryMultipliers
        } else if self.dte_scaling.is_some() {
            VolTransformKind::DteScaling
        } else if self.iv_change.is_some() {
            VolTransformKind::Uniform
        } else {
            VolTransformKind::None
        }
    }

    /// Number of populated transform fields
    pub fn populated(&self) -> usize {
        [
            self.iv_multipliers.is_some(),
            self.dte_scaling.is_some(),
            self.iv_change.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Scenario multiplier for a position of the given category and DTE
    pub fn scenario_multiplier(&self, category: MoneynessCategory, dte: i64) -> f64 {
        self.applied(category, dte).1
    }

    /// Tier that takes effect for a position, and its multiplier
    ///
    /// A category multiplier wins when one (or the catch-all) exists. A
    /// multiplier map with neither falls through to the DTE tier, whose
    /// missing buckets fall back to `iv_change`. Absent everything, 0.
    pub fn applied(&self, category: MoneynessCategory, dte: i64) -> (VolTransformKind, f64) {
        if let Some(multiplier) = self.iv_multipliers.as_ref().and_then(|m| m.get(category)) {
            return (VolTransformKind::CategoryMultipliers, multiplier);
        }

        match &self.dte_scaling {
            Some(scaling) => (
                VolTransformKind::DteScaling,
                scaling
                    .get(DteBucket::from_dte(dte))
                    .or(self.iv_change)
                    .unwrap_or(0.0),
            ),
            None => match self.iv_change {
                Some(change) => (VolTransformKind::Uniform, change),
                None => (VolTransformKind::None, 0.0),
            },
        }
    }
}

/// Result of shifting one position's implied volatility
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftedVol {
    pub volatility: f64,
    pub tier: VolTransformKind,
    pub moneyness: f64,
    pub category: MoneynessCategory,
    pub scenario_multiplier: f64,
}

/// Beta-weighted IV shift model
#[derive(Debug, Clone, Copy, Default)]
pub struct IvShiftModel {
    convention: MoneynessConvention,
}

impl IvShiftModel {
    pub fn new(convention: MoneynessConvention) -> Self {
        Self { convention }
    }

    pub fn convention(&self) -> MoneynessConvention {
        self.convention
    }

    /// Moneyness beta: deep OTM options react the most
    pub fn moneyness_beta(moneyness: f64) -> f64 {
        if moneyness < 0.95 {
            1.3
        } else if moneyness < 0.98 {
            1.2
        } else if moneyness < 1.02 {
            1.0
        } else if moneyness < 1.05 {
            0.9
        } else {
            0.8
        }
    }

    /// Time beta: short-dated options react the most
    pub fn time_beta(dte: i64) -> f64 {
        match dte {
            d if d <= 7 => 1.5,
            d if d <= 30 => 1.0,
            d if d <= 90 => 0.7,
            _ => 0.5,
        }
    }

    /// Beta-weighted IV after a scenario multiplier, clamped to [0.01, 3.0]
    ///
    /// # Example
    ///
    /// ```
    /// use ag_scenario::IvShiftModel;
    ///
    /// // ATM, 30 DTE: both betas are 1, so the multiplier applies as-is
    /// let shifted = IvShiftModel::shift(0.30, 1.0, 30, 0.50);
    /// assert!((shifted - 0.45).abs() < 1e-12);
    ///
    /// // The result never leaves the clamp range
    /// assert_eq!(IvShiftModel::shift(0.30, 1.0, 30, -5.0), 0.01);
    /// ```
    pub fn shift(base_iv: f64, moneyness: f64, dte: i64, scenario_multiplier: f64) -> f64 {
        let change = scenario_multiplier * Self::moneyness_beta(moneyness) * Self::time_beta(dte);
        (base_iv * (1.0 + change)).clamp(MIN_SHIFTED_IV, MAX_SHIFTED_IV)
    }

    /// Flat IV scaling `base_iv * (1 + multiplier)`, clamped to [0.01, 3.0]
    ///
    /// Used by the DTE tier, whose buckets already encode time to expiry.
    pub fn scale(base_iv: f64, multiplier: f64) -> f64 {
        (base_iv * (1.0 + multiplier)).clamp(MIN_SHIFTED_IV, MAX_SHIFTED_IV)
    }

    /// Moneyness ratio under the configured convention
    pub fn moneyness(&self, spot: f64, strike: f64, option_type: OptionType) -> f64 {
        let spot = spot.max(MIN_PRICE_INPUT);
        let strike = strike.max(MIN_PRICE_INPUT);
        match (self.convention, option_type) {
            (MoneynessConvention::DirectionAdjusted, OptionType::Put) => strike / spot,
            _ => spot / strike,
        }
    }

    /// Shift one option's IV under a scenario, given the shocked underlying spot
    pub fn resolve(
        &self,
        base_iv: f64,
        shocked_spot: f64,
        strike: f64,
        option_type: OptionType,
        dte: i64,
        shock: &VolShock,
    ) -> ShiftedVol {
        let moneyness = self.moneyness(shocked_spot, strike, option_type);
        let category = MoneynessCategory::classify(moneyness, option_type);
        let (tier, scenario_multiplier) = shock.applied(category, dte);
        let volatility = match tier {
            VolTransformKind::DteScaling => Self::scale(base_iv, scenario_multiplier),
            _ => Self::shift(base_iv, moneyness, dte, scenario_multiplier),
        };

        ShiftedVol {
            volatility,
            tier,
            moneyness,
            category,
            scenario_multiplier,
        }
    }
}
