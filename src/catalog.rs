//! Scenario definitions and the named scenario catalog
//!
//! A [`ScenarioSpec`] is pure data: a spot move, one volatility transform and
//! a number of elapsed days. [`ScenarioCatalog`] keeps specs ordered and
//! addressable by name, and carries a version that changes on every edit.
//!
//! # Example
//!
//! ```
//! use ag_scenario::{ScenarioCatalog, ScenarioSpec};
//!
//! let mut catalog = ScenarioCatalog::builtin();
//! assert_eq!(catalog.len(), 16);
//! assert!(catalog.get("Market Panic").is_some());
//!
//! let version = catalog.version();
//! catalog
//!     .insert(ScenarioSpec::custom("Gap Down", -0.12, Some(0.40), None, 0))
//!     .unwrap();
//! assert_eq!(catalog.version(), version + 1);
//! ```

use crate::error::{Result, ScenarioError};
use crate::iv_model::{DteScaling, IvMultipliers, MoneynessCategory, VolShock};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One hypothetical market move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Scenario name, unique within a catalog
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Fractional spot move applied to every underlying (-0.05 = -5%)
    #[serde(default)]
    pub spot_change: f64,

    /// Volatility transform
    #[serde(flatten)]
    pub vol: VolShock,

    /// Calendar days elapsed
    #[serde(default)]
    pub days_pass: u32,
}

impl ScenarioSpec {
    /// Scenario with a spot move only
    pub fn new(name: impl Into<String>, spot_change: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            spot_change,
            vol: VolShock::none(),
            days_pass: 0,
        }
    }

    /// Ad-hoc scenario with a generated description
    ///
    /// ```
    /// use ag_scenario::ScenarioSpec;
    ///
    /// let spec = ScenarioSpec::custom("What if", 0.05, Some(-0.20), None, 2);
    /// assert_eq!(spec.description, "Custom: +5.0% spot, -20.0% IV");
    /// assert_eq!(spec.days_pass, 2);
    /// ```
    pub fn custom(
        name: impl Into<String>,
        spot_change: f64,
        iv_change: Option<f64>,
        iv_multipliers: Option<IvMultipliers>,
        days_pass: u32,
    ) -> Self {
        let mut description = format!("Custom: {:+.1}% spot", spot_change * 100.0);
        if let Some(change) = iv_change {
            description.push_str(&format!(", {:+.1}% IV", change * 100.0));
        }

        Self {
            name: name.into(),
            description,
            spot_change,
            vol: VolShock {
                iv_multipliers,
                dte_scaling: None,
                iv_change,
            },
            days_pass,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_iv_change(mut self, iv_change: f64) -> Self {
        self.vol.iv_change = Some(iv_change);
        self
    }

    pub fn with_iv_multipliers(mut self, multipliers: IvMultipliers) -> Self {
        self.vol.iv_multipliers = Some(multipliers);
        self
    }

    pub fn with_dte_scaling(mut self, scaling: DteScaling) -> Self {
        self.vol.dte_scaling = Some(scaling);
        self
    }

    pub fn with_days_pass(mut self, days_pass: u32) -> Self {
        self.days_pass = days_pass;
        self
    }

    /// Structural validation: every number finite, spot cannot fall 100% or more
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ScenarioError::InvalidScenario {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if !self.spot_change.is_finite() || self.spot_change <= -1.0 {
            return Err(invalid(format!(
                "spot_change {} must be finite and greater than -1",
                self.spot_change
            )));
        }
        if let Some(change) = self.vol.iv_change {
            if !change.is_finite() {
                return Err(invalid(format!("iv_change {} is not finite", change)));
            }
        }
        if let Some(multipliers) = &self.vol.iv_multipliers {
            if let Some((key, value)) = multipliers.entries().find(|(_, v)| !v.is_finite()) {
                return Err(invalid(format!("iv_multipliers.{} = {} is not finite", key, value)));
            }
        }
        if let Some(scaling) = &self.vol.dte_scaling {
            if let Some((key, value)) = scaling.entries().find(|(_, v)| !v.is_finite()) {
                return Err(invalid(format!("dte_scaling.{} = {} is not finite", key, value)));
            }
        }

        if self.vol.populated() > 1 {
            tracing::debug!(
                scenario = %self.name,
                transform = ?self.vol.kind(),
                "Several volatility transforms set, highest priority wins"
            );
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct CatalogDocument {
    #[serde(default = "initial_version")]
    version: u32,
    scenarios: Vec<ScenarioSpec>,
}

fn initial_version() -> u32 {
    1
}

/// Ordered, versioned collection of named scenarios
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioCatalog {
    version: u32,
    scenarios: IndexMap<String, ScenarioSpec>,
}

impl ScenarioCatalog {
    /// Empty catalog at version 1
    pub fn new() -> Self {
        Self {
            version: initial_version(),
            scenarios: IndexMap::new(),
        }
    }

    /// The sixteen standard templates
    pub fn builtin() -> Self {
        let specs = vec![
            normal_day(),
            earnings_beat(),
            earnings_miss(),
            earnings_inline(),
            market_panic(),
            flash_crash(),
            black_swan(),
            fed_hawkish(),
            fed_dovish(),
            fed_neutral(),
            short_squeeze(),
            fomo_rally(),
            relief_rally(),
            one_day_pass(),
            weekend(),
            one_week(),
        ];

        Self {
            version: initial_version(),
            scenarios: specs.into_iter().map(|spec| (spec.name.clone(), spec)).collect(),
        }
    }

    /// Load a catalog document from YAML
    ///
    /// ```
    /// use ag_scenario::ScenarioCatalog;
    ///
    /// let yaml = r#"
    /// version: 3
    /// scenarios:
    ///   - name: Vol Spike
    ///     spot_change: -0.03
    ///     iv_multipliers:
    ///       OTM_PUT: 0.5
    ///       default: 0.2
    ///   - name: Theta Week
    ///     days_pass: 7
    /// "#;
    ///
    /// let catalog = ScenarioCatalog::from_yaml(yaml).unwrap();
    /// assert_eq!(catalog.version(), 3);
    /// assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["Vol Spike", "Theta Week"]);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: CatalogDocument = serde_yaml::from_str(yaml)?;
        Self::from_document(document)
    }

    /// Load a catalog document from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Self::from_document(document)
    }

    fn from_document(document: CatalogDocument) -> Result<Self> {
        let mut scenarios = IndexMap::with_capacity(document.scenarios.len());
        for spec in document.scenarios {
            spec.validate()?;
            if scenarios.contains_key(&spec.name) {
                return Err(ScenarioError::InvalidScenario {
                    name: spec.name,
                    reason: "duplicate scenario name".to_string(),
                });
            }
            scenarios.insert(spec.name.clone(), spec);
        }

        tracing::info!(
            version = document.version,
            count = scenarios.len(),
            "Loaded scenario catalog"
        );

        Ok(Self {
            version: document.version,
            scenarios,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Add or replace a scenario; a replaced entry keeps its position
    pub fn insert(&mut self, spec: ScenarioSpec) -> Result<Option<ScenarioSpec>> {
        spec.validate()?;
        let previous = self.scenarios.insert(spec.name.clone(), spec);
        self.version += 1;
        Ok(previous)
    }

    /// Remove a scenario, preserving the order of the rest
    pub fn remove(&mut self, name: &str) -> Option<ScenarioSpec> {
        let removed = self.scenarios.shift_remove(name);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioSpec> {
        self.scenarios.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scenarios.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScenarioSpec> {
        self.scenarios.values()
    }

    /// Validate every scenario
    pub fn validate(&self) -> Result<()> {
        self.iter().try_for_each(ScenarioSpec::validate)
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a ScenarioCatalog {
    type Item = &'a ScenarioSpec;
    type IntoIter = indexmap::map::Values<'a, String, ScenarioSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenarios.values()
    }
}

fn normal_day() -> ScenarioSpec {
    ScenarioSpec::new("Normal Day", 0.0)
        .with_iv_change(0.0)
        .with_description("Baseline - no changes")
}

fn earnings_beat() -> ScenarioSpec {
    ScenarioSpec::new("Earnings Beat", 0.05)
        .with_dte_scaling(DteScaling::new(-0.35, -0.15, -0.05, 0.0))
        .with_days_pass(1)
        .with_description("Stock beats earnings, IV crush")
}

fn earnings_miss() -> ScenarioSpec {
    ScenarioSpec::new("Earnings Miss", -0.08)
        .with_dte_scaling(DteScaling::new(-0.30, -0.10, 0.0, 0.0))
        .with_days_pass(1)
        .with_description("Stock misses earnings, IV crush with drop")
}

fn earnings_inline() -> ScenarioSpec {
    ScenarioSpec::new("Earnings Inline", 0.0)
        .with_dte_scaling(DteScaling::new(-0.40, -0.20, -0.05, 0.0))
        .with_days_pass(1)
        .with_description("Earnings meet expectations, max IV crush")
}

fn market_panic() -> ScenarioSpec {
    ScenarioSpec::new("Market Panic", -0.05)
        .with_iv_multipliers(
            IvMultipliers::default()
                .with(MoneynessCategory::OtmPut, 0.60)
                .with(MoneynessCategory::Atm, 0.35)
                .with(MoneynessCategory::OtmCall, 0.25)
                .with_default(0.35),
        )
        .with_description("Market selloff with volatility spike")
}

fn flash_crash() -> ScenarioSpec {
    ScenarioSpec::new("Flash Crash", -0.08)
        .with_iv_multipliers(
            IvMultipliers::default()
                .with(MoneynessCategory::OtmPut, 1.00)
                .with(MoneynessCategory::Atm, 0.50)
                .with(MoneynessCategory::OtmCall, 0.30)
                .with_default(0.50),
        )
        .with_description("Severe market drop with extreme vol spike")
}

fn black_swan() -> ScenarioSpec {
    ScenarioSpec::new("Black Swan", -0.20)
        .with_iv_multipliers(IvMultipliers::uniform(1.50))
        .with_description("Catastrophic event with extreme volatility")
}

fn fed_hawkish() -> ScenarioSpec {
    ScenarioSpec::new("Fed Hawkish", -0.02)
        .with_iv_change(0.20)
        .with_description("Fed more hawkish than expected")
}

fn fed_dovish() -> ScenarioSpec {
    ScenarioSpec::new("Fed Dovish", 0.015)
        .with_iv_change(-0.10)
        .with_description("Fed more dovish than expected")
}

fn fed_neutral() -> ScenarioSpec {
    ScenarioSpec::new("Fed Neutral", 0.0)
        .with_iv_change(-0.05)
        .with_description("Fed meets expectations")
}

fn short_squeeze() -> ScenarioSpec {
    ScenarioSpec::new("Short Squeeze", 0.10)
        .with_iv_multipliers(
            IvMultipliers::default()
                .with(MoneynessCategory::OtmCall, 0.30)
                .with(MoneynessCategory::Atm, 0.10)
                .with(MoneynessCategory::OtmPut, -0.10)
                .with_default(0.10),
        )
        .with_description("Rapid upward move with call IV spike")
}

fn fomo_rally() -> ScenarioSpec {
    ScenarioSpec::new("FOMO Rally", 0.05)
        .with_iv_multipliers(
            IvMultipliers::default()
                .with(MoneynessCategory::OtmCall, 0.15)
                .with(MoneynessCategory::Atm, 0.05)
                .with(MoneynessCategory::OtmPut, -0.20)
                .with_default(0.0),
        )
        .with_description("Fear of missing out rally")
}

fn relief_rally() -> ScenarioSpec {
    ScenarioSpec::new("Relief Rally", 0.03)
        .with_iv_change(-0.15)
        .with_description("Relief rally with vol crush")
}

fn one_day_pass() -> ScenarioSpec {
    ScenarioSpec::new("1 Day Pass", 0.0)
        .with_dte_scaling(DteScaling::new(-0.01, -0.01, 0.0, 0.0))
        .with_days_pass(1)
        .with_description("One day of theta decay")
}

fn weekend() -> ScenarioSpec {
    ScenarioSpec::new("Weekend", 0.0)
        .with_dte_scaling(DteScaling::new(-0.02, -0.01, 0.0, 0.0))
        .with_days_pass(3)
        .with_description("Weekend theta decay")
}

fn one_week() -> ScenarioSpec {
    ScenarioSpec::new("1 Week", 0.0)
        .with_dte_scaling(DteScaling::new(-0.05, -0.03, -0.01, 0.0))
        .with_days_pass(7)
        .with_description("One week of theta decay")
}
