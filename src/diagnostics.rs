//! Structured warnings returned alongside computed values
//!
//! Degraded paths in the engine (clamped inputs, non-converged solves,
//! positions or scenarios that could not be evaluated) never abort the caller.
//! Instead they resolve to a sentinel value and record a [`Diagnostic`] here.
//! Each recorded entry is also emitted as a `tracing` warning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a degraded computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Non-positive volatility, strike or spot replaced by a safe default
    InvalidInput,

    /// Implied volatility solver stopped without meeting its tolerance
    ConvergenceFailure,

    /// A position could not be repriced; its current value was carried forward
    PositionRepriceFailure,

    /// A whole scenario failed and was omitted from a batch
    ScenarioFailure,

    /// Missing optional position data replaced by a configured default
    DefaultApplied,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::InvalidInput => "InvalidInput",
            DiagnosticKind::ConvergenceFailure => "ConvergenceFailure",
            DiagnosticKind::PositionRepriceFailure => "PositionRepriceFailure",
            DiagnosticKind::ScenarioFailure => "ScenarioFailure",
            DiagnosticKind::DefaultApplied => "DefaultApplied",
        };
        f.write_str(name)
    }
}

/// A single structured warning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// What kind of degradation happened
    pub kind: DiagnosticKind,

    /// Position symbol, scenario name or kernel routine the warning refers to
    pub subject: String,

    /// Human readable detail
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}

/// Ordered collection of diagnostics produced by one computation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic and emit it as a warning event
    pub fn push(
        &mut self,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        let diagnostic = Diagnostic {
            kind,
            subject: subject.into(),
            message: message.into(),
        };
        tracing::warn!(
            kind = %diagnostic.kind,
            subject = %diagnostic.subject,
            "{}",
            diagnostic.message
        );
        self.entries.push(diagnostic);
    }

    /// Move every entry of `other` into this collection without re-logging
    pub fn absorb(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Number of entries of the given kind
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
