//! Aggregation operators and their reduce semantics.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A supported aggregation operator.
///
/// Each operator defines three reductions: `initial` for the first event in
/// a window, `apply` for folding subsequent events, and `merge` for
/// combining two partial aggregates of the same window (the store-side
/// upsert rule and the worker join rule share it).
///
/// Operators with composite state (avg, percentile) need a wider aggregate
/// state shape and are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Count,
    Sum,
    Min,
    Max,
}

impl Operator {
    /// Aggregate value after the very first event for a key.
    pub fn initial(self, incoming: Decimal) -> Decimal {
        match self {
            Self::Count => Decimal::ONE,
            Self::Sum | Self::Min | Self::Max => incoming,
        }
    }

    /// Folds one incoming event value into an existing aggregate.
    /// Count ignores the incoming value.
    pub fn apply(self, current: Decimal, incoming: Decimal) -> Decimal {
        match self {
            Self::Count => current + Decimal::ONE,
            Self::Sum => current + incoming,
            Self::Min => current.min(incoming),
            Self::Max => current.max(incoming),
        }
    }

    /// Combines two partial aggregates over disjoint event sets for the
    /// same window. Counts and sums add; min/max take the extremum.
    pub fn merge(self, current: Decimal, incoming: Decimal) -> Decimal {
        match self {
            Self::Count | Self::Sum => current + incoming,
            Self::Min => current.min(incoming),
            Self::Max => current.max(incoming),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported operator: {0}")]
pub struct ParseOperatorError(String);

impl FromStr for Operator {
    type Err = ParseOperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(ParseOperatorError(other.to_string())),
        }
    }
}
