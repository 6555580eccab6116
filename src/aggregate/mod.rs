//! Aggregation core: keys, materialized state, and field extraction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{Map, Value};

mod operator;
mod window;

pub use operator::{Operator, ParseOperatorError};
pub use window::{BucketSize, ParseBucketSizeError, bucket_for};

/// Uniquely identifies a pre-aggregate bucket. Partition-scoped from day
/// one, even when running as a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub partition_id: i64,
    pub principal_id: String,
    pub rule_name: String,
    pub bucket_size: BucketSize,
    /// Truncated to the bucket boundary.
    pub window_start: DateTime<Utc>,
}

/// The current materialized value of one pre-aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateState {
    pub operator: Operator,
    /// Exact decimal reduction of the operator over contributing events.
    pub value: Decimal,
    /// Number of events folded in; monotonically increasing.
    pub event_count: i64,
    /// Most recent event that updated this aggregate.
    pub last_event_id: String,
    /// Fingerprint of the rule definition at materialization time; a
    /// mismatch against the live rule marks the row semantically stale.
    pub rule_fingerprint: String,
    pub window_start: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pulls a numeric value out of the event payload by field name.
///
/// Missing field, empty field name, or an unrecognized value all yield zero.
/// That is deliberate, not an error: count rules run the extraction but
/// ignore the value entirely.
pub fn extract_decimal(data: &Map<String, Value>, field: &str) -> Decimal {
    if field.is_empty() {
        return Decimal::ZERO;
    }

    match data.get(field) {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Decimal::from(i)
            } else if let Some(u) = n.as_u64() {
                Decimal::from(u)
            } else if let Some(f) = n.as_f64() {
                Decimal::from_f64(f).unwrap_or(Decimal::ZERO)
            } else {
                Decimal::ZERO
            }
        }
        Some(Value::String(s)) => s.parse().unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}
