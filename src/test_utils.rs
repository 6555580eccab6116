//! Shared test fixtures: database setup, event builders, and rule sets.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::aggregate::Operator;
use crate::event::Event;
use crate::rules::{AggregationRule, RuleSet};

/// In-memory SQLite with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// The rule set most tests run against: one rule per operator, all on
/// `api.request`.
pub(crate) fn test_rules() -> RuleSet {
    RuleSet::from_rules(vec![
        AggregationRule::new("count_api_requests", "api.request", Operator::Count, ""),
        AggregationRule::new("sum_bytes", "api.request", Operator::Sum, "bytes"),
        AggregationRule::new("max_latency", "api.request", Operator::Max, "latency_ms"),
        AggregationRule::new("min_latency", "api.request", Operator::Min, "latency_ms"),
    ])
    .unwrap()
}

/// Builder for test events with sensible defaults.
pub(crate) struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub(crate) fn new() -> Self {
        Self {
            event: Event {
                id: "e1".to_string(),
                principal_id: "p1".to_string(),
                event_type: "api.request".to_string(),
                schema_version: 0,
                occurred_at: Utc.with_ymd_and_hms(2026, 2, 11, 10, 30, 0).unwrap(),
                ingested_at: None,
                ingest_seq: None,
                metadata: Default::default(),
                data: Default::default(),
            },
        }
    }

    #[must_use]
    pub(crate) fn with_id(mut self, id: &str) -> Self {
        self.event.id = id.to_string();
        self
    }

    #[must_use]
    pub(crate) fn with_principal(mut self, principal_id: &str) -> Self {
        self.event.principal_id = principal_id.to_string();
        self
    }

    #[must_use]
    pub(crate) fn with_type(mut self, event_type: &str) -> Self {
        self.event.event_type = event_type.to_string();
        self
    }

    #[must_use]
    pub(crate) fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.event.occurred_at = occurred_at;
        self
    }

    #[must_use]
    pub(crate) fn with_data_field(mut self, field: &str, value: Value) -> Self {
        self.event.data.insert(field.to_string(), value);
        self
    }

    #[must_use]
    pub(crate) fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.event.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn build(self) -> Event {
        self.event
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}
