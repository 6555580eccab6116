//! The hybrid read path.
//!
//! Range queries merge durable pre-aggregates with the raw-event tail past
//! the checkpoint, so answers stay fresh while the sweeper lags. The tail
//! fold uses the same operator reducers as the sweeper, which is what makes
//! the merge exact rather than approximate.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use crate::aggregate::{AggregateState, BucketSize, bucket_for, extract_decimal};
use crate::error::{QueryError, StoreError};
use crate::event::Event;
use crate::rules::{AggregationRule, RuleSet};
use crate::store::{EventStore, PreAggregateStore};

mod rollup;

/// Events per tail-scan batch.
const TAIL_BATCH_SIZE: usize = 5_000;
/// Tail batches before the query gives up. Bounds worst-case latency and
/// memory when the checkpoint is far behind; beyond it the caller gets an
/// error, never a partial answer.
const MAX_TAIL_BATCHES: usize = 20;
/// Pre-aggregates are materialized on one-minute buckets; every granularity
/// rolls up from them.
const QUERY_BUCKET: BucketSize = BucketSize::MINUTE;

/// Output resolution of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Total,
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Minute => "1m",
            Self::Hour => "1h",
            Self::Day => "1d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid granularity: {0} (must be total, 1m, 1h, or 1d)")]
pub struct ParseGranularityError(String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(Self::Total),
            "1m" => Ok(Self::Minute),
            "1h" => Ok(Self::Hour),
            "1d" => Ok(Self::Day),
            other => Err(ParseGranularityError(other.to_string())),
        }
    }
}

/// A validated range query.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub principal_id: String,
    pub rule: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
}

/// One rolled-up window in a query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: Decimal,
    pub event_count: i64,
}

/// The answer to a range query.
#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub principal_id: String,
    pub rule: String,
    pub operator: crate::aggregate::Operator,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
    /// Latest instant the answer is complete through, clamped to `end` and
    /// to now.
    pub data_through: DateTime<Utc>,
    pub staleness_seconds: i64,
    /// True when any merged durable bucket was materialized under a rule
    /// definition that differs from the current one. Reported, never
    /// auto-repaired.
    pub stale_rule: bool,
    pub values: Vec<AggregateWindow>,
}

/// Serves range queries by merging pre-aggregates with the raw tail.
pub struct ProjectionService {
    events: Arc<dyn EventStore>,
    pre_aggregates: Arc<dyn PreAggregateStore>,
    rules: Arc<RuleSet>,
    now: fn() -> DateTime<Utc>,
    tail_batch_size: usize,
    max_tail_batches: usize,
}

impl ProjectionService {
    pub fn new(
        events: Arc<dyn EventStore>,
        pre_aggregates: Arc<dyn PreAggregateStore>,
        rules: Arc<RuleSet>,
    ) -> Self {
        Self {
            events,
            pre_aggregates,
            rules,
            now: Utc::now,
            tail_batch_size: TAIL_BATCH_SIZE,
            max_tail_batches: MAX_TAIL_BATCHES,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    #[cfg(test)]
    fn with_tail_limits(mut self, tail_batch_size: usize, max_tail_batches: usize) -> Self {
        self.tail_batch_size = tail_batch_size;
        self.max_tail_batches = max_tail_batches;
        self
    }

    #[tracing::instrument(
        skip(self, query),
        fields(principal_id = %query.principal_id, rule = %query.rule),
        level = tracing::Level::DEBUG
    )]
    pub async fn query_aggregates(
        &self,
        query: &AggregateQuery,
    ) -> Result<AggregateReport, QueryError> {
        if query.end <= query.start {
            return Err(QueryError::InvalidQuery(
                "end time must be after start time".to_string(),
            ));
        }

        let rule = self.rules.get(&query.rule).ok_or_else(|| {
            QueryError::InvalidQuery(format!("unknown rule: {}", query.rule))
        })?;

        let (durable, checkpoint) = self
            .pre_aggregates
            .query_range_with_checkpoint(
                &query.principal_id,
                &query.rule,
                QUERY_BUCKET,
                query.start,
                query.end,
            )
            .await?;

        let tail = self.scan_tail(checkpoint, query, rule).await?;
        let merged = merge_states(durable, tail, rule);

        let stale_rule = merged
            .iter()
            .any(|state| state.rule_fingerprint != rule.fingerprint);

        let values = rollup::rollup(&merged, query.granularity, QUERY_BUCKET, query.start, query.end);

        let now = (self.now)();
        let data_through = compute_data_through(&merged, QUERY_BUCKET, query.end).min(now);
        let staleness_seconds = (now - data_through).num_seconds().max(0);

        Ok(AggregateReport {
            principal_id: query.principal_id.clone(),
            rule: query.rule.clone(),
            operator: rule.operator,
            start: query.start,
            end: query.end,
            granularity: query.granularity,
            data_through,
            staleness_seconds,
            stale_rule,
            values,
        })
    }

    /// Folds raw events past the checkpoint into per-window states using
    /// the rule's reducer. Batches advance a local cursor; a short batch
    /// ends the scan, and exceeding the batch cap aborts the whole query.
    async fn scan_tail(
        &self,
        mut cursor: i64,
        query: &AggregateQuery,
        rule: &AggregationRule,
    ) -> Result<Vec<AggregateState>, QueryError> {
        let mut buckets: HashMap<DateTime<Utc>, AggregateState> = HashMap::new();
        let mut batches = 0;
        let mut events_scanned = 0;

        loop {
            if batches >= self.max_tail_batches {
                warn!(
                    principal_id = %query.principal_id,
                    rule = %query.rule,
                    batches,
                    events_scanned,
                    "tail scan exceeded batch cap"
                );
                return Err(QueryError::TailTooDeep {
                    max_batches: self.max_tail_batches,
                    events_scanned,
                });
            }

            let events = self
                .events
                .read_scoped_after_cursor(
                    cursor,
                    &query.principal_id,
                    &rule.source_event,
                    query.start,
                    query.end,
                    self.tail_batch_size,
                )
                .await?;

            if events.is_empty() {
                break;
            }

            let batch_len = events.len();
            cursor = last_sequence(&events)?;
            self.fold_tail_batch(events, &mut buckets, rule);

            events_scanned += batch_len;
            batches += 1;

            if batch_len < self.tail_batch_size {
                break;
            }
        }

        let mut states: Vec<AggregateState> = buckets.into_values().collect();
        states.sort_by_key(|state| state.window_start);
        Ok(states)
    }

    fn fold_tail_batch(
        &self,
        events: Vec<Event>,
        buckets: &mut HashMap<DateTime<Utc>, AggregateState>,
        rule: &AggregationRule,
    ) {
        for event in events {
            let window_start = bucket_for(event.occurred_at, QUERY_BUCKET);
            let incoming = extract_decimal(&event.data, &rule.field);
            let event_time = event.ingested_at.unwrap_or_else(self.now);

            match buckets.entry(window_start) {
                Entry::Occupied(mut entry) => {
                    let state = entry.get_mut();
                    state.value = rule.operator.apply(state.value, incoming);
                    state.event_count += 1;
                    state.last_event_id = event.id;
                    state.updated_at = state.updated_at.max(event_time);
                }
                Entry::Vacant(entry) => {
                    entry.insert(AggregateState {
                        operator: rule.operator,
                        value: rule.operator.initial(incoming),
                        event_count: 1,
                        last_event_id: event.id,
                        rule_fingerprint: rule.fingerprint.clone(),
                        window_start,
                        updated_at: event_time,
                    });
                }
            }
        }
    }
}

fn last_sequence(events: &[Event]) -> Result<i64, QueryError> {
    events
        .last()
        .and_then(|event| event.ingest_seq)
        .ok_or_else(|| {
            StoreError::Corrupt("event from store is missing its ingest sequence".to_string())
                .into()
        })
}

/// Deterministic merge of durable and tail states for the same windows:
/// values combine by operator, counts add, the tail (more recent) wins the
/// bookkeeping fields, update times take the max.
fn merge_states(
    durable: Vec<AggregateState>,
    tail: Vec<AggregateState>,
    rule: &AggregationRule,
) -> Vec<AggregateState> {
    let mut merged: HashMap<DateTime<Utc>, AggregateState> = durable
        .into_iter()
        .map(|state| (state.window_start, state))
        .collect();

    for incoming in tail {
        match merged.entry(incoming.window_start) {
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                current.value = rule.operator.merge(current.value, incoming.value);
                current.event_count += incoming.event_count;
                if !incoming.last_event_id.is_empty() {
                    current.last_event_id = incoming.last_event_id;
                }
                if !incoming.rule_fingerprint.is_empty() {
                    current.rule_fingerprint = incoming.rule_fingerprint;
                }
                current.updated_at = current.updated_at.max(incoming.updated_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(incoming);
            }
        }
    }

    let mut states: Vec<AggregateState> = merged.into_values().collect();
    states.sort_by_key(|state| state.window_start);
    states
}

/// The latest window end among merged buckets, clamped to the requested
/// end. An empty result is complete through the requested end.
fn compute_data_through(
    states: &[AggregateState],
    bucket_size: BucketSize,
    end: DateTime<Utc>,
) -> DateTime<Utc> {
    states
        .iter()
        .map(|state| state.window_start + bucket_size.duration())
        .max()
        .map_or(end, |latest| latest.min(end))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::aggregate::Operator;
    use crate::store::{AggregateMap, MemoryStore};
    use crate::sweeper::{SweepConfig, run_sweep};
    use crate::test_utils::{EventBuilder, test_rules};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, h, m, s).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, 12, 0, 0).unwrap()
    }

    fn service(store: &Arc<MemoryStore>) -> ProjectionService {
        ProjectionService::new(
            Arc::clone(store) as Arc<dyn EventStore>,
            Arc::clone(store) as Arc<dyn PreAggregateStore>,
            Arc::new(test_rules()),
        )
        .with_clock(fixed_now)
    }

    fn query(rule: &str, start: DateTime<Utc>, end: DateTime<Utc>, granularity: Granularity) -> AggregateQuery {
        AggregateQuery {
            principal_id: "p1".to_string(),
            rule: rule.to_string(),
            start,
            end,
            granularity,
        }
    }

    async fn append(store: &MemoryStore, event: Event) {
        let mut event = event;
        store.append(&mut event).await.unwrap();
    }

    async fn sweep(store: &MemoryStore) {
        run_sweep(store, store, &test_rules(), &SweepConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_queries() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);

        let inverted = query("count_api_requests", at(11, 0, 0), at(10, 0, 0), Granularity::Total);
        assert!(matches!(
            service.query_aggregates(&inverted).await,
            Err(QueryError::InvalidQuery(_))
        ));

        let equal = query("count_api_requests", at(10, 0, 0), at(10, 0, 0), Granularity::Total);
        assert!(matches!(
            service.query_aggregates(&equal).await,
            Err(QueryError::InvalidQuery(_))
        ));

        let unknown = query("no_such_rule", at(10, 0, 0), at(11, 0, 0), Granularity::Total);
        assert!(matches!(
            service.query_aggregates(&unknown).await,
            Err(QueryError::InvalidQuery(message)) if message.contains("no_such_rule")
        ));
    }

    #[tokio::test]
    async fn unswept_events_are_served_from_the_tail() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 30, 0)).build(),
        )
        .await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert_eq!(report.values.len(), 1);
        assert_eq!(report.values[0].value, dec!(1));
        assert_eq!(report.values[0].event_count, 1);
        assert_eq!(report.operator, Operator::Count);
    }

    #[tokio::test]
    async fn swept_and_unswept_events_merge() {
        let store = Arc::new(MemoryStore::new());

        // E1 materialized by the sweeper; E2 still in the tail.
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 0, 15)).build(),
        )
        .await;
        sweep(&store).await;
        append(
            &store,
            EventBuilder::new().with_id("e2").with_occurred_at(at(10, 0, 45)).build(),
        )
        .await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(10, 1, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert_eq!(report.values[0].value, dec!(2));
        assert_eq!(report.values[0].event_count, 2);
    }

    #[tokio::test]
    async fn tail_does_not_double_count_swept_events() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 30, 0)).build(),
        )
        .await;
        sweep(&store).await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert_eq!(report.values[0].value, dec!(1), "event must count exactly once");
        assert_eq!(report.values[0].event_count, 1);
    }

    #[tokio::test]
    async fn sum_and_extrema_merge_across_the_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new()
                .with_id("e1")
                .with_occurred_at(at(10, 30, 0))
                .with_data_field("bytes", json!(100))
                .with_data_field("latency_ms", json!(45))
                .build(),
        )
        .await;
        sweep(&store).await;
        append(
            &store,
            EventBuilder::new()
                .with_id("e2")
                .with_occurred_at(at(10, 30, 30))
                .with_data_field("bytes", json!(250))
                .with_data_field("latency_ms", json!(90))
                .build(),
        )
        .await;

        let service = service(&store);
        let range = |rule: &str| query(rule, at(10, 0, 0), at(11, 0, 0), Granularity::Total);

        let sum = service.query_aggregates(&range("sum_bytes")).await.unwrap();
        assert_eq!(sum.values[0].value, dec!(350));

        let max = service.query_aggregates(&range("max_latency")).await.unwrap();
        assert_eq!(max.values[0].value, dec!(90));

        let min = service.query_aggregates(&range("min_latency")).await.unwrap();
        assert_eq!(min.values[0].value, dec!(45));
    }

    #[tokio::test]
    async fn tail_scan_is_scoped_to_the_query() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 30, 0)).build(),
        )
        .await;
        // Different principal, different type, outside the range: all invisible.
        append(
            &store,
            EventBuilder::new()
                .with_id("e2")
                .with_principal("p2")
                .with_occurred_at(at(10, 30, 0))
                .build(),
        )
        .await;
        append(
            &store,
            EventBuilder::new()
                .with_id("e3")
                .with_type("invoice.created")
                .with_occurred_at(at(10, 30, 0))
                .build(),
        )
        .await;
        append(
            &store,
            EventBuilder::new().with_id("e4").with_occurred_at(at(11, 30, 0)).build(),
        )
        .await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert_eq!(report.values[0].value, dec!(1));
    }

    #[tokio::test]
    async fn empty_range_yields_a_zero_total() {
        let store = Arc::new(MemoryStore::new());
        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert_eq!(report.values.len(), 1);
        assert_eq!(report.values[0].value, Decimal::ZERO);
        assert_eq!(report.values[0].event_count, 0);
        assert_eq!(report.values[0].window_start, at(10, 0, 0));
        assert_eq!(report.values[0].window_end, at(11, 0, 0));
        assert_eq!(report.data_through, at(11, 0, 0));
        assert_eq!(report.staleness_seconds, 3600);
    }

    #[tokio::test]
    async fn data_through_tracks_the_latest_merged_window() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 30, 0)).build(),
        )
        .await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        // Latest bucket ends at 10:31; fixed clock is 12:00.
        assert_eq!(report.data_through, at(10, 31, 0));
        assert_eq!(report.staleness_seconds, 89 * 60);
    }

    #[tokio::test]
    async fn data_through_is_clamped_to_now() {
        let store = Arc::new(MemoryStore::new());
        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(11, 0, 0),
                at(13, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        // Empty range reports the requested end, clamped to now (12:00).
        assert_eq!(report.data_through, fixed_now());
        assert_eq!(report.staleness_seconds, 0);
    }

    #[tokio::test]
    async fn deep_tail_aborts_instead_of_underreporting() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            append(
                &store,
                EventBuilder::new()
                    .with_id(&format!("e{i}"))
                    .with_occurred_at(at(10, 30, i))
                    .build(),
            )
            .await;
        }

        let constrained = service(&store).with_tail_limits(2, 3);
        let result = constrained
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await;

        assert!(matches!(
            result,
            Err(QueryError::TailTooDeep {
                max_batches: 3,
                events_scanned: 6,
            })
        ));

        // With room to finish, the same backlog scans fine.
        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();
        assert_eq!(report.values[0].value, dec!(10));
    }

    #[tokio::test]
    async fn stale_rule_fingerprints_are_surfaced() {
        let store = Arc::new(MemoryStore::new());

        // Materialize a row under an old rule definition.
        let window_start = at(10, 30, 0);
        let mut aggregates = AggregateMap::new();
        aggregates.insert(
            crate::aggregate::AggregateKey {
                partition_id: crate::partition::partition_for("p1"),
                principal_id: "p1".to_string(),
                rule_name: "count_api_requests".to_string(),
                bucket_size: BucketSize::MINUTE,
                window_start,
            },
            AggregateState {
                operator: Operator::Count,
                value: dec!(4),
                event_count: 4,
                last_event_id: "old".to_string(),
                rule_fingerprint: "an-older-fingerprint".to_string(),
                window_start,
                updated_at: at(10, 31, 0),
            },
        );
        store.flush(&aggregates, 4, BucketSize::MINUTE).await.unwrap();

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();

        assert!(report.stale_rule);
        assert_eq!(report.values[0].value, dec!(4));

        // A fresh tail-only answer is not stale.
        let fresh_store = Arc::new(MemoryStore::new());
        append(
            &fresh_store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 30, 0)).build(),
        )
        .await;
        let report = service(&fresh_store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(11, 0, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();
        assert!(!report.stale_rule);
    }

    #[tokio::test]
    async fn minute_granularity_emits_one_entry_per_bucket() {
        let store = Arc::new(MemoryStore::new());
        append(
            &store,
            EventBuilder::new().with_id("e1").with_occurred_at(at(10, 0, 30)).build(),
        )
        .await;
        append(
            &store,
            EventBuilder::new().with_id("e2").with_occurred_at(at(10, 1, 30)).build(),
        )
        .await;
        sweep(&store).await;

        let report = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(10, 2, 0),
                Granularity::Minute,
            ))
            .await
            .unwrap();

        assert_eq!(report.values.len(), 2);
        assert_eq!(report.values[0].window_start, at(10, 0, 0));
        assert_eq!(report.values[0].window_end, at(10, 1, 0));
        assert_eq!(report.values[0].value, dec!(1));
        assert_eq!(report.values[1].window_start, at(10, 1, 0));
        assert_eq!(report.values[1].value, dec!(1));

        let total = service(&store)
            .query_aggregates(&query(
                "count_api_requests",
                at(10, 0, 0),
                at(10, 2, 0),
                Granularity::Total,
            ))
            .await
            .unwrap();
        assert_eq!(total.values.len(), 1);
        assert_eq!(total.values[0].value, dec!(2));
        assert_eq!(total.values[0].event_count, 2);
    }

    #[test]
    fn granularity_parses_wire_labels() {
        assert_eq!("total".parse::<Granularity>().unwrap(), Granularity::Total);
        assert_eq!("1m".parse::<Granularity>().unwrap(), Granularity::Minute);
        assert_eq!("1h".parse::<Granularity>().unwrap(), Granularity::Hour);
        assert_eq!("1d".parse::<Granularity>().unwrap(), Granularity::Day);
        assert!("5m".parse::<Granularity>().is_err());
        assert!("".parse::<Granularity>().is_err());
    }
}
