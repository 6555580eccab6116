//! In-memory store implementing both storage seams.
//!
//! Satisfies the same contracts as the SQLite backing: strict monotonic
//! sequence assignment, duplicate detection on `(principal_id, id)`, and an
//! atomic flush with the stale-cursor guard. Used by tests and as a valid
//! substitute wherever durability is not required.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use super::{AggregateMap, AppendOutcome, EventStore, PreAggregateStore};
use crate::aggregate::{AggregateState, BucketSize};
use crate::error::StoreError;
use crate::event::Event;

#[derive(Debug, Default)]
struct Inner {
    next_seq: i64,
    /// Ascending by `ingest_seq` (append order).
    events: Vec<Event>,
    seen: HashSet<(String, String)>,
    aggregates: AggregateMap,
    /// Checkpoint cursor per bucket label.
    checkpoints: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: the number of events in the log.
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &mut Event) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock();

        let dedup_key = (event.principal_id.clone(), event.id.clone());
        if inner.seen.contains(&dedup_key) {
            return Ok(AppendOutcome::Duplicate);
        }

        inner.next_seq += 1;
        let ingest_seq = inner.next_seq;
        event.ingest_seq = Some(ingest_seq);
        event.ingested_at = Some(Utc::now());

        inner.seen.insert(dedup_key);
        inner.events.push(event.clone());
        Ok(AppendOutcome::Appended(ingest_seq))
    }

    async fn read_after_cursor(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.ingest_seq.is_some_and(|seq| seq > cursor))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_scoped_after_cursor(
        &self,
        cursor: i64,
        principal_id: &str,
        event_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                e.ingest_seq.is_some_and(|seq| seq > cursor)
                    && e.principal_id == principal_id
                    && e.event_type == event_type
                    && e.occurred_at >= start
                    && e.occurred_at < end
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_by_principal(
        &self,
        principal_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                e.principal_id == principal_id && e.occurred_at >= start && e.occurred_at < end
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl PreAggregateStore for MemoryStore {
    async fn read_checkpoint(&self, bucket_size: BucketSize) -> Result<i64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .checkpoints
            .get(&bucket_size.label())
            .copied()
            .unwrap_or(0))
    }

    async fn flush(
        &self,
        aggregates: &AggregateMap,
        new_cursor: i64,
        bucket_size: BucketSize,
    ) -> Result<(), StoreError> {
        let label = bucket_size.label();
        let mut inner = self.inner.lock();

        let durable_cursor = inner.checkpoints.get(&label).copied().unwrap_or(0);
        if new_cursor <= durable_cursor {
            warn!(new_cursor, durable_cursor, "discarding stale flush");
            return Ok(());
        }

        // Validate every key before mutating anything: the flush is
        // all-or-nothing, same as the transactional backing.
        for key in aggregates.keys() {
            if key.bucket_size != bucket_size {
                return Err(StoreError::BucketMismatch {
                    expected: label,
                    actual: key.bucket_size.label(),
                });
            }
        }

        for (key, state) in aggregates {
            match inner.aggregates.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.value = state.operator.merge(existing.value, state.value);
                    existing.event_count += state.event_count;
                    existing.last_event_id = state.last_event_id.clone();
                    existing.rule_fingerprint = state.rule_fingerprint.clone();
                    existing.updated_at = state.updated_at;
                }
                Entry::Vacant(entry) => {
                    entry.insert(state.clone());
                }
            }
        }

        inner.checkpoints.insert(label, new_cursor);
        Ok(())
    }

    async fn query_range(
        &self,
        principal_id: &str,
        rule_name: &str,
        bucket_size: BucketSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateState>, StoreError> {
        let inner = self.inner.lock();
        let mut states: Vec<AggregateState> = inner
            .aggregates
            .iter()
            .filter(|(key, _)| {
                key.principal_id == principal_id
                    && key.rule_name == rule_name
                    && key.bucket_size == bucket_size
                    && key.window_start >= start
                    && key.window_start < end
            })
            .map(|(_, state)| state.clone())
            .collect();

        states.sort_by_key(|s| s.window_start);
        Ok(states)
    }

    async fn query_range_with_checkpoint(
        &self,
        principal_id: &str,
        rule_name: &str,
        bucket_size: BucketSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<AggregateState>, i64), StoreError> {
        // One lock acquisition covers both reads, so the checkpoint always
        // matches the aggregate snapshot.
        let inner = self.inner.lock();
        let checkpoint = inner
            .checkpoints
            .get(&bucket_size.label())
            .copied()
            .unwrap_or(0);

        let mut states: Vec<AggregateState> = inner
            .aggregates
            .iter()
            .filter(|(key, _)| {
                key.principal_id == principal_id
                    && key.rule_name == rule_name
                    && key.bucket_size == bucket_size
                    && key.window_start >= start
                    && key.window_start < end
            })
            .map(|(_, state)| state.clone())
            .collect();
        states.sort_by_key(|s| s.window_start);

        Ok((states, checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::aggregate::{AggregateKey, Operator};
    use crate::partition::partition_for;
    use crate::test_utils::EventBuilder;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 11, h, m, s).unwrap()
    }

    fn key_and_state(principal: &str, minute: u32) -> (AggregateKey, AggregateState) {
        let window_start = at(10, minute, 0);
        (
            AggregateKey {
                partition_id: partition_for(principal),
                principal_id: principal.to_string(),
                rule_name: "count_reqs".to_string(),
                bucket_size: BucketSize::MINUTE,
                window_start,
            },
            AggregateState {
                operator: Operator::Count,
                value: dec!(1),
                event_count: 1,
                last_event_id: "e1".to_string(),
                rule_fingerprint: "fp1".to_string(),
                window_start,
                updated_at: at(10, minute, 30),
            },
        )
    }

    #[tokio::test]
    async fn sequences_are_strictly_monotonic() {
        let store = MemoryStore::new();
        let mut previous = 0;
        for i in 0..10 {
            let mut event = EventBuilder::new().with_id(&format!("e{i}")).build();
            let AppendOutcome::Appended(seq) = store.append(&mut event).await.unwrap() else {
                panic!("expected append");
            };
            assert!(seq > previous);
            previous = seq;
        }
    }

    #[tokio::test]
    async fn duplicates_do_not_consume_sequences() {
        let store = MemoryStore::new();

        let mut first = EventBuilder::new().with_id("e1").build();
        store.append(&mut first).await.unwrap();

        let mut duplicate = EventBuilder::new().with_id("e1").build();
        assert_eq!(
            store.append(&mut duplicate).await.unwrap(),
            AppendOutcome::Duplicate
        );

        let mut second = EventBuilder::new().with_id("e2").build();
        let AppendOutcome::Appended(seq) = store.append(&mut second).await.unwrap() else {
            panic!("expected append");
        };
        assert_eq!(seq, 2, "duplicate must not burn a sequence number");
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn flush_guard_and_merge_match_the_durable_store() {
        let store = MemoryStore::new();

        let (key, state) = key_and_state("p1", 30);
        let mut batch = AggregateMap::new();
        batch.insert(key.clone(), state.clone());
        store.flush(&batch, 5, BucketSize::MINUTE).await.unwrap();

        // Merge on re-flush with a newer cursor.
        store.flush(&batch, 6, BucketSize::MINUTE).await.unwrap();
        // Stale cursor discarded.
        store.flush(&batch, 6, BucketSize::MINUTE).await.unwrap();

        let (states, checkpoint) = store
            .query_range_with_checkpoint("p1", "count_reqs", BucketSize::MINUTE, at(10, 0, 0), at(11, 0, 0))
            .await
            .unwrap();
        assert_eq!(checkpoint, 6);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].value, dec!(2));
        assert_eq!(states[0].event_count, 2);
    }

    #[tokio::test]
    async fn bucket_mismatch_leaves_state_untouched() {
        let store = MemoryStore::new();

        let (good_key, state) = key_and_state("p1", 30);
        let mut bad_key = good_key.clone();
        bad_key.bucket_size = BucketSize::HOUR;

        let mut batch = AggregateMap::new();
        batch.insert(good_key, state.clone());
        batch.insert(bad_key, state);

        let result = store.flush(&batch, 5, BucketSize::MINUTE).await;
        assert!(matches!(result, Err(StoreError::BucketMismatch { .. })));
        assert_eq!(store.read_checkpoint(BucketSize::MINUTE).await.unwrap(), 0);
        let states = store
            .query_range("p1", "count_reqs", BucketSize::MINUTE, at(0, 0, 0), at(23, 0, 0))
            .await
            .unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn query_range_sorts_by_window() {
        let store = MemoryStore::new();

        let mut batch = AggregateMap::new();
        for minute in [33, 30, 31] {
            let (key, state) = key_and_state("p1", minute);
            batch.insert(key, state);
        }
        store.flush(&batch, 1, BucketSize::MINUTE).await.unwrap();

        let states = store
            .query_range("p1", "count_reqs", BucketSize::MINUTE, at(10, 0, 0), at(11, 0, 0))
            .await
            .unwrap();
        let minutes: Vec<u32> = states
            .iter()
            .map(|s| {
                use chrono::Timelike;
                s.window_start.minute()
            })
            .collect();
        assert_eq!(minutes, vec![30, 31, 33]);
    }
}
