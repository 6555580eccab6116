//! Storage seams: the event log and the pre-aggregate store.
//!
//! Both stores are defined by their operation contracts. The SQLite backing
//! is the production implementation; the in-memory one satisfies the same
//! invariants (monotonic sequence, atomic flush + checkpoint, stale-flush
//! guard) and substitutes for it in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregate::{AggregateKey, AggregateState, BucketSize};
use crate::error::StoreError;
use crate::event::Event;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteEventStore, SqlitePreAggregateStore};

/// Result of an append. A duplicate is an outcome, not a fault: the log is
/// unchanged and no sequence was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(i64),
    Duplicate,
}

/// Durable append-only event log with monotonic sequence assignment.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stamps `ingested_at`, persists the event, and assigns a fresh
    /// `ingest_seq` strictly greater than any previously assigned. Both
    /// fields are written back into `event` on success. If
    /// `(principal_id, id)` already exists, returns
    /// [`AppendOutcome::Duplicate`] and leaves `event` untouched.
    async fn append(&self, event: &mut Event) -> Result<AppendOutcome, StoreError>;

    /// Up to `limit` events with `ingest_seq > cursor`, ascending by
    /// sequence. A resumable cursor: the same cursor returns the same
    /// events until new ones arrive, and in-order advancement cannot skip.
    async fn read_after_cursor(&self, cursor: i64, limit: usize)
    -> Result<Vec<Event>, StoreError>;

    /// Same as [`read_after_cursor`](Self::read_after_cursor), further
    /// scoped to one principal, one event type, and
    /// `start <= occurred_at < end`. Drives the read path's tail scan.
    async fn read_scoped_after_cursor(
        &self,
        cursor: i64,
        principal_id: &str,
        event_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Raw events for one principal with `start <= occurred_at < end`,
    /// ascending by sequence. Backs the event listing endpoint.
    async fn list_by_principal(
        &self,
        principal_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Backing-store liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

pub type AggregateMap = HashMap<AggregateKey, AggregateState>;

/// Durable materialized aggregates plus the sweep checkpoint, flushed
/// together atomically.
#[async_trait]
pub trait PreAggregateStore: Send + Sync {
    /// The checkpoint cursor for a bucket size. 0 when no sweep has ever
    /// run ("replay from the beginning").
    async fn read_checkpoint(&self, bucket_size: BucketSize) -> Result<i64, StoreError>;

    /// Upserts every aggregate and advances the checkpoint to `new_cursor`
    /// in one transaction. If the durable cursor is already at or past
    /// `new_cursor` the flush is a silent no-op: the caller lost a race and
    /// its work is covered. Existing rows merge by operator semantics
    /// (count/sum add, min/max take the extremum; event counts add;
    /// fingerprint, last event, and update time take the incoming values).
    /// An aggregate keyed to a different bucket size aborts the transaction.
    async fn flush(
        &self,
        aggregates: &AggregateMap,
        new_cursor: i64,
        bucket_size: BucketSize,
    ) -> Result<(), StoreError>;

    /// Aggregates with `start <= window_start < end` for one principal and
    /// rule, ascending by window.
    async fn query_range(
        &self,
        principal_id: &str,
        rule_name: &str,
        bucket_size: BucketSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AggregateState>, StoreError>;

    /// [`query_range`](Self::query_range) plus the checkpoint, read from a
    /// single snapshot so a concurrent flush cannot interleave between the
    /// two reads.
    async fn query_range_with_checkpoint(
        &self,
        principal_id: &str,
        rule_name: &str,
        bucket_size: BucketSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<AggregateState>, i64), StoreError>;
}
