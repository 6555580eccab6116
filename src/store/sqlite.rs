//! SQLite-backed stores via sqlx.
//!
//! The event log relies on SQLite's rowid sequence for `ingest_seq`
//! assignment (AUTOINCREMENT, so the sequence never regresses or reuses).
//! The flush transaction is the single serialization point: SQLite admits
//! one writer at a time, so at most one flush per database is in progress,
//! and the monotonic-cursor guard discards stale ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::{AggregateMap, AppendOutcome, EventStore, PreAggregateStore};
use crate::aggregate::{AggregateState, BucketSize, Operator};
use crate::error::StoreError;
use crate::event::Event;

const SELECT_EVENT_COLUMNS: &str = "SELECT ingest_seq, id, principal_id, type, schema_version, \
     occurred_at, ingested_at, metadata, data FROM events";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    ingest_seq: i64,
    id: String,
    principal_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    schema_version: i64,
    occurred_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
    metadata: String,
    data: String,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| StoreError::Corrupt(format!("event metadata: {e}")))?;
        let data = serde_json::from_str(&row.data)
            .map_err(|e| StoreError::Corrupt(format!("event data: {e}")))?;
        let schema_version = u32::try_from(row.schema_version)
            .map_err(|_| StoreError::Corrupt(format!("schema_version {}", row.schema_version)))?;

        Ok(Self {
            id: row.id,
            principal_id: row.principal_id,
            event_type: row.event_type,
            schema_version,
            occurred_at: row.occurred_at,
            ingested_at: Some(row.ingested_at),
            ingest_seq: Some(row.ingest_seq),
            metadata,
            data,
        })
    }
}

fn rows_to_events(rows: Vec<EventRow>) -> Result<Vec<Event>, StoreError> {
    rows.into_iter().map(Event::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.id, principal_id = %event.principal_id),
        level = tracing::Level::DEBUG
    )]
    async fn append(&self, event: &mut Event) -> Result<AppendOutcome, StoreError> {
        let ingested_at = Utc::now();
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| StoreError::Corrupt(format!("event metadata: {e}")))?;
        let data = serde_json::to_string(&event.data)
            .map_err(|e| StoreError::Corrupt(format!("event data: {e}")))?;

        // ON CONFLICT DO NOTHING yields no row for a duplicate, so no
        // sequence is consumed and the log is untouched.
        let assigned: Option<i64> = sqlx::query_scalar(
            "INSERT INTO events \
                (id, principal_id, type, schema_version, occurred_at, ingested_at, metadata, data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (principal_id, id) DO NOTHING \
             RETURNING ingest_seq",
        )
        .bind(&event.id)
        .bind(&event.principal_id)
        .bind(&event.event_type)
        .bind(i64::from(event.schema_version))
        .bind(event.occurred_at)
        .bind(ingested_at)
        .bind(metadata)
        .bind(data)
        .fetch_optional(&self.pool)
        .await?;

        match assigned {
            Some(ingest_seq) => {
                event.ingested_at = Some(ingested_at);
                event.ingest_seq = Some(ingest_seq);
                debug!(ingest_seq, "appended event");
                Ok(AppendOutcome::Appended(ingest_seq))
            }
            None => {
                info!("duplicate event rejected");
                Ok(AppendOutcome::Duplicate)
            }
        }
    }

    async fn read_after_cursor(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT_COLUMNS} WHERE ingest_seq > ?1 ORDER BY ingest_seq ASC LIMIT ?2"
        ))
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_events(rows)
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
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT_COLUMNS} \
             WHERE ingest_seq > ?1 \
               AND principal_id = ?2 \
               AND type = ?3 \
               AND occurred_at >= ?4 \
               AND occurred_at < ?5 \
             ORDER BY ingest_seq ASC \
             LIMIT ?6"
        ))
        .bind(cursor)
        .bind(principal_id)
        .bind(event_type)
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_events(rows)
    }

    async fn list_by_principal(
        &self,
        principal_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT_COLUMNS} \
             WHERE principal_id = ?1 AND occurred_at >= ?2 AND occurred_at < ?3 \
             ORDER BY ingest_seq ASC \
             LIMIT ?4"
        ))
        .bind(principal_id)
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows_to_events(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    window_start: DateTime<Utc>,
    operator: String,
    value: String,
    event_count: i64,
    last_event_id: String,
    rule_fingerprint: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AggregateRow> for AggregateState {
    type Error = StoreError;

    fn try_from(row: AggregateRow) -> Result<Self, Self::Error> {
        let operator: Operator = row
            .operator
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("aggregate operator: {e}")))?;
        let value: Decimal = row
            .value
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("aggregate value {:?}: {e}", row.value)))?;

        Ok(Self {
            operator,
            value,
            event_count: row.event_count,
            last_event_id: row.last_event_id,
            rule_fingerprint: row.rule_fingerprint,
            window_start: row.window_start,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_RANGE: &str = "SELECT window_start, operator, value, event_count, last_event_id, \
        rule_fingerprint, updated_at \
     FROM pre_aggregates \
     WHERE partition_id = ?1 \
       AND principal_id = ?2 \
       AND rule_name = ?3 \
       AND bucket_size = ?4 \
       AND window_start >= ?5 \
       AND window_start < ?6 \
     ORDER BY window_start ASC";

#[derive(Debug, Clone)]
pub struct SqlitePreAggregateStore {
    pool: SqlitePool,
}

impl SqlitePreAggregateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreAggregateStore for SqlitePreAggregateStore {
    async fn read_checkpoint(&self, bucket_size: BucketSize) -> Result<i64, StoreError> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT checkpoint_cursor FROM sweep_checkpoints WHERE bucket_size = ?1",
        )
        .bind(bucket_size.label())
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor.unwrap_or(0))
    }

    #[tracing::instrument(
        skip(self, aggregates),
        fields(aggregates = aggregates.len(), bucket = %bucket_size),
        level = tracing::Level::DEBUG
    )]
    async fn flush(
        &self,
        aggregates: &AggregateMap,
        new_cursor: i64,
        bucket_size: BucketSize,
    ) -> Result<(), StoreError> {
        let label = bucket_size.label();
        let mut tx = self.pool.begin().await?;

        let durable_cursor: Option<i64> = sqlx::query_scalar(
            "SELECT checkpoint_cursor FROM sweep_checkpoints WHERE bucket_size = ?1",
        )
        .bind(&label)
        .fetch_optional(&mut *tx)
        .await?;

        let durable_cursor = match durable_cursor {
            Some(cursor) => cursor,
            None => {
                sqlx::query(
                    "INSERT INTO sweep_checkpoints (bucket_size, checkpoint_cursor, updated_at) \
                     VALUES (?1, 0, ?2) \
                     ON CONFLICT (bucket_size) DO NOTHING",
                )
                .bind(&label)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                0
            }
        };

        // Stale-flush guard: a concurrent sweep already covered this work.
        if new_cursor <= durable_cursor {
            tx.commit().await?;
            warn!(
                new_cursor,
                durable_cursor,
                aggregates = aggregates.len(),
                "discarding stale flush"
            );
            return Ok(());
        }

        for (key, state) in aggregates {
            if key.bucket_size != bucket_size {
                return Err(StoreError::BucketMismatch {
                    expected: label,
                    actual: key.bucket_size.label(),
                });
            }

            // Merge arithmetic runs here with exact decimals rather than in
            // SQL: values are stored as decimal strings, which SQLite cannot
            // compare or add numerically.
            let existing: Option<(String, i64)> = sqlx::query_as(
                "SELECT value, event_count FROM pre_aggregates \
                 WHERE partition_id = ?1 AND principal_id = ?2 AND rule_name = ?3 \
                   AND bucket_size = ?4 AND window_start = ?5",
            )
            .bind(key.partition_id)
            .bind(&key.principal_id)
            .bind(&key.rule_name)
            .bind(&label)
            .bind(key.window_start)
            .fetch_optional(&mut *tx)
            .await?;

            let (value, event_count) = match existing {
                Some((raw, count)) => {
                    let current: Decimal = raw.parse().map_err(|e| {
                        StoreError::Corrupt(format!("aggregate value {raw:?}: {e}"))
                    })?;
                    (
                        state.operator.merge(current, state.value),
                        count + state.event_count,
                    )
                }
                None => (state.value, state.event_count),
            };

            sqlx::query(
                "INSERT OR REPLACE INTO pre_aggregates \
                    (partition_id, principal_id, rule_name, rule_fingerprint, bucket_size, \
                     window_start, operator, value, event_count, last_event_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )
            .bind(key.partition_id)
            .bind(&key.principal_id)
            .bind(&key.rule_name)
            .bind(&state.rule_fingerprint)
            .bind(&label)
            .bind(key.window_start)
            .bind(state.operator.as_str())
            .bind(value.to_string())
            .bind(event_count)
            .bind(&state.last_event_id)
            .bind(state.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE sweep_checkpoints SET checkpoint_cursor = ?1, updated_at = ?2 \
             WHERE bucket_size = ?3",
        )
        .bind(new_cursor)
        .bind(Utc::now())
        .bind(&label)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            aggregates = aggregates.len(),
            cursor = new_cursor,
            bucket = %label,
            "flushed pre-aggregates"
        );
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
        let rows: Vec<AggregateRow> = sqlx::query_as(SELECT_RANGE)
            .bind(crate::partition::partition_for(principal_id))
            .bind(principal_id)
            .bind(rule_name)
            .bind(bucket_size.label())
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AggregateState::try_from).collect()
    }

    async fn query_range_with_checkpoint(
        &self,
        principal_id: &str,
        rule_name: &str,
        bucket_size: BucketSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<AggregateState>, i64), StoreError> {
        // Both reads run inside one transaction so the checkpoint matches
        // the aggregate rows exactly; a flush committing in between cannot
        // make the tail scan double-count.
        let mut tx = self.pool.begin().await?;

        let rows: Vec<AggregateRow> = sqlx::query_as(SELECT_RANGE)
            .bind(crate::partition::partition_for(principal_id))
            .bind(principal_id)
            .bind(rule_name)
            .bind(bucket_size.label())
            .bind(start)
            .bind(end)
            .fetch_all(&mut *tx)
            .await?;

        let checkpoint: Option<i64> = sqlx::query_scalar(
            "SELECT checkpoint_cursor FROM sweep_checkpoints WHERE bucket_size = ?1",
        )
        .bind(bucket_size.label())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let states: Vec<AggregateState> = rows
            .into_iter()
            .map(AggregateState::try_from)
            .collect::<Result<_, _>>()?;

        Ok((states, checkpoint.unwrap_or(0)))
    }
}
