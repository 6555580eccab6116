//! The batch aggregation engine.
//!
//! Each sweep iteration reads events past the durable checkpoint, folds them
//! into aggregate states across a pool of workers sharded by principal, and
//! flushes the result together with the advanced checkpoint in one atomic
//! write. Because sequences are assigned at insert and the flush is
//! monotonic, an iteration can crash and re-run without double-counting.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::aggregate::{AggregateKey, AggregateState, BucketSize, bucket_for, extract_decimal};
use crate::error::SweepError;
use crate::event::Event;
use crate::partition::partition_for;
use crate::rules::{AggregationRule, RuleSet};
use crate::store::{AggregateMap, EventStore, PreAggregateStore};

mod scheduler;

pub use scheduler::Scheduler;

const DEFAULT_BATCH_SIZE: usize = 50_000;
const DEFAULT_WORKER_COUNT: usize = 10;

/// Throughput knobs for one sweep iteration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Maximum events fetched per iteration.
    pub batch_size: usize,
    /// Degree of in-memory fold parallelism.
    pub worker_count: usize,
    /// Aggregation bucket. Fixed to one minute.
    pub bucket_size: BucketSize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            bucket_size: BucketSize::MINUTE,
        }
    }
}

impl SweepConfig {
    fn normalized(&self) -> Self {
        let mut config = self.clone();
        if config.batch_size == 0 {
            config.batch_size = DEFAULT_BATCH_SIZE;
        }
        if config.worker_count == 0 {
            config.worker_count = DEFAULT_WORKER_COUNT;
        }
        config
    }
}

/// Runs one sweep iteration and returns the number of events processed.
///
/// Zero means the backlog is drained. Any error leaves the checkpoint where
/// it was; the next iteration retries the same events.
pub async fn run_sweep(
    events: &dyn EventStore,
    pre_aggregates: &dyn PreAggregateStore,
    rules: &RuleSet,
    config: &SweepConfig,
) -> Result<usize, SweepError> {
    let config = config.normalized();

    let cursor = pre_aggregates.read_checkpoint(config.bucket_size).await?;
    let batch = events.read_after_cursor(cursor, config.batch_size).await?;

    if batch.is_empty() {
        debug!(cursor, bucket = %config.bucket_size, "no new events to sweep");
        return Ok(0);
    }

    let processed = batch.len();
    // Events arrive ascending by sequence, so the last one carries the new
    // checkpoint.
    let new_cursor = batch
        .last()
        .and_then(|event| event.ingest_seq)
        .ok_or(SweepError::MissingSequence)?;

    let compiled = Arc::new(rules.by_source_event());
    let aggregates = fold_concurrently(batch, compiled, &config).await?;

    debug!(
        events = processed,
        aggregates = aggregates.len(),
        from_cursor = cursor,
        to_cursor = new_cursor,
        bucket = %config.bucket_size,
        "computed sweep aggregates"
    );

    pre_aggregates
        .flush(&aggregates, new_cursor, config.bucket_size)
        .await?;

    info!(
        events = processed,
        aggregates = aggregates.len(),
        from_cursor = cursor,
        to_cursor = new_cursor,
        bucket = %config.bucket_size,
        "sweep complete"
    );

    Ok(processed)
}

/// Shards the batch by principal and folds shards across up to
/// `worker_count` blocking workers. Sharding by principal keeps every key a
/// single worker's property, so the final merge never has to reconcile
/// conflicting folds; it still merges defensively by operator.
async fn fold_concurrently(
    batch: Vec<Event>,
    rules: Arc<HashMap<String, Vec<AggregationRule>>>,
    config: &SweepConfig,
) -> Result<AggregateMap, SweepError> {
    let mut groups: HashMap<String, Vec<Event>> = HashMap::new();
    for event in batch {
        groups.entry(event.principal_id.clone()).or_default().push(event);
    }

    let worker_count = config.worker_count.min(groups.len()).max(1);
    let mut shards: Vec<Vec<Vec<Event>>> = (0..worker_count).map(|_| Vec::new()).collect();
    for (i, group) in groups.into_values().enumerate() {
        shards[i % worker_count].push(group);
    }

    let now = Utc::now();
    let bucket_size = config.bucket_size;

    let mut handles = Vec::with_capacity(worker_count);
    for shard in shards {
        let rules = Arc::clone(&rules);
        handles.push(tokio::task::spawn_blocking(move || {
            fold_groups(shard, &rules, bucket_size, now)
        }));
    }

    let mut merged = AggregateMap::new();
    for handle in handles {
        let local = handle
            .await
            .map_err(|e| SweepError::WorkerPanic(e.to_string()))?;
        merge_local(&mut merged, local);
    }

    Ok(merged)
}

/// Pure fold of one worker's principal groups into a local aggregate map.
fn fold_groups(
    groups: Vec<Vec<Event>>,
    rules: &HashMap<String, Vec<AggregationRule>>,
    bucket_size: BucketSize,
    now: DateTime<Utc>,
) -> AggregateMap {
    let mut local = AggregateMap::new();

    for event in groups.into_iter().flatten() {
        let Some(matching) = rules.get(&event.event_type) else {
            continue;
        };

        for rule in matching {
            let window_start = bucket_for(event.occurred_at, bucket_size);
            let key = AggregateKey {
                partition_id: partition_for(&event.principal_id),
                principal_id: event.principal_id.clone(),
                rule_name: rule.name.clone(),
                bucket_size,
                window_start,
            };

            let incoming = extract_decimal(&event.data, &rule.field);

            match local.entry(key) {
                Entry::Occupied(mut entry) => {
                    let state = entry.get_mut();
                    state.value = rule.operator.apply(state.value, incoming);
                    state.event_count += 1;
                    state.last_event_id = event.id.clone();
                    state.updated_at = now;
                }
                Entry::Vacant(entry) => {
                    entry.insert(AggregateState {
                        operator: rule.operator,
                        value: rule.operator.initial(incoming),
                        event_count: 1,
                        last_event_id: event.id.clone(),
                        rule_fingerprint: rule.fingerprint.clone(),
                        window_start,
                        updated_at: now,
                    });
                }
            }
        }
    }

    local
}

fn merge_local(merged: &mut AggregateMap, local: AggregateMap) {
    for (key, state) in local {
        match merged.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.value = existing.operator.merge(existing.value, state.value);
                existing.event_count += state.event_count;
                existing.last_event_id = state.last_event_id;
                existing.rule_fingerprint = state.rule_fingerprint;
                existing.updated_at = existing.updated_at.max(state.updated_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(state);
            }
        }
    }
}
