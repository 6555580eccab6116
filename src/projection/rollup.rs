//! Granularity rollups over merged one-minute aggregate states.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{AggregateWindow, Granularity};
use crate::aggregate::{AggregateState, BucketSize, bucket_for};

/// Rolls merged bucket states up to the requested output resolution.
/// `states` is ascending by window start and uniform in operator.
pub(super) fn rollup(
    states: &[AggregateState],
    granularity: Granularity,
    bucket_size: BucketSize,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<AggregateWindow> {
    match granularity {
        Granularity::Total => rollup_total(states, start, end),
        Granularity::Minute => per_bucket(states, bucket_size),
        Granularity::Hour => rollup_grouped(states, BucketSize::HOUR, start, end),
        Granularity::Day => rollup_grouped(states, BucketSize::DAY, start, end),
    }
}

/// A single entry covering the whole range. Count/sum add across buckets;
/// min/max take the global extremum. An empty range is a zero entry.
fn rollup_total(
    states: &[AggregateState],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<AggregateWindow> {
    let Some((first, rest)) = states.split_first() else {
        return vec![AggregateWindow {
            window_start: start,
            window_end: end,
            value: Decimal::ZERO,
            event_count: 0,
        }];
    };

    let mut value = first.value;
    let mut event_count = first.event_count;
    for state in rest {
        value = first.operator.merge(value, state.value);
        event_count += state.event_count;
    }

    vec![AggregateWindow {
        window_start: start,
        window_end: end,
        value,
        event_count,
    }]
}

/// One entry per underlying bucket, as materialized.
fn per_bucket(states: &[AggregateState], bucket_size: BucketSize) -> Vec<AggregateWindow> {
    states
        .iter()
        .map(|state| AggregateWindow {
            window_start: state.window_start,
            window_end: state.window_start + bucket_size.duration(),
            value: state.value,
            event_count: state.event_count,
        })
        .collect()
}

/// Groups buckets by a coarser boundary and folds within each group. Every
/// group across the full range is emitted, including empty ones as zeros.
fn rollup_grouped(
    states: &[AggregateState],
    group_size: BucketSize,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<AggregateWindow> {
    let mut groups: HashMap<DateTime<Utc>, Vec<&AggregateState>> = HashMap::new();
    for state in states {
        groups
            .entry(bucket_for(state.window_start, group_size))
            .or_default()
            .push(state);
    }

    let mut windows = Vec::new();
    let mut group_start = bucket_for(start, group_size);
    while group_start < end {
        let window_end = group_start + group_size.duration();

        let (value, event_count) = match groups.get(&group_start) {
            Some(members) => fold_group(members),
            None => (Decimal::ZERO, 0),
        };

        windows.push(AggregateWindow {
            window_start: group_start,
            window_end,
            value,
            event_count,
        });

        group_start = window_end;
    }

    windows
}

fn fold_group(members: &[&AggregateState]) -> (Decimal, i64) {
    let Some((first, rest)) = members.split_first() else {
        return (Decimal::ZERO, 0);
    };

    let mut value = first.value;
    let mut event_count = first.event_count;
    for state in rest {
        value = first.operator.merge(value, state.value);
        event_count += state.event_count;
    }
    (value, event_count)
}
