//! Periodic sweep scheduling with drain-to-empty semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{SweepConfig, run_sweep};
use crate::rules::RuleSet;
use crate::store::{EventStore, PreAggregateStore};

/// Consecutive full batches one drain will process before yielding back to
/// the tick loop. Bounds drain time under a sustained write burst.
const MAX_CONSECUTIVE_BATCHES: usize = 100;

/// How long the final drain may run after shutdown is requested.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// A long-running task that invokes the sweep engine on an interval.
///
/// Exactly one scheduler should run per bucket size in a deployment. The
/// monotonic-checkpoint guard in the flush makes a second instance safe
/// (its stale flushes are discarded) but wasteful.
pub struct Scheduler {
    interval: Duration,
    events: Arc<dyn EventStore>,
    pre_aggregates: Arc<dyn PreAggregateStore>,
    rules: Arc<RuleSet>,
    config: SweepConfig,
}

impl Scheduler {
    pub fn new(
        interval: Duration,
        events: Arc<dyn EventStore>,
        pre_aggregates: Arc<dyn PreAggregateStore>,
        rules: Arc<RuleSet>,
        config: SweepConfig,
    ) -> Self {
        Self {
            interval,
            events,
            pre_aggregates,
            rules,
            config,
        }
    }

    /// Runs until `shutdown` is cancelled. Drains the backlog immediately on
    /// start, then on every tick; after cancellation, runs one final drain
    /// under a bounded deadline so in-flight events still materialize.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            bucket = %self.config.bucket_size,
            batch_size = self.config.batch_size,
            workers = self.config.worker_count,
            "starting sweep scheduler"
        );

        loop {
            tokio::select! {
                // The first tick fires immediately: the initial backlog
                // drain happens before any waiting.
                _ = ticker.tick() => {
                    self.drain_backlog(&shutdown).await;
                }
                () = shutdown.cancelled() => {
                    info!(bucket = %self.config.bucket_size, "scheduler stopping, running final drain");
                    // A fresh token: the final drain must not see the
                    // already-cancelled shutdown signal.
                    let detached = CancellationToken::new();
                    if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, self.drain_backlog(&detached))
                        .await
                        .is_err()
                    {
                        warn!(
                            deadline_secs = SHUTDOWN_DRAIN_DEADLINE.as_secs(),
                            "final drain hit shutdown deadline"
                        );
                    }
                    info!(bucket = %self.config.bucket_size, "scheduler stopped");
                    return;
                }
            }
        }
    }

    /// Sweeps until a batch comes back short of `batch_size`, meaning the
    /// backlog is empty. A full batch implies more is queued, so the drain
    /// loops; the consecutive-batch cap keeps a continuous write burst from
    /// pinning the drain forever.
    async fn drain_backlog(&self, cancel: &CancellationToken) {
        let mut batches = 0;

        while batches < MAX_CONSECUTIVE_BATCHES {
            if cancel.is_cancelled() {
                info!(
                    bucket = %self.config.bucket_size,
                    batches,
                    "drain interrupted by shutdown"
                );
                return;
            }

            let processed = match run_sweep(
                self.events.as_ref(),
                self.pre_aggregates.as_ref(),
                &self.rules,
                &self.config,
            )
            .await
            {
                Ok(processed) => processed,
                Err(error) => {
                    // The checkpoint did not move; the next tick retries.
                    error!(%error, bucket = %self.config.bucket_size, "sweep failed");
                    return;
                }
            };

            batches += 1;

            if processed < self.config.batch_size {
                if batches > 1 {
                    info!(bucket = %self.config.bucket_size, batches, "backlog drained");
                }
                return;
            }
        }

        warn!(
            bucket = %self.config.bucket_size,
            max_batches = MAX_CONSECUTIVE_BATCHES,
            "max consecutive sweep batches reached, resuming on next tick"
        );
    }
}
