//! Event-sourced usage state engine.
//!
//! Clients append immutable usage events; a cursor-driven sweeper
//! materializes pre-aggregates behind a durable checkpoint; range queries
//! merge the durable pre-aggregates with the unswept raw-event tail so
//! answers stay deterministic and fresh while the sweeper lags.

use std::sync::Arc;

use rocket::{Ignite, Rocket};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::ingestion::{AcceptAllValidator, Ingestor};
use crate::projection::ProjectionService;
use crate::rules::RuleSet;
use crate::store::{EventStore, PreAggregateStore, SqliteEventStore, SqlitePreAggregateStore};
use crate::sweeper::Scheduler;

mod aggregate;
pub mod api;
pub mod config;
mod error;
mod event;
mod ingestion;
mod partition;
mod projection;
mod rules;
mod store;
mod sweeper;

pub use config::setup_tracing;

#[cfg(test)]
pub(crate) mod test_utils;

pub async fn launch(config: Config) -> anyhow::Result<()> {
    let pool = config.sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let rules = Arc::new(RuleSet::load(&config.rules_dir)?);
    let events: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));
    let pre_aggregates: Arc<dyn PreAggregateStore> =
        Arc::new(SqlitePreAggregateStore::new(pool.clone()));

    let shutdown = CancellationToken::new();
    let scheduler_task = spawn_scheduler_task(&config, &events, &pre_aggregates, &rules, &shutdown);
    let server_task = spawn_server_task(&config, &events, &pre_aggregates, &rules);

    await_shutdown(server_task, scheduler_task, shutdown).await;

    info!("shutdown complete");
    Ok(())
}

fn spawn_scheduler_task(
    config: &Config,
    events: &Arc<dyn EventStore>,
    pre_aggregates: &Arc<dyn PreAggregateStore>,
    rules: &Arc<RuleSet>,
    shutdown: &CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.sweeper_enabled {
        info!("sweeper disabled by config");
        return None;
    }

    let scheduler = Scheduler::new(
        config.sweep_interval,
        Arc::clone(events),
        Arc::clone(pre_aggregates),
        Arc::clone(rules),
        config.sweep_config(),
    );
    Some(tokio::spawn(scheduler.run(shutdown.clone())))
}

fn spawn_server_task(
    config: &Config,
    events: &Arc<dyn EventStore>,
    pre_aggregates: &Arc<dyn PreAggregateStore>,
    rules: &Arc<RuleSet>,
) -> JoinHandle<Result<Rocket<Ignite>, rocket::Error>> {
    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(events),
        Arc::new(AcceptAllValidator),
    ));
    let projection = Arc::new(ProjectionService::new(
        Arc::clone(events),
        Arc::clone(pre_aggregates),
        Arc::clone(rules),
    ));

    let rocket_config = rocket::Config::figment()
        .merge(("port", config.server_port))
        .merge(("address", "0.0.0.0"))
        .merge(("limits.json", format!("{}KiB", config.max_body_kib)));

    let rocket = rocket::custom(rocket_config)
        .mount("/", api::api_routes())
        .register("/", api::api_catchers())
        .manage(Arc::clone(events))
        .manage(ingestor)
        .manage(projection);

    tokio::spawn(rocket.launch())
}

async fn await_shutdown(
    server_task: JoinHandle<Result<Rocket<Ignite>, rocket::Error>>,
    scheduler_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
) {
    let server_abort = server_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, shutting down gracefully");
            shutdown.cancel();
            abort_task("server", &server_abort);
        }
        result = server_task => {
            log_server_result(result);
            shutdown.cancel();
        }
    }

    // The scheduler runs its bounded final drain before this join returns.
    if let Some(task) = scheduler_task {
        if let Err(join_error) = task.await {
            if !join_error.is_cancelled() {
                error!("scheduler task panicked: {join_error}");
            }
        }
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("aborting {name} task");
    handle.abort();
}

fn log_server_result(result: Result<Result<Rocket<Ignite>, rocket::Error>, JoinError>) {
    match result {
        Ok(Ok(_)) => info!("server completed"),
        Ok(Err(launch_error)) => error!("server failed: {launch_error}"),
        Err(join_error) => {
            if !join_error.is_cancelled() {
                error!("server task panicked: {join_error}");
            }
        }
    }
}
