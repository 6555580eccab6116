//! Environment-driven configuration and process-level setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlx::SqlitePool;
use tracing::Level;

use crate::sweeper::SweepConfig;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    database_url: String,
    #[clap(long, env, default_value = "info")]
    log_level: LogLevel,
    #[clap(long, env, default_value = "8080")]
    server_port: u16,
    /// Seconds between sweep scheduler ticks
    #[clap(long, env, default_value = "120")]
    sweep_interval: u64,
    /// Maximum events fetched per sweep iteration
    #[clap(long, env, default_value = "50000")]
    sweep_batch_size: usize,
    /// In-memory fold parallelism per sweep iteration
    #[clap(long, env, default_value = "10")]
    sweep_worker_count: usize,
    /// Run the HTTP surface without the background sweeper
    #[clap(long, env)]
    disable_sweeper: bool,
    /// Directory of aggregation rule YAML files
    #[clap(long, env, default_value = "rules")]
    rules_dir: PathBuf,
    /// Maximum accepted request body size in kibibytes
    #[clap(long, env, default_value = "1024")]
    max_body_kib: u32,
}

impl Env {
    pub fn into_config(self) -> Config {
        Config {
            database_url: self.database_url,
            log_level: self.log_level,
            server_port: self.server_port,
            sweep_interval: Duration::from_secs(self.sweep_interval),
            sweep_batch_size: self.sweep_batch_size,
            sweep_worker_count: self.sweep_worker_count,
            sweeper_enabled: !self.disable_sweeper,
            rules_dir: self.rules_dir,
            max_body_kib: self.max_body_kib,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) server_port: u16,
    pub(crate) sweep_interval: Duration,
    pub(crate) sweep_batch_size: usize,
    pub(crate) sweep_worker_count: usize,
    pub(crate) sweeper_enabled: bool,
    pub(crate) rules_dir: PathBuf,
    pub(crate) max_body_kib: u32,
}

impl Config {
    pub async fn sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub(crate) fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            batch_size: self.sweep_batch_size,
            worker_count: self.sweep_worker_count,
            ..SweepConfig::default()
        }
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers while a flush transaction is writing;
    // SQLite still admits only one writer at a time.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // When ingestion and a flush contend for the writer slot, wait instead
    // of failing immediately with "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("aevon={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
