//! Domain-specific error types, separated by subsystem boundary.
//! Storage, ingestion, query, and rule-loading failures each carry their own
//! enum; the HTTP surface maps them to status codes.

use std::path::PathBuf;

use thiserror::Error;

/// Durable-store failures shared by the event log and pre-aggregate store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
    #[error("Aggregate bucket mismatch: flush for {expected} received key with {actual}")]
    BucketMismatch { expected: String, actual: String },
}

/// Event envelope validation errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("id is required")]
    MissingId,
    #[error("principal_id is required")]
    MissingPrincipalId,
    #[error("type is required")]
    MissingType,
    #[error("occurred_at is required")]
    MissingOccurredAt,
    #[error("Invalid event envelope: {0}")]
    Malformed(String),
}

/// Schema validation rejection raised by a pluggable validator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SchemaViolation {
    pub message: String,
}

/// Write-path errors surfaced by the ingestion facade.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    InvalidEnvelope(#[from] EnvelopeError),
    #[error("Schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaViolation),
    #[error("Event already exists: principal {principal_id}, id {id}")]
    Duplicate { principal_id: String, id: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Read-path errors surfaced by the projection service.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid aggregate query: {0}")]
    InvalidQuery(String),
    #[error(
        "Raw event tail scan exceeded {max_batches} batches ({events_scanned} events scanned); \
         aggregation is too far behind"
    )]
    TailTooDeep {
        max_batches: usize,
        events_scanned: usize,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Sweep iteration errors. Folding itself is pure; only fetch, flush, and the
/// worker join points can fail.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Fold worker panicked: {0}")]
    WorkerPanic(String),
    #[error("Event from store is missing its ingest sequence")]
    MissingSequence,
}

/// Aggregation rule loading errors.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse rule file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },
    #[error("Rule {name:?}: source_event must not be empty")]
    MissingSourceEvent { name: String },
    #[error("Rule {name:?}: unsupported operator {operator:?}")]
    UnknownOperator { name: String, operator: String },
    #[error("Rule {name:?}: window_size customization is disabled (use 1m)")]
    UnsupportedWindow { name: String },
    #[error("Rule {name:?}: duplicate rule name")]
    DuplicateName { name: String },
    #[error("Aggregation rule path {path} is not a directory")]
    NotADirectory { path: PathBuf },
}
