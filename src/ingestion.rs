//! The write-path facade: envelope validation, optional schema validation,
//! and idempotent persistence.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{IngestError, SchemaViolation};
use crate::event::Event;
use crate::store::{AppendOutcome, EventStore};

/// Pluggable payload validator. The full schema registry (formats,
/// compilers, versioned definitions) lives behind this seam; the engine
/// only needs accept/reject with a reason.
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate(
        &self,
        event_type: &str,
        schema_version: u32,
        data: &Map<String, Value>,
    ) -> Result<(), SchemaViolation>;
}

/// Validator used when no schema registry is wired in: every payload passes.
pub struct AcceptAllValidator;

#[async_trait]
impl SchemaValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _event_type: &str,
        _schema_version: u32,
        _data: &Map<String, Value>,
    ) -> Result<(), SchemaViolation> {
        Ok(())
    }
}

/// Accepts events, enforces the envelope contract, and delegates to the
/// event store. Never retries a duplicate.
pub struct Ingestor {
    store: Arc<dyn EventStore>,
    validator: Arc<dyn SchemaValidator>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn EventStore>, validator: Arc<dyn SchemaValidator>) -> Self {
        Self { store, validator }
    }

    /// Validates and persists one event, returning it with `ingest_seq` and
    /// `ingested_at` populated.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.id, principal_id = %event.principal_id, event_type = %event.event_type),
        level = tracing::Level::DEBUG
    )]
    pub async fn ingest(&self, mut event: Event) -> Result<Event, IngestError> {
        event.validate()?;

        // schema_version 0 opts out of payload validation.
        if event.schema_version > 0 {
            self.validator
                .validate(&event.event_type, event.schema_version, &event.data)
                .await?;
        }

        match self.store.append(&mut event).await? {
            AppendOutcome::Appended(ingest_seq) => {
                debug!(ingest_seq, "event accepted");
                Ok(event)
            }
            AppendOutcome::Duplicate => {
                info!("duplicate event rejected");
                Err(IngestError::Duplicate {
                    principal_id: event.principal_id,
                    id: event.id,
                })
            }
        }
    }
}
