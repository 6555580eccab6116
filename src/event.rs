//! The event envelope: the atomic, immutable unit of the system.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// One usage occurrence, appended to the log and never mutated.
///
/// The envelope (id, principal, type, timestamps) is owned by the system;
/// `data` is the free-form domain payload. `(principal_id, id)` is the
/// idempotency key; `ingest_seq` is the server-assigned strict total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Client-assigned identifier, unique per principal.
    pub id: String,
    /// The entity usage is attributed to (user, account, API key).
    pub principal_id: String,
    /// Domain event name; selects which aggregation rules apply.
    #[serde(rename = "type")]
    pub event_type: String,
    /// 0 means "no schema validation".
    #[serde(default)]
    pub schema_version: u32,
    /// When the event happened in the real world (client clock); used for
    /// window bucketing.
    pub occurred_at: DateTime<Utc>,
    /// When the server accepted the event (audit only). Assigned on append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    /// Server-assigned monotonic sequence. Internal cursor; never exposed.
    #[serde(skip)]
    pub ingest_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Checks the required envelope fields. Payload contents are not
    /// inspected here; that is the schema validator's job.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        if self.principal_id.is_empty() {
            return Err(EnvelopeError::MissingPrincipalId);
        }
        if self.event_type.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(())
    }
}

/// Wire shape of `POST /v1/events`. Every field is optional at the parse
/// layer so that missing required fields surface as envelope errors (400)
/// instead of body deserialization failures.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

impl TryFrom<IngestRequest> for Event {
    type Error = EnvelopeError;

    fn try_from(request: IngestRequest) -> Result<Self, Self::Error> {
        let occurred_at = request.occurred_at.ok_or(EnvelopeError::MissingOccurredAt)?;

        let event = Self {
            id: request.id.unwrap_or_default(),
            principal_id: request.principal_id.unwrap_or_default(),
            event_type: request.event_type.unwrap_or_default(),
            schema_version: request.schema_version.unwrap_or(0),
            occurred_at,
            ingested_at: None,
            ingest_seq: None,
            metadata: request.metadata.unwrap_or_default(),
            data: request.data.unwrap_or_default(),
        };

        event.validate()?;
        Ok(event)
    }
}
