//! HTTP surface: ingestion, state queries, raw event listing, and health.

use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Catcher, Route, State, catch, catchers, get, post, routes};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::{EnvelopeError, IngestError, QueryError};
use crate::event::{Event, IngestRequest};
use crate::ingestion::Ingestor;
use crate::projection::{AggregateQuery, AggregateReport, Granularity, ProjectionService};
use crate::store::EventStore;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;

type ApiResponse = Custom<Json<Value>>;

#[derive(Serialize)]
struct ErrorBody {
    error_type: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

fn error_response(
    status: Status,
    error_type: &'static str,
    message: String,
    details: Option<Value>,
) -> ApiResponse {
    let body = ErrorBody {
        error_type,
        message,
        details,
    };
    Custom(status, Json(json!(body)))
}

fn ingest_error_response(error: IngestError) -> ApiResponse {
    match error {
        IngestError::InvalidEnvelope(e) => {
            error_response(Status::BadRequest, "invalid_envelope", e.to_string(), None)
        }
        IngestError::SchemaValidation(violation) => error_response(
            Status::BadRequest,
            "schema_validation_failed",
            violation.to_string(),
            None,
        ),
        IngestError::Duplicate { .. } => error_response(
            Status::Conflict,
            "duplicate_event",
            "Event already exists".to_string(),
            None,
        ),
        IngestError::Storage(e) => error_response(
            Status::InternalServerError,
            "internal_error",
            "Failed to persist event".to_string(),
            Some(json!(e.to_string())),
        ),
    }
}

fn query_error_response(error: QueryError) -> ApiResponse {
    match error {
        QueryError::InvalidQuery(message) => {
            error_response(Status::BadRequest, "invalid_query", message, None)
        }
        QueryError::TailTooDeep { .. } => error_response(
            Status::InternalServerError,
            "aggregation_behind",
            error.to_string(),
            None,
        ),
        QueryError::Storage(e) => error_response(
            Status::InternalServerError,
            "internal_error",
            "Failed to query aggregates".to_string(),
            Some(json!(e.to_string())),
        ),
    }
}

#[derive(Serialize)]
struct WindowBody {
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    /// Decimal serialized as a string to keep exact semantics on the wire.
    value: String,
    event_count: i64,
}

#[derive(Serialize)]
struct StateResponse {
    principal_id: String,
    rule: String,
    operator: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: String,
    data_through: DateTime<Utc>,
    staleness_seconds: i64,
    stale_rule: bool,
    values: Vec<WindowBody>,
}

impl From<AggregateReport> for StateResponse {
    fn from(report: AggregateReport) -> Self {
        Self {
            principal_id: report.principal_id,
            rule: report.rule,
            operator: report.operator.to_string(),
            start: report.start,
            end: report.end,
            granularity: report.granularity.to_string(),
            data_through: report.data_through,
            staleness_seconds: report.staleness_seconds,
            stale_rule: report.stale_rule,
            values: report
                .values
                .into_iter()
                .map(|window| WindowBody {
                    window_start: window.window_start,
                    window_end: window.window_end,
                    value: window.value.to_string(),
                    event_count: window.event_count,
                })
                .collect(),
        }
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ApiResponse> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            error_response(
                Status::BadRequest,
                "invalid_query",
                format!("invalid {field} timestamp {value:?}: {e}"),
                None,
            )
        })
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, ApiResponse> {
    value.ok_or_else(|| {
        error_response(
            Status::BadRequest,
            "invalid_query",
            format!("{field} query parameter is required"),
            None,
        )
    })
}

#[post("/v1/events", format = "json", data = "<body>")]
async fn ingest_event(body: Json<Value>, ingestor: &State<Arc<Ingestor>>) -> ApiResponse {
    let request: IngestRequest = match serde_json::from_value(body.into_inner()) {
        Ok(request) => request,
        Err(e) => {
            return ingest_error_response(EnvelopeError::Malformed(e.to_string()).into());
        }
    };

    let event = match Event::try_from(request) {
        Ok(event) => event,
        Err(e) => return ingest_error_response(e.into()),
    };

    match ingestor.ingest(event).await {
        Ok(_) => Custom(Status::Accepted, Json(json!({"status": "accepted"}))),
        Err(error) => ingest_error_response(error),
    }
}

#[get("/v1/state/<principal_id>?<rule>&<start>&<end>&<granularity>")]
async fn query_state(
    principal_id: &str,
    rule: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    granularity: Option<&str>,
    projection: &State<Arc<ProjectionService>>,
) -> ApiResponse {
    let query = match build_query(principal_id, rule, start, end, granularity) {
        Ok(query) => query,
        Err(response) => return response,
    };

    match projection.query_aggregates(&query).await {
        Ok(report) => Custom(Status::Ok, Json(json!(StateResponse::from(report)))),
        Err(error) => query_error_response(error),
    }
}

fn build_query(
    principal_id: &str,
    rule: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    granularity: Option<&str>,
) -> Result<AggregateQuery, ApiResponse> {
    let rule = required("rule", rule)?;
    let start = parse_timestamp("start", required("start", start)?)?;
    let end = parse_timestamp("end", required("end", end)?)?;

    let granularity = match granularity {
        None | Some("") => Granularity::Total,
        Some(label) => label.parse().map_err(|e: crate::projection::ParseGranularityError| {
            error_response(Status::BadRequest, "invalid_query", e.to_string(), None)
        })?,
    };

    Ok(AggregateQuery {
        principal_id: principal_id.to_string(),
        rule: rule.to_string(),
        start,
        end,
        granularity,
    })
}

#[get("/v1/events/<principal_id>?<start>&<end>&<limit>")]
async fn list_events(
    principal_id: &str,
    start: Option<&str>,
    end: Option<&str>,
    limit: Option<usize>,
    events: &State<Arc<dyn EventStore>>,
) -> ApiResponse {
    let start = match required("start", start).and_then(|v| parse_timestamp("start", v)) {
        Ok(start) => start,
        Err(response) => return response,
    };
    let end = match required("end", end).and_then(|v| parse_timestamp("end", v)) {
        Ok(end) => end,
        Err(response) => return response,
    };
    if end <= start {
        return error_response(
            Status::BadRequest,
            "invalid_query",
            "end time must be after start time".to_string(),
            None,
        );
    }

    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    match events.list_by_principal(principal_id, start, end, limit).await {
        Ok(listed) => Custom(
            Status::Ok,
            Json(json!({
                "principal_id": principal_id,
                "count": listed.len(),
                "events": listed,
            })),
        ),
        Err(e) => error_response(
            Status::InternalServerError,
            "internal_error",
            "Failed to list events".to_string(),
            Some(json!(e.to_string())),
        ),
    }
}

#[get("/health")]
async fn health(events: &State<Arc<dyn EventStore>>) -> ApiResponse {
    match events.ping().await {
        Ok(()) => Custom(Status::Ok, Json(json!({"status": "healthy"}))),
        Err(e) => Custom(
            Status::ServiceUnavailable,
            Json(json!({"status": "unhealthy", "error": e.to_string()})),
        ),
    }
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    Json(json!({"error_type": "invalid_json", "message": "Invalid request"}))
}

#[catch(404)]
fn not_found() -> Json<Value> {
    Json(json!({"error_type": "not_found", "message": "Resource not found"}))
}

#[catch(413)]
fn payload_too_large() -> Json<Value> {
    Json(json!({
        "error_type": "body_too_large",
        "message": "Request body exceeds maximum allowed size"
    }))
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    Json(json!({"error_type": "invalid_json", "message": "Invalid request body"}))
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    Json(json!({"error_type": "internal_error", "message": "Internal server error"}))
}

pub(crate) fn api_routes() -> Vec<Route> {
    routes![ingest_event, query_state, list_events, health]
}

pub(crate) fn api_catchers() -> Vec<Catcher> {
    catchers![
        bad_request,
        not_found,
        payload_too_large,
        unprocessable,
        internal_error
    ]
}
