//! The HTTP webhook admission path (spec.md §4.5.2). Grounded on the
//! teacher's `domains/newsletter/webhook.rs`: a `WebhookState` injected into
//! an `axum::Router`, one route, one handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::clock;
use crate::config::Config;
use crate::service_client::ServiceClient;
use crate::signature;
use crate::store::{Store, StoreError};
use crate::subject;

#[derive(Clone)]
pub struct WebhookState {
    pub store: Arc<Store>,
    pub client: Arc<ServiceClient>,
    pub config: Arc<Config>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

async fn handle_webhook(State(state): State<WebhookState>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Err(err) = signature::verify(
        &state.config.webhook_secret,
        &body,
        header_str("user-agent"),
        header_str("x-pyrus-sig"),
        header_str("x-pyrus-retry"),
    ) {
        warn!(error = %err, "webhook rejected during signature verification");
        return bad_request(&err.to_string());
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "webhook body did not parse as JSON");
            return bad_request("invalid json body");
        }
    };

    match admit(&state, &payload).await {
        Ok(AdmissionOutcome::Inserted(task_id, task)) => {
            info!(task_id, "webhook admitted and inserted new task");
            spawn_client_field_propagation(state.client.clone(), state.config.clone(), task, task_id);
            (StatusCode::OK, Json(json!({}))).into_response()
        }
        Ok(AdmissionOutcome::AlreadyPresent(task_id)) => {
            info!(task_id, "webhook delivered for an already-tracked task");
            (StatusCode::OK, Json(json!({}))).into_response()
        }
        Ok(AdmissionOutcome::NotAdmitted) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(AdmissionError::InvalidInput(reason)) => bad_request(&reason),
        Err(AdmissionError::Store(err)) => {
            warn!(error = %err, "webhook admission failed a store operation");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "store error" })),
            )
                .into_response()
        }
    }
}

fn bad_request(reason: &str) -> axum::response::Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
}

/// Runs off the request path — the webhook handler's only blocking
/// operation is the store insert (spec.md §5).
fn spawn_client_field_propagation(client: Arc<ServiceClient>, config: Arc<Config>, task: Value, task_id: i64) {
    tokio::spawn(async move {
        if let Err(err) = subject::propagate_client_field(&client, &config, &task, task_id).await {
            warn!(task_id, error = %err, "client-field propagation failed");
        }
    });
}

enum AdmissionOutcome {
    Inserted(i64, Value),
    AlreadyPresent(i64),
    NotAdmitted,
}

enum AdmissionError {
    InvalidInput(String),
    Store(StoreError),
}

impl From<StoreError> for AdmissionError {
    fn from(err: StoreError) -> Self {
        AdmissionError::Store(err)
    }
}

async fn admit(state: &WebhookState, payload: &Value) -> Result<AdmissionOutcome, AdmissionError> {
    let task = payload
        .get("task")
        .ok_or_else(|| AdmissionError::InvalidInput("missing task object".into()))?;

    let task_id = payload
        .get("task_id")
        .and_then(Value::as_i64)
        .or_else(|| task.get("id").and_then(Value::as_i64))
        .ok_or_else(|| AdmissionError::InvalidInput("missing task_id".into()))?;

    let raw_due = task
        .get("due")
        .and_then(Value::as_str)
        .or_else(|| task.get("due_date").and_then(Value::as_str));

    let duration = payload.get("duration").and_then(Value::as_i64);

    let due = match (raw_due, duration) {
        (Some(due), Some(minutes)) => clock::add_duration(Some(due), minutes)
            .map_err(|e| AdmissionError::InvalidInput(e.to_string()))?
            .expect("Some input always yields Some output"),
        (Some(due), None) => clock::normalize_due(due).map_err(|e| AdmissionError::InvalidInput(e.to_string()))?,
        (None, _) => return Err(AdmissionError::InvalidInput("no deadline resolves".into())),
    };

    let create_date = task
        .get("create_date")
        .and_then(Value::as_str)
        .ok_or_else(|| AdmissionError::InvalidInput("missing create_date".into()))?;
    let last_modified_date = task
        .get("last_modified_date")
        .and_then(Value::as_str)
        .ok_or_else(|| AdmissionError::InvalidInput("missing last_modified_date".into()))?;

    let create_date = clock::parse_iso_to_utc(create_date).map_err(|e| AdmissionError::InvalidInput(e.to_string()))?;
    let last_modified_date =
        clock::parse_iso_to_utc(last_modified_date).map_err(|e| AdmissionError::InvalidInput(e.to_string()))?;

    let bot_just_invited = task
        .get("comments")
        .and_then(Value::as_array)
        .and_then(|comments| comments.last())
        .and_then(|comment| comment.get("subscribers_added"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_i64)
                .any(|id| id == state.config.bot_id)
        })
        .unwrap_or(false);

    if create_date != last_modified_date && !bot_just_invited {
        return Ok(AdmissionOutcome::NotAdmitted);
    }

    if state.store.exists(task_id).await? {
        return Ok(AdmissionOutcome::AlreadyPresent(task_id));
    }

    state.store.insert(task_id, &due, &due).await?;
    Ok(AdmissionOutcome::Inserted(task_id, task.clone()))
}
