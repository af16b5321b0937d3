//! HTTP routes for the consumer and producer services.
//!
//! Response bodies keep the shapes existing clients rely on: `status` strings
//! on success, `error` strings on failure.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core_config::AppInfo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::{ExchangeKind, QueueBinder};
use crate::error::ConsumerError;
use crate::health::{health_router, ready_router};
use crate::metrics;
use crate::registry::{ConsumerRegistry, StartOutcome, StopOutcome};

/// Queue used by `/send` when the request names none.
pub const DEFAULT_QUEUE: &str = "default_queue";

/// Error returned by route handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Request was malformed or incomplete
    BadRequest(String),
    /// Failure from the consumer core or the broker
    Consumer(ConsumerError),
}

impl From<ConsumerError> for ApiError {
    fn from(e: ConsumerError) -> Self {
        ApiError::Consumer(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Consumer(ConsumerError::InvalidRequest(message)) => {
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::Consumer(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn status(message: String) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": message })))
}

/// Parse a non-empty JSON object body into `T`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) if !map.is_empty() => serde_json::from_value(Value::Object(map))
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}"))),
        _ => Err(ApiError::BadRequest("No data provided".to_string())),
    }
}

// ============================================================================
// Consumer service
// ============================================================================

/// Shared state for the consumer routes.
#[derive(Clone)]
pub struct ConsumerApiState {
    pub registry: Arc<ConsumerRegistry>,
    pub binder: Arc<dyn QueueBinder>,
}

/// `POST /bind_queue` body.
#[derive(Debug, Deserialize)]
pub struct BindQueueRequest {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// `POST /start_consumer/{queue}`
pub async fn start_consumer(
    State(state): State<ConsumerApiState>,
    Path(queue): Path<String>,
) -> ApiResult {
    let message = match state.registry.start(&queue)? {
        StartOutcome::Started => format!("Consumer started for queue: {queue}"),
        StartOutcome::AlreadyActive => format!("Consumer already exists for queue: {queue}"),
    };
    Ok(status(message))
}

/// `POST /stop_consumer/{queue}`
pub async fn stop_consumer(
    State(state): State<ConsumerApiState>,
    Path(queue): Path<String>,
) -> ApiResult {
    match state.registry.stop(&queue)? {
        StopOutcome::Stopped => Ok(status(format!("Consumer stopped for queue: {queue}"))),
        StopOutcome::NotFound => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": format!("No active consumer for queue: {queue}") })),
        )),
    }
}

/// `POST /bind_queue`
///
/// Without an exchange only the queue is declared.
pub async fn bind_queue(State(state): State<ConsumerApiState>, body: Bytes) -> ApiResult {
    let request: BindQueueRequest = parse_body(&body)?;

    let queue = request.queue.unwrap_or_default();
    if queue.is_empty() {
        return Err(ApiError::BadRequest("Queue name is required".to_string()));
    }
    let exchange = request.exchange.unwrap_or_default();
    let routing_key = request.routing_key.unwrap_or_default();

    if exchange.is_empty() {
        state.binder.declare_queue(&queue).await?;
        info!(queue = %queue, "Queue declared");
        return Ok(status(format!("Queue '{queue}' created successfully")));
    }

    state
        .binder
        .bind_queue(&queue, &exchange, &routing_key)
        .await?;
    info!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Queue bound");
    Ok(status(format!(
        "Queue '{queue}' bound to exchange '{exchange}' with routing key '{routing_key}'"
    )))
}

/// `GET /messages/{queue}`
pub async fn get_messages(
    State(state): State<ConsumerApiState>,
    Path(queue): Path<String>,
) -> ApiResult {
    let messages = state.registry.messages(&queue)?;
    Ok((StatusCode::OK, Json(serde_json::to_value(messages).map_err(ConsumerError::from)?)))
}

/// `POST /clear_messages/{queue}`
pub async fn clear_messages(
    State(state): State<ConsumerApiState>,
    Path(queue): Path<String>,
) -> ApiResult {
    state.registry.clear(&queue)?;
    Ok(status(format!("Messages cleared for queue: {queue}")))
}

/// `GET /active_queues`
pub async fn active_queues(State(state): State<ConsumerApiState>) -> ApiResult {
    let active = state.registry.list_active()?;
    Ok((StatusCode::OK, Json(json!({ "active_queues": active }))))
}

/// `GET /consumers`
pub async fn consumers(State(state): State<ConsumerApiState>) -> ApiResult {
    let workers = state.registry.worker_states()?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "consumers": workers,
            "spawned_workers": state.registry.spawned_workers(),
        })),
    ))
}

/// Consumer service router, including health, readiness and metrics.
pub fn consumer_router(state: ConsumerApiState, app: AppInfo) -> Router {
    let registry = Arc::clone(&state.registry);

    Router::new()
        .route("/start_consumer/{queue}", post(start_consumer))
        .route("/stop_consumer/{queue}", post(stop_consumer))
        .route("/bind_queue", post(bind_queue))
        .route("/messages/{queue}", get(get_messages))
        .route("/clear_messages/{queue}", post(clear_messages))
        .route("/active_queues", get(active_queues))
        .route("/consumers", get(consumers))
        .with_state(state)
        .merge(health_router(app))
        .merge(ready_router(registry))
}

// ============================================================================
// Producer service
// ============================================================================

/// Shared state for the producer routes.
#[derive(Clone)]
pub struct ProducerApiState {
    pub binder: Arc<dyn QueueBinder>,
}

/// `POST /send` body.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// `POST /create_exchange` body.
#[derive(Debug, Deserialize)]
pub struct CreateExchangeRequest {
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// `POST /send`
///
/// Publishes `message` JSON-encoded. With no exchange the queue is declared
/// first and the message goes through the default exchange.
pub async fn send_message(State(state): State<ProducerApiState>, body: Bytes) -> ApiResult {
    let request: SendRequest = parse_body(&body)?;

    let queue = request.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    let exchange = request.exchange.unwrap_or_default();
    let routing_key = request.routing_key.unwrap_or_else(|| queue.clone());
    let message = request.message.unwrap_or_else(|| Value::String(String::new()));
    let payload = serde_json::to_vec(&message).map_err(ConsumerError::from)?;

    let result = async {
        if exchange.is_empty() {
            state.binder.declare_queue(&queue).await?;
        }
        state.binder.publish(&exchange, &routing_key, &payload).await
    }
    .await;
    metrics::message_published(&exchange, result.is_ok());
    result?;

    info!(exchange = %exchange, routing_key = %routing_key, bytes = payload.len(), "Message sent");
    Ok(status("Message sent successfully".to_string()))
}

/// `POST /create_exchange`
pub async fn create_exchange(State(state): State<ProducerApiState>, body: Bytes) -> ApiResult {
    let request: CreateExchangeRequest = parse_body(&body)?;

    let exchange = request.exchange.unwrap_or_default();
    if exchange.is_empty() {
        return Err(ApiError::BadRequest("Exchange name is required".to_string()));
    }
    let kind = match request.kind.as_deref() {
        None => ExchangeKind::Direct,
        Some(kind) => ExchangeKind::from_str(kind).map_err(|_| {
            warn!(exchange = %exchange, kind = %kind, "Unsupported exchange type");
            ApiError::BadRequest(format!("Unsupported exchange type: {kind}"))
        })?,
    };

    state.binder.declare_exchange(&exchange, kind).await?;
    info!(exchange = %exchange, kind = %kind, "Exchange declared");
    Ok(status(format!("Exchange '{exchange}' created successfully")))
}

/// Producer service router, including health and metrics.
pub fn producer_router(state: ProducerApiState, app: AppInfo) -> Router {
    Router::new()
        .route("/send", post(send_message))
        .route("/create_exchange", post(create_exchange))
        .with_state(state)
        .merge(health_router(app))
}
