use crate::application::pipeline::{Pipeline, Stage, TurnOutcome};
use crate::config::ToolRegistry;
use crate::domain::types::ToolRegistryEntry;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

struct Conversation {
    pipeline: Pipeline,
    /// Assigned on /start; None until a conversation exists.
    id: Option<String>,
    last_stage: Stage,
}

impl Conversation {
    fn started(&self) -> bool {
        self.id.is_some()
    }
}

/// One pipeline per server process; the mutex serializes turns so the
/// conversation state never sees concurrent mutation.
pub(crate) struct ServerState {
    conversation: Mutex<Conversation>,
    registry: Arc<ToolRegistry>,
}

impl ServerState {
    fn new(pipeline: Pipeline, registry: Arc<ToolRegistry>) -> Self {
        Self {
            conversation: Mutex::new(Conversation {
                pipeline,
                id: None,
                last_stage: Stage::Idle,
            }),
            registry,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(start_handler, continue_handler, status_handler, tools_handler, health_handler),
    components(schemas(
        TurnRequest,
        TurnResponse,
        StatusResponse,
        ToolListResponse,
        HealthResponse,
        ErrorResponse,
        Stage,
        ToolRegistryEntry
    )),
    tags(
        (name = "conversation", description = "Scheme assistant conversation turns"),
        (name = "status", description = "Conversation progress and registry inspection")
    )
)]
struct ApiDoc;

pub async fn serve(
    pipeline: Pipeline,
    registry: Arc<ToolRegistry>,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let api = ApiDoc::openapi();
    info!(%addr, "Binding REST server");

    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let state = Arc::new(ServerState::new(pipeline, registry));
    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", api))
        .route("/start", post(start_handler))
        .route("/continue", post(continue_handler))
        .route("/status", get(status_handler))
        .route("/tools", get(tools_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "REST server ready to accept connections");

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}

#[derive(Debug, Deserialize, ToSchema)]
struct TurnRequest {
    user_query: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct TurnResponse {
    conversation_id: String,
    message: String,
    stage: Stage,
    #[schema(value_type = Object)]
    results: Value,
    /// Full serialized conversation state after the turn.
    #[schema(value_type = Object)]
    state: Value,
}

#[derive(Debug, Serialize, ToSchema)]
struct StatusResponse {
    conversation_id: Option<String>,
    stage: Stage,
    started: bool,
    #[schema(value_type = Object)]
    state: Value,
}

#[derive(Debug, Serialize, ToSchema)]
struct ToolListResponse {
    tools: Vec<ToolRegistryEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

fn turn_response(
    conversation_id: String,
    outcome: TurnOutcome,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ErrorResponse>)> {
    let state = serde_json::to_value(&outcome.state).map_err(|err| {
        error!(error = %err, "Conversation state failed to serialize");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "failed to serialize conversation state".to_string(),
            }),
        )
    })?;
    Ok(Json(TurnResponse {
        conversation_id,
        message: outcome.message,
        stage: outcome.stage,
        results: Value::Object(outcome.results),
        state,
    }))
}

#[utoipa::path(
    post,
    path = "/start",
    tag = "conversation",
    request_body = TurnRequest,
    responses(
        (status = 200, description = "Fresh conversation processed", body = TurnResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    )
)]
async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ErrorResponse>)> {
    if payload.user_query.trim().is_empty() {
        error!("Rejecting /start request due to empty query");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "user_query cannot be empty".to_string(),
            }),
        ));
    }

    let conversation_id = uuid::Uuid::new_v4().to_string();
    info!(%conversation_id, "Received /start request");
    let mut conversation = state.conversation.lock().await;
    let outcome = conversation.pipeline.start(&payload.user_query).await;
    conversation.id = Some(conversation_id.clone());
    conversation.last_stage = outcome.stage;
    turn_response(conversation_id, outcome)
}

#[utoipa::path(
    post,
    path = "/continue",
    tag = "conversation",
    request_body = TurnRequest,
    responses(
        (status = 200, description = "Follow-up turn processed", body = TurnResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "No conversation has been started", body = ErrorResponse)
    )
)]
async fn continue_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ErrorResponse>)> {
    if payload.user_query.trim().is_empty() {
        error!("Rejecting /continue request due to empty query");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "user_query cannot be empty".to_string(),
            }),
        ));
    }

    let mut conversation = state.conversation.lock().await;
    let Some(conversation_id) = conversation.id.clone() else {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "no conversation in progress, call /start first".to_string(),
            }),
        ));
    };

    info!(%conversation_id, "Received /continue request");
    let outcome = conversation.pipeline.process_turn(&payload.user_query).await;
    conversation.last_stage = outcome.stage;
    turn_response(conversation_id, outcome)
}

#[utoipa::path(
    get,
    path = "/status",
    tag = "status",
    responses(
        (status = 200, description = "Current conversation state", body = StatusResponse)
    )
)]
async fn status_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conversation = state.conversation.lock().await;
    let snapshot = serde_json::to_value(conversation.pipeline.state()).map_err(|err| {
        error!(error = %err, "Conversation state failed to serialize");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "failed to serialize conversation state".to_string(),
            }),
        )
    })?;
    Ok(Json(StatusResponse {
        conversation_id: conversation.id.clone(),
        stage: conversation.last_stage,
        started: conversation.started(),
        state: snapshot,
    }))
}

#[utoipa::path(
    get,
    path = "/tools",
    tag = "status",
    responses(
        (status = 200, description = "Registered tools", body = ToolListResponse)
    )
)]
async fn tools_handler(State(state): State<Arc<ServerState>>) -> Json<ToolListResponse> {
    let tools: Vec<ToolRegistryEntry> = state.registry.iter().cloned().collect();
    Json(ToolListResponse { tools })
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "status",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
