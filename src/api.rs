use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    error::{IndexError, QueryError},
    models::QueryResult,
    rag::Status,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct QueryPayload {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Deserialize)]
pub struct AnomalyPayload {
    equipment_id: String,
    anomaly_type: String,
    #[serde(default)]
    severity: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/query", post(query_handler))
        .route("/analyze_anomaly", post(analyze_anomaly_handler))
        .route("/reindex", post(reindex_handler))
        .with_state(app_state)
}

fn detail(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": message.into() })))
}

/// Traduce errores del servicio a respuestas HTTP sin exponer detalles internos
/// más allá del mensaje.
fn query_error_response(context: &str, err: &QueryError) -> ApiError {
    match err {
        QueryError::NotInitialized => {
            detail(StatusCode::SERVICE_UNAVAILABLE, "RAG system not initialized")
        }
        QueryError::InvalidTopK { .. } => detail(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        _ => detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{context} failed: {err}"),
        ),
    }
}

fn rejection_response(rejection: JsonRejection) -> ApiError {
    detail(rejection.status(), rejection.body_text())
}

// --- Handlers ---

#[axum::debug_handler]
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Industrial LLM Insight API",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "rag_system_initialized": state.service.is_initialized(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.service.status().await)
}

#[axum::debug_handler]
async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryPayload>, JsonRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let Json(payload) = payload.map_err(rejection_response)?;

    state
        .service
        .handle_query(&payload.query, payload.top_k)
        .await
        .map(Json)
        .map_err(|e| query_error_response("Query processing", &e))
}

#[axum::debug_handler]
async fn analyze_anomaly_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnomalyPayload>, JsonRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let Json(payload) = payload.map_err(rejection_response)?;

    state
        .service
        .handle_anomaly_report(
            &payload.equipment_id,
            &payload.anomaly_type,
            payload.severity.as_deref(),
        )
        .await
        .map(Json)
        .map_err(|e| query_error_response("Anomaly analysis", &e))
}

/// Reconstruye el índice en segundo plano desde `LOG_DATA_PATHS`. El estado
/// `Building` se reserva antes de responder, así una segunda petición
/// concurrente recibe 409.
#[axum::debug_handler]
async fn reindex_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let reservation = state.service.reserve_build().map_err(|err| match err {
        IndexError::AlreadyBuilding => detail(
            StatusCode::CONFLICT,
            "An index build is already in progress",
        ),
        other => detail(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;

    spawn(async move {
        info!("Reindexación solicitada vía API.");
        if let Err(err) = state
            .service
            .rebuild_reserved(reservation, state.config.log_data_paths.clone())
            .await
        {
            error!("Error en la reindexación: {}", err);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Reindexing started" })),
    ))
}
