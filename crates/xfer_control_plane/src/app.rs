use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;
use uuid::Uuid;

use xfer_core::{NewTransfer, ResourceCatalog, ResourceTransfer, TransferError};
use xfer_storage::TransferStore;
use xfer_strategy::StrategyRegistry;

use crate::job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseUpdate {
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    approved_by: Uuid,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

/// Presentation shape for a transfer: the record plus the derived strings
/// the UI renders.
#[derive(Debug, Serialize)]
pub struct TransferView {
    #[serde(flatten)]
    pub transfer: ResourceTransfer,
    pub status_label: &'static str,
    pub mode_label: &'static str,
    pub formatted_progress: String,
}

impl From<ResourceTransfer> for TransferView {
    fn from(transfer: ResourceTransfer) -> Self {
        let status_label = transfer.status_label();
        let mode_label = transfer.mode_label();
        let formatted_progress = transfer.formatted_progress();
        Self {
            transfer,
            status_label,
            mode_label,
            formatted_progress,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: TransferStore,
    pub catalog: Arc<dyn ResourceCatalog>,
    pub strategies: Arc<StrategyRegistry>,
    pub workdir: PathBuf,
    pub sse_bus: broadcast::Sender<SseUpdate>,
    pub auth_token: Option<String>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(
        store: TransferStore,
        catalog: Arc<dyn ResourceCatalog>,
        strategies: Arc<StrategyRegistry>,
        workdir: PathBuf,
        auth_token: Option<String>,
        require_bearer: bool,
    ) -> Self {
        let (sse_bus, _) = broadcast::channel(256);
        Self {
            store,
            catalog,
            strategies,
            workdir,
            sse_bus,
            auth_token,
            require_bearer,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/transfers", post(create_transfer).get(list_transfers))
        .route("/v1/transfers/events", get(stream_events))
        .route("/v1/transfers/{transfer_id}", get(get_transfer))
        .route("/v1/transfers/{transfer_id}/approve", post(approve_transfer))
        .route("/v1/transfers/{transfer_id}/cancel", post(cancel_transfer))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.store.ping().await.is_ok();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

/// Creates a transfer. Ungated transfers start immediately; gated ones wait
/// in `pending` for an approver.
async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewTransfer>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers, true).await?;

    let transfer = state
        .store
        .create_transfer(&payload)
        .await
        .map_err(error_response)?;
    let transfer_id = transfer.id;

    emit(
        &state,
        "transfer.status.changed",
        json!({ "transfer_id": transfer_id, "status": transfer.status }),
    );

    if !transfer.requires_approval {
        let begun = state.store.begin(transfer_id).await.map_err(error_response)?;
        job::dispatch(&state, &begun).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "transfer_id": transfer_id,
            "status_url": format!("/v1/transfers/{transfer_id}")
        })),
    ))
}

/// Approval gate. The state transition commits first; dispatch runs after,
/// so no database lock is ever held across external work.
async fn approve_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ApproveRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers, true).await?;

    let approved = state
        .store
        .approve(transfer_id, payload.approved_by)
        .await
        .map_err(error_response)?;

    emit(
        &state,
        "transfer.status.changed",
        json!({ "transfer_id": transfer_id, "status": approved.status }),
    );

    job::dispatch(&state, &approved).await;

    let current = state
        .store
        .require_transfer(transfer_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(TransferView::from(current))))
}

/// Cooperative cancellation: flips the row, and the running job halts at
/// its next status check. Data already moved is not rolled back.
async fn cancel_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    authorize(&state, &headers, true).await?;

    let cancelled = state
        .store
        .cancel(transfer_id)
        .await
        .map_err(error_response)?;

    emit(
        &state,
        "transfer.status.changed",
        json!({ "transfer_id": transfer_id, "status": cancelled.status }),
    );

    Ok((StatusCode::OK, Json(TransferView::from(cancelled))))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let transfer = state
        .store
        .require_transfer(transfer_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(TransferView::from(transfer))))
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let limit = query.limit.unwrap_or(100);
    let transfers = state
        .store
        .list_transfers(limit)
        .await
        .map_err(error_response)?;
    let items: Vec<TransferView> = transfers.into_iter().map(TransferView::from).collect();
    Ok((StatusCode::OK, Json(json!({ "items": items }))))
}

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.sse_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(update) => {
                let data = serde_json::to_string(&update.data).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(update.event_type).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    write_operation: bool,
) -> Result<(), (StatusCode, Json<Value>)> {
    if !write_operation || !state.require_bearer {
        return Ok(());
    }

    let token = state.auth_token.clone().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let expected = format!("Bearer {token}");
    if provided == expected {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn error_response(err: TransferError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        TransferError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TransferError::InvalidState { .. } | TransferError::DuplicateTransfer(_) => {
            StatusCode::CONFLICT
        }
        TransferError::TransferNotFound(_)
        | TransferError::ResourceNotFound { .. }
        | TransferError::TargetNotFound { .. } => StatusCode::NOT_FOUND,
        TransferError::Extraction(_) | TransferError::Restore(_) | TransferError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "request failed");
    }

    (
        status,
        Json(json!({ "error": err.kind_str(), "message": err.to_string() })),
    )
}

pub(crate) fn emit(state: &AppState, event_type: &str, data: Value) {
    let _ = state.sse_bus.send(SseUpdate {
        event_type: event_type.to_string(),
        data,
    });
}
