use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::str::FromStr;
use uuid::Uuid;

use super::handler::AppState;
use super::models::*;
use crate::{
    error::AppResult,
    ledger::{models::{Gateway, ReconciliationQueueItem}, Page},
    middleware::ValidatedJson,
    reconciliation::{IngestReport, RunReport},
};

/// GET /reconciliation/queue
pub async fn list_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> AppResult<Json<Page<ReconciliationQueueItem>>> {
    let (filter, page) = query.into_filter()?;
    Ok(Json(state.desk.list_items(&filter, page).await?))
}

/// GET /reconciliation/queue/:id
pub async fn get_queue_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReconciliationQueueItem>> {
    Ok(Json(state.desk.get_item(id).await?))
}

/// POST /reconciliation/queue/:id/link
pub async fn link_queue_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<LinkRequest>,
) -> AppResult<Json<ReconciliationQueueItem>> {
    let item = state
        .desk
        .link_transaction(id, request.transaction_id, request.notes)
        .await?;
    Ok(Json(item))
}

/// POST /reconciliation/queue/:id/resolve
pub async fn resolve_queue_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ResolveRequest>,
) -> AppResult<Json<ReconciliationQueueItem>> {
    Ok(Json(state.desk.mark_resolved(id, &request.notes).await?))
}

/// POST /reconciliation/runs - on-demand matcher run for one window
pub async fn run_reconciliation(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<RunRequest>,
) -> AppResult<(StatusCode, Json<RunReport>)> {
    let report = state
        .reconciler
        .reconcile(request.gateway, request.window_start, request.window_end)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// POST /reconciliation/statements/:gateway
pub async fn ingest_statement(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    ValidatedJson(StatementUpload(lines)): ValidatedJson<StatementUpload>,
) -> AppResult<Json<IngestReport>> {
    let gateway = Gateway::from_str(&gateway)?;
    Ok(Json(state.reconciler.ingest_statement(gateway, &lines).await?))
}
