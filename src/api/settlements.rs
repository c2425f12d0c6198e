use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::handler::AppState;
use super::models::*;
use crate::{
    error::AppResult,
    ledger::{models::{NettingPolicy, Settlement}, Page},
    middleware::ValidatedJson,
    settlement::SettlementStatement,
};

/// POST /settlements
pub async fn create_settlement(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateSettlementRequest>,
) -> AppResult<(StatusCode, Json<Settlement>)> {
    let settlement = state
        .aggregator
        .generate(request.merchant_id, request.period_start, request.period_end)
        .await?;
    Ok((StatusCode::CREATED, Json(settlement)))
}

/// GET /settlements
pub async fn list_settlements(
    State(state): State<AppState>,
    Query(query): Query<SettlementQuery>,
) -> AppResult<Json<Page<Settlement>>> {
    let (filter, page) = query.into_filter()?;
    Ok(Json(state.lifecycle.list(&filter, page).await?))
}

/// GET /settlements/:id
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Settlement>> {
    Ok(Json(state.lifecycle.get(id).await?))
}

/// POST /settlements/:id/process
pub async fn process_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Settlement>> {
    Ok(Json(state.lifecycle.start_processing(id).await?))
}

/// POST /settlements/:id/complete
pub async fn complete_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CompleteSettlementRequest>,
) -> AppResult<Json<Settlement>> {
    let settlement = state
        .lifecycle
        .complete(id, request.bank_transfer_reference)
        .await?;
    Ok(Json(settlement))
}

/// POST /settlements/:id/fail
pub async fn fail_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<FailSettlementRequest>,
) -> AppResult<Json<Settlement>> {
    Ok(Json(state.lifecycle.fail(id, &request.reason).await?))
}

/// GET /settlements/:id/statement
pub async fn get_settlement_statement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SettlementStatement>> {
    Ok(Json(state.lifecycle.statement(id).await?))
}

/// GET /merchants/:id/netting-policy
pub async fn get_netting_policy(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
) -> AppResult<Json<NettingPolicy>> {
    Ok(Json(state.aggregator.netting_policy(merchant_id).await?))
}

/// PUT /merchants/:id/netting-policy
pub async fn put_netting_policy(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<NettingPolicyRequest>,
) -> AppResult<Json<NettingPolicy>> {
    let policy = state
        .aggregator
        .set_netting_policy(merchant_id, request.refund_lookback_days)
        .await?;
    Ok(Json(policy))
}
