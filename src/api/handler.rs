use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    config::AppConfig,
    error::{AppResult, LedgerError},
    ledger::{models::Transaction, ReconStore, TransactionCallback},
    middleware::ValidatedJson,
    reconciliation::{Reconciler, ResolutionDesk},
    settlement::{SettlementAggregator, SettlementLifecycle},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReconStore>,
    pub reconciler: Arc<Reconciler>,
    pub desk: Arc<ResolutionDesk>,
    pub aggregator: Arc<SettlementAggregator>,
    pub lifecycle: Arc<SettlementLifecycle>,
    pub config: Arc<AppConfig>,
}

/// GET /health - liveness plus a storage round-trip
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, storage) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable".to_string())
        }
    };

    let body = HealthResponse {
        status: if status == StatusCode::OK {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        storage,
        timestamp: Utc::now(),
    };

    (status, Json(body))
}

/// POST /transactions
pub async fn create_transaction(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateTransactionRequest>,
) -> AppResult<(StatusCode, Json<Transaction>)> {
    let transaction = request.into_new_transaction()?.into_transaction();
    let stored = state.store.insert_transaction(&transaction).await?;

    info!(
        "Transaction {} recorded: {} {} {} via {} ({})",
        stored.id,
        stored.direction.as_str(),
        stored.amount,
        stored.currency,
        stored.gateway,
        stored.status
    );

    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Transaction>> {
    let transaction = state
        .store
        .get_transaction(id)
        .await?
        .ok_or(LedgerError::TransactionNotFound(id))?;

    Ok(Json(transaction))
}

/// POST /transactions/:id/callback
///
/// Redelivery of the current status is accepted and changes nothing.
pub async fn transaction_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<TransactionCallbackRequest>,
) -> AppResult<Json<Transaction>> {
    let callback = TransactionCallback {
        status: request.status,
        gateway_reference: request.gateway_reference,
        at: Utc::now(),
    };

    let transaction = state.store.apply_callback(id, &callback).await.map_err(|e| {
        warn!("Callback for transaction {} rejected: {}", id, e);
        e
    })?;

    info!("Transaction {} is {}", id, transaction.status);
    Ok(Json(transaction))
}
