use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use crate::{
    api::{
        handler::{create_transaction, get_transaction, health_check, transaction_callback, AppState},
        reconciliation::{
            get_queue_item, ingest_statement, link_queue_item, list_queue, resolve_queue_item,
            run_reconciliation,
        },
        settlements::{
            complete_settlement, create_settlement, fail_settlement, get_netting_policy,
            get_settlement, get_settlement_statement, list_settlements, process_settlement,
            put_netting_policy,
        },
    },
    middleware::{create_cors_layer, rate_limit_middleware, RequestLimiter},
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let limiter = RequestLimiter::per_minute(state.config.rate_limit_per_minute);
    let cors = create_cors_layer(&state.config.cors_origin_list());
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Ledger
                .route("/transactions", post(create_transaction))
                .route("/transactions/:id", get(get_transaction))
                .route("/transactions/:id/callback", post(transaction_callback))

                // Reconciliation queue
                .route("/reconciliation/queue", get(list_queue))
                .route("/reconciliation/queue/:id", get(get_queue_item))
                .route("/reconciliation/queue/:id/link", post(link_queue_item))
                .route("/reconciliation/queue/:id/resolve", post(resolve_queue_item))
                .route("/reconciliation/runs", post(run_reconciliation))
                .route("/reconciliation/statements/:gateway", post(ingest_statement))

                // Settlements
                .route("/settlements", post(create_settlement).get(list_settlements))
                .route("/settlements/:id", get(get_settlement))
                .route("/settlements/:id/process", post(process_settlement))
                .route("/settlements/:id/complete", post(complete_settlement))
                .route("/settlements/:id/fail", post(fail_settlement))
                .route("/settlements/:id/statement", get(get_settlement_statement))
                .route(
                    "/merchants/:id/netting-policy",
                    get(get_netting_policy).put(put_netting_policy),
                )
                .layer(from_fn_with_state(limiter, rate_limit_middleware)),
        )
        .layer(TimeoutLayer::new(timeout))
        .layer(CompressionLayer::new())
        .layer(cors)
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
