use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::matcher::{classify, MatchWindow};
use crate::error::{AppError, AppResult, ReconError};
use crate::ingest::{normalize_statement, StatementSource};
use crate::ledger::models::{Gateway, ReconciliationQueueItem, ReconciliationRun};
use crate::ledger::ReconStore;

/// Tunables for matcher runs
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Max |Δt| for composite-key matches
    pub match_tolerance: Duration,
    pub lease_ttl: Duration,
    pub fetch_timeout: std::time::Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            match_tolerance: Duration::minutes(5),
            lease_ttl: Duration::minutes(5),
            fetch_timeout: std::time::Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run: ReconciliationRun,
    pub records_fetched: usize,
    pub items: Vec<ReconciliationQueueItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub gateway: Gateway,
    pub received: usize,
    pub normalized: usize,
    pub stored: u64,
}

/// Runs the matcher for a (gateway, window) under a database lease and
/// appends the discrepancies to the reconciliation queue
pub struct Reconciler {
    store: Arc<dyn ReconStore>,
    source: Arc<dyn StatementSource>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReconStore>,
        source: Arc<dyn StatementSource>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            source,
            settings,
        }
    }

    /// Reconcile one window. Returns only the items this run created; a
    /// re-run of an already processed window returns none.
    pub async fn reconcile(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<RunReport> {
        if window_end <= window_start {
            return Err(ReconError::InvalidWindow.into());
        }

        let holder = Uuid::new_v4();
        let run = self
            .store
            .acquire_run_lease(
                gateway,
                window_start,
                window_end,
                holder,
                Utc::now(),
                self.settings.lease_ttl,
            )
            .await
            .map_err(|e| {
                warn!("Run for {} {}..{} rejected: {}", gateway, window_start, window_end, e);
                e
            })?;

        info!(
            "🔄 Reconciling {} window {}..{} (run {})",
            gateway, window_start, window_end, run.id
        );

        match self.run_matcher(gateway, window_start, window_end).await {
            Ok((records_fetched, items)) => {
                let run = self
                    .store
                    .complete_run(run.id, holder, items.len() as i32, Utc::now())
                    .await?;

                info!(
                    "✓ {} window {}..{}: {} statement lines, {} new queue items",
                    gateway,
                    window_start,
                    window_end,
                    records_fetched,
                    items.len()
                );

                Ok(RunReport {
                    run,
                    records_fetched,
                    items,
                })
            }
            Err(e) => {
                error!("❌ Reconciliation of {} failed: {}", gateway, e);
                if let Err(release_err) = self.store.release_run(run.id, holder).await {
                    warn!("Could not release run lease {}: {}", run.id, release_err);
                }
                Err(e)
            }
        }
    }

    async fn run_matcher(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<(usize, Vec<ReconciliationQueueItem>)> {
        // Both sides load with a tolerance margin so pairs split by clock
        // skew across an edge still join; only in-window rows raise items
        let window = MatchWindow::new(window_start, window_end);
        let (load_start, load_end) = window.widened(self.settings.match_tolerance);

        let fetch = self.source.fetch(gateway, load_start, load_end);
        let records = match tokio::time::timeout(self.settings.fetch_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ReconError::StatementFetch {
                    gateway,
                    message: format!(
                        "timed out after {}s",
                        self.settings.fetch_timeout.as_secs()
                    ),
                }
                .into())
            }
        };

        self.store.insert_gateway_records(&records).await?;

        let ledger = self
            .store
            .transactions_in_window(gateway, load_start, load_end)
            .await?;

        let now = Utc::now();
        let candidates: Vec<ReconciliationQueueItem> =
            classify(&ledger, &records, window, self.settings.match_tolerance)
                .into_iter()
                .map(|d| d.into_queue_item(gateway, now))
                .collect();

        let created = self.store.insert_queue_items(&candidates).await?;
        Ok((records.len(), created))
    }

    /// End of the latest window this gateway has completed, if any
    pub async fn last_completed_window_end(&self, gateway: Gateway) -> AppResult<Option<DateTime<Utc>>> {
        self.store.last_completed_window_end(gateway).await
    }

    /// Normalize and store an uploaded statement
    pub async fn ingest_statement(
        &self,
        gateway: Gateway,
        lines: &[Value],
    ) -> AppResult<IngestReport> {
        if lines.is_empty() {
            return Err(AppError::Validation("statement has no lines".to_string()));
        }

        let records = normalize_statement(gateway, lines)?;
        let stored = self.store.insert_gateway_records(&records).await?;

        info!(
            "Ingested {} statement: {} lines, {} new records",
            gateway,
            lines.len(),
            stored
        );

        Ok(IngestReport {
            gateway,
            received: lines.len(),
            normalized: records.len(),
            stored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::StoredStatementSource;
    use crate::ledger::models::{
        Direction, GatewayRecord, MatchStatus, NewTransaction, TransactionStatus,
    };
    use crate::ledger::{MemoryLedger, PageRequest, QueueFilter};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct FailingSource;

    #[async_trait]
    impl StatementSource for FailingSource {
        async fn fetch(
            &self,
            gateway: Gateway,
            _window_start: DateTime<Utc>,
            _window_end: DateTime<Utc>,
        ) -> AppResult<Vec<GatewayRecord>> {
            Err(ReconError::StatementFetch {
                gateway,
                message: "connection refused".to_string(),
            }
            .into())
        }
    }

    struct SlowSource;

    #[async_trait]
    impl StatementSource for SlowSource {
        async fn fetch(
            &self,
            _gateway: Gateway,
            _window_start: DateTime<Utc>,
            _window_end: DateTime<Utc>,
        ) -> AppResult<Vec<GatewayRecord>> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();
        (start, start + Duration::hours(1))
    }

    fn stored_reconciler(store: Arc<MemoryLedger>) -> Reconciler {
        let source = Arc::new(StoredStatementSource::new(store.clone()));
        Reconciler::new(store, source, ReconcilerSettings::default())
    }

    async fn seed_txn(store: &MemoryLedger, reference: &str, amount: Decimal) {
        let (start, _) = window();
        let txn = NewTransaction {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount,
            currency: "XAF".to_string(),
            msisdn: "237670000001".to_string(),
            gateway_reference: Some(reference.to_string()),
            status: TransactionStatus::Success,
            platform_fee: dec!(0),
            gateway_fee: dec!(0),
            created_at: start + Duration::minutes(10),
        }
        .into_transaction();
        store.insert_transaction(&txn).await.unwrap();
    }

    async fn seed_record(store: &MemoryLedger, reference: &str, amount: Decimal) {
        let (start, _) = window();
        let record = GatewayRecord::new(
            Gateway::MtnMomo,
            Some(reference.to_string()),
            amount,
            "XAF".to_string(),
            "237670000001".to_string(),
            start + Duration::minutes(11),
        );
        store.insert_gateway_records(&[record]).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_classifies_and_is_idempotent() {
        let store = Arc::new(MemoryLedger::new());
        seed_txn(&store, "R1", dec!(10000)).await;
        seed_record(&store, "R2", dec!(5000)).await;
        seed_txn(&store, "R3", dec!(10000)).await;
        seed_record(&store, "R3", dec!(10050)).await;
        seed_txn(&store, "OK", dec!(300)).await;
        seed_record(&store, "OK", dec!(300)).await;

        let reconciler = stored_reconciler(store.clone());
        let (start, end) = window();

        let report = reconciler.reconcile(Gateway::MtnMomo, start, end).await.unwrap();
        assert_eq!(report.items.len(), 3);
        let status_of = |reference: &str| {
            report
                .items
                .iter()
                .find(|i| i.gateway_reference.as_deref() == Some(reference))
                .map(|i| i.match_status)
        };
        assert_eq!(status_of("R1"), Some(MatchStatus::MissingInGateway));
        assert_eq!(status_of("R2"), Some(MatchStatus::MissingInZitopay));
        assert_eq!(status_of("R3"), Some(MatchStatus::AmountMismatch));
        assert_eq!(status_of("OK"), None);
        assert!(report.items.iter().all(|i| !i.resolved));

        let rerun = reconciler.reconcile(Gateway::MtnMomo, start, end).await.unwrap();
        assert!(rerun.items.is_empty());

        let queue = store
            .list_queue_items(&QueueFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(queue.total, 3);
    }

    #[tokio::test]
    async fn test_clock_skew_across_window_edge_raises_no_items() {
        let store = Arc::new(MemoryLedger::new());
        let (start, edge) = window();

        let txn = NewTransaction {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount: dec!(7500),
            currency: "XAF".to_string(),
            msisdn: "237670000001".to_string(),
            gateway_reference: Some("RB".to_string()),
            status: TransactionStatus::Success,
            platform_fee: dec!(0),
            gateway_fee: dec!(0),
            created_at: edge - Duration::seconds(1),
        }
        .into_transaction();
        store.insert_transaction(&txn).await.unwrap();
        let line = GatewayRecord::new(
            Gateway::MtnMomo,
            Some("RB".to_string()),
            dec!(7500),
            "XAF".to_string(),
            "237670000001".to_string(),
            edge + Duration::seconds(1),
        );
        store.insert_gateway_records(&[line]).await.unwrap();

        let reconciler = stored_reconciler(store.clone());
        let first = reconciler.reconcile(Gateway::MtnMomo, start, edge).await.unwrap();
        assert!(first.items.is_empty());
        let second = reconciler
            .reconcile(Gateway::MtnMomo, edge, edge + Duration::hours(1))
            .await
            .unwrap();
        assert!(second.items.is_empty());

        let queue = store
            .list_queue_items(&QueueFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(queue.total, 0);
    }

    #[tokio::test]
    async fn test_overlapping_window_is_rejected() {
        let store = Arc::new(MemoryLedger::new());
        let reconciler = stored_reconciler(store);
        let (start, end) = window();

        reconciler.reconcile(Gateway::MtnMomo, start, end).await.unwrap();
        let err = reconciler
            .reconcile(
                Gateway::MtnMomo,
                start + Duration::minutes(30),
                end + Duration::minutes(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Recon(ReconError::WindowOverlap { .. })));

        // Other gateways are independent
        reconciler
            .reconcile(
                Gateway::OrangeMoney,
                start + Duration::minutes(30),
                end + Duration::minutes(30),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_window() {
        let reconciler = stored_reconciler(Arc::new(MemoryLedger::new()));
        let (start, _) = window();
        let err = reconciler
            .reconcile(Gateway::MtnMomo, start, start)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Recon(ReconError::InvalidWindow)));
    }

    #[tokio::test]
    async fn test_upstream_failure_commits_nothing_and_releases_lease() {
        let store = Arc::new(MemoryLedger::new());
        seed_txn(&store, "R1", dec!(10000)).await;
        let (start, end) = window();

        let failing = Reconciler::new(
            store.clone(),
            Arc::new(FailingSource),
            ReconcilerSettings::default(),
        );
        let err = failing.reconcile(Gateway::MtnMomo, start, end).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);

        let queue = store
            .list_queue_items(&QueueFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(queue.total, 0);

        // The released lease lets a retry through immediately
        let report = stored_reconciler(store)
            .reconcile(Gateway::MtnMomo, start, end)
            .await
            .unwrap();
        assert_eq!(report.items.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_is_time_boxed() {
        let store = Arc::new(MemoryLedger::new());
        let settings = ReconcilerSettings {
            fetch_timeout: std::time::Duration::from_millis(50),
            ..ReconcilerSettings::default()
        };
        let reconciler = Reconciler::new(store, Arc::new(SlowSource), settings);
        let (start, end) = window();

        let err = reconciler.reconcile(Gateway::MtnMomo, start, end).await.unwrap_err();
        assert!(matches!(err, AppError::Recon(ReconError::StatementFetch { .. })));
    }

    #[tokio::test]
    async fn test_live_lease_blocks_second_run() {
        let store = Arc::new(MemoryLedger::new());
        let (start, end) = window();
        store
            .acquire_run_lease(
                Gateway::MtnMomo,
                start,
                end,
                Uuid::new_v4(),
                Utc::now(),
                Duration::minutes(5),
            )
            .await
            .unwrap();

        let err = stored_reconciler(store)
            .reconcile(Gateway::MtnMomo, start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Recon(ReconError::RunInProgress { .. })));
    }

    #[tokio::test]
    async fn test_ingest_statement_is_idempotent() {
        let store = Arc::new(MemoryLedger::new());
        let reconciler = stored_reconciler(store);
        let lines = vec![serde_json::json!({
            "financialTransactionId": "MTN-1",
            "amount": "100",
            "currency": "XAF",
            "payer": { "partyId": "237670000001" },
            "createdAt": "2024-03-01T00:10:00Z"
        })];

        let first = reconciler.ingest_statement(Gateway::MtnMomo, &lines).await.unwrap();
        assert_eq!(first.stored, 1);
        let second = reconciler.ingest_statement(Gateway::MtnMomo, &lines).await.unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.normalized, 1);
    }
}
