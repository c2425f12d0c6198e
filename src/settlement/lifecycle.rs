use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::notifier::{SettlementEvent, SettlementEventKind, SettlementNotifier};
use super::statement::{build_statement, statement_url, SettlementStatement};
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::Settlement;
use crate::ledger::{Page, PageRequest, ReconStore, SettlementFilter};

/// Drives a settlement PENDING -> PROCESSING -> COMPLETED | FAILED.
///
/// Every step is a single guarded write; a step that does not apply to the
/// current status fails with `InvalidTransition` and changes nothing.
pub struct SettlementLifecycle {
    store: Arc<dyn ReconStore>,
    notifier: Arc<dyn SettlementNotifier>,
    statement_base_url: String,
}

impl SettlementLifecycle {
    pub fn new(
        store: Arc<dyn ReconStore>,
        notifier: Arc<dyn SettlementNotifier>,
        statement_base_url: String,
    ) -> Self {
        Self {
            store,
            notifier,
            statement_base_url,
        }
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Settlement> {
        self.store
            .get_settlement(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(id).into())
    }

    pub async fn list(
        &self,
        filter: &SettlementFilter,
        page: PageRequest,
    ) -> AppResult<Page<Settlement>> {
        self.store.list_settlements(filter, page).await
    }

    pub async fn start_processing(&self, id: Uuid) -> AppResult<Settlement> {
        let settlement = self
            .store
            .start_settlement_processing(id, Utc::now())
            .await
            .map_err(|e| {
                warn!("Start of settlement {} rejected: {}", id, e);
                e
            })?;

        info!("🔄 Settlement {} is PROCESSING", id);
        Ok(settlement)
    }

    pub async fn complete(
        &self,
        id: Uuid,
        bank_transfer_reference: Option<String>,
    ) -> AppResult<Settlement> {
        let reference = bank_transfer_reference
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let url = statement_url(&self.statement_base_url, id);

        let settlement = self
            .store
            .complete_settlement(id, reference, url, Utc::now())
            .await
            .map_err(|e| {
                warn!("Completion of settlement {} rejected: {}", id, e);
                e
            })?;

        info!(
            "✓ Settlement {} COMPLETED (net {} {})",
            id, settlement.net_amount, settlement.currency
        );
        self.notifier
            .notify(SettlementEvent::new(SettlementEventKind::Completed, &settlement))
            .await;

        Ok(settlement)
    }

    /// Fail a PROCESSING settlement and release its transactions
    pub async fn fail(&self, id: Uuid, reason: &str) -> AppResult<Settlement> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(SettlementError::MissingReason.into());
        }

        let (settlement, released) = self
            .store
            .fail_settlement(id, reason.to_string(), Utc::now())
            .await
            .map_err(|e| {
                warn!("Failure of settlement {} rejected: {}", id, e);
                e
            })?;

        warn!(
            "❌ Settlement {} FAILED: {} ({} transactions released)",
            id, reason, released
        );
        self.notifier
            .notify(SettlementEvent::new(SettlementEventKind::Failed, &settlement))
            .await;

        Ok(settlement)
    }

    pub async fn statement(&self, id: Uuid) -> AppResult<SettlementStatement> {
        let settlement = self.get(id).await?;
        let transactions = self.store.settlement_transactions(id).await?;
        Ok(build_statement(settlement, &transactions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::ledger::models::*;
    use crate::ledger::MemoryLedger;
    use crate::settlement::aggregator::SettlementAggregator;
    use crate::settlement::notifier::RecordingNotifier;
    use chrono::{DateTime, Duration};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryLedger>,
        aggregator: SettlementAggregator,
        lifecycle: SettlementLifecycle,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::default());
        Fixture {
            aggregator: SettlementAggregator::new(
                store.clone(),
                notifier.clone(),
                "XAF".to_string(),
                0,
            ),
            lifecycle: SettlementLifecycle::new(
                store.clone(),
                notifier.clone(),
                "https://pay.example.com".to_string(),
            ),
            store,
            notifier,
        }
    }

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        let start: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();
        (start, start + Duration::days(1))
    }

    async fn seed_collection(store: &MemoryLedger, merchant_id: Uuid) -> Transaction {
        let (start, _) = period();
        let txn = NewTransaction {
            merchant_id,
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount: dec!(10000),
            currency: "XAF".to_string(),
            msisdn: "237670000001".to_string(),
            gateway_reference: None,
            status: TransactionStatus::Success,
            platform_fee: dec!(200),
            gateway_fee: dec!(50),
            created_at: start + Duration::hours(3),
        }
        .into_transaction();
        store.insert_transaction(&txn).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_attaches_statement() {
        let f = fixture();
        let merchant = Uuid::new_v4();
        seed_collection(&f.store, merchant).await;
        let (start, end) = period();

        let settlement = f.aggregator.generate(merchant, start, end).await.unwrap();
        let processing = f.lifecycle.start_processing(settlement.id).await.unwrap();
        assert_eq!(processing.status, SettlementStatus::Processing);

        let completed = f
            .lifecycle
            .complete(settlement.id, Some("BT-7781".to_string()))
            .await
            .unwrap();
        assert_eq!(completed.status, SettlementStatus::Completed);
        assert_eq!(completed.bank_transfer_reference.as_deref(), Some("BT-7781"));
        assert_eq!(
            completed.statement_url,
            Some(format!(
                "https://pay.example.com/settlements/{}/statement",
                settlement.id
            ))
        );

        let statement = f.lifecycle.statement(settlement.id).await.unwrap();
        assert_eq!(statement.lines.len(), 1);
        assert_eq!(statement.settlement.net_amount, dec!(9750));

        let kinds: Vec<_> = f.notifier.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![SettlementEventKind::Generated, SettlementEventKind::Completed]
        );
    }

    #[tokio::test]
    async fn test_no_transition_skips_processing() {
        let f = fixture();
        let merchant = Uuid::new_v4();
        let (start, end) = period();
        let settlement = f.aggregator.generate(merchant, start, end).await.unwrap();

        let err = f.lifecycle.complete(settlement.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::InvalidTransition { .. })
        ));
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);

        f.lifecycle.start_processing(settlement.id).await.unwrap();
        f.lifecycle.complete(settlement.id, None).await.unwrap();

        // Terminal
        assert!(f.lifecycle.start_processing(settlement.id).await.is_err());
        assert!(f.lifecycle.complete(settlement.id, None).await.is_err());
        assert!(f.lifecycle.fail(settlement.id, "late").await.is_err());

        let err = f.lifecycle.start_processing(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fail_releases_for_resettlement() {
        let f = fixture();
        let merchant = Uuid::new_v4();
        let txn = seed_collection(&f.store, merchant).await;
        let (start, end) = period();

        let first = f.aggregator.generate(merchant, start, end).await.unwrap();
        f.lifecycle.start_processing(first.id).await.unwrap();

        let err = f.lifecycle.fail(first.id, "  ").await.unwrap_err();
        assert!(matches!(err, AppError::Settlement(SettlementError::MissingReason)));

        let failed = f.lifecycle.fail(first.id, "bank rejected IBAN").await.unwrap();
        assert_eq!(failed.status, SettlementStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("bank rejected IBAN"));
        assert!(failed.bank_transfer_reference.is_none());

        let released = f.store.get_transaction(txn.id).await.unwrap().unwrap();
        assert!(!released.is_settled());

        let second = f.aggregator.generate(merchant, start, end).await.unwrap();
        assert_eq!(second.net_amount, dec!(9750));
        assert_ne!(second.id, first.id);
    }
}
