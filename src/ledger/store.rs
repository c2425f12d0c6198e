use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult, LedgerError, ReconError, SettlementError};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> AppResult<Self> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);

        if page == 0 {
            return Err(AppError::Validation("page must be at least 1".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        Ok(Self { page, limit })
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, request: PageRequest, total: i64) -> Self {
        Self {
            data,
            page: request.page,
            limit: request.limit,
            total,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub gateway: Option<Gateway>,
    pub match_status: Option<MatchStatus>,
    pub resolved: Option<bool>,
}

impl QueueFilter {
    pub fn matches(&self, item: &ReconciliationQueueItem) -> bool {
        self.gateway.map_or(true, |g| item.gateway == g)
            && self.match_status.map_or(true, |s| item.match_status == s)
            && self.resolved.map_or(true, |r| item.resolved == r)
    }
}

/// Settlement listing filter; dates bound the settlement period
#[derive(Debug, Clone, Default)]
pub struct SettlementFilter {
    pub merchant_id: Option<Uuid>,
    pub status: Option<SettlementStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl SettlementFilter {
    pub fn matches(&self, settlement: &Settlement) -> bool {
        self.merchant_id.map_or(true, |m| settlement.merchant_id == m)
            && self.status.map_or(true, |s| settlement.status == s)
            && self.start_date.map_or(true, |d| settlement.period_start >= d)
            && self.end_date.map_or(true, |d| settlement.period_end <= d)
    }
}

/// Callback from a gateway updating a ledger transaction
#[derive(Debug, Clone)]
pub struct TransactionCallback {
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub at: DateTime<Utc>,
}

/// Storage abstraction for the reconciliation and settlement engine.
///
/// Every method is a single atomic unit. Guards that must hold under
/// concurrency (at-most-once resolution, non-overlapping settlements, run
/// leases) live here, expressed as conditional updates and unique keys, so
/// that they hold across service instances.
#[async_trait]
pub trait ReconStore: Send + Sync {
    async fn ping(&self) -> AppResult<()>;

    // ========== LEDGER ==========

    async fn insert_transaction(&self, transaction: &Transaction) -> AppResult<Transaction>;

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>>;

    /// Apply a gateway callback; rejects regressions and reference rewrites
    async fn apply_callback(
        &self,
        id: Uuid,
        callback: &TransactionCallback,
    ) -> AppResult<Transaction>;

    /// Transactions of every status created inside the closed window
    async fn transactions_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>>;

    // ========== GATEWAY STATEMENTS ==========

    /// Idempotent on (gateway, record_key); returns how many were new
    async fn insert_gateway_records(&self, records: &[GatewayRecord]) -> AppResult<u64>;

    async fn gateway_records_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>>;

    // ========== RUN LEASES ==========

    /// Take the (gateway, window) lease. Fails with `RunInProgress` while
    /// another holder's lease is live and `WindowOverlap` when a different
    /// completed window intersects this one.
    async fn acquire_run_lease(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<ReconciliationRun>;

    async fn complete_run(
        &self,
        run_id: Uuid,
        holder: Uuid,
        items_created: i32,
        now: DateTime<Utc>,
    ) -> AppResult<ReconciliationRun>;

    async fn release_run(&self, run_id: Uuid, holder: Uuid) -> AppResult<()>;

    /// Latest `window_end` among the gateway's completed runs
    async fn last_completed_window_end(&self, gateway: Gateway) -> AppResult<Option<DateTime<Utc>>>;

    // ========== RECONCILIATION QUEUE ==========

    /// Inserts items not already present for (gateway, source_key); returns
    /// only the newly inserted ones
    async fn insert_queue_items(
        &self,
        items: &[ReconciliationQueueItem],
    ) -> AppResult<Vec<ReconciliationQueueItem>>;

    async fn get_queue_item(&self, id: Uuid) -> AppResult<Option<ReconciliationQueueItem>>;

    async fn list_queue_items(
        &self,
        filter: &QueueFilter,
        page: PageRequest,
    ) -> AppResult<Page<ReconciliationQueueItem>>;

    async fn link_queue_item(
        &self,
        item_id: Uuid,
        transaction_id: Uuid,
        notes: Option<String>,
    ) -> AppResult<ReconciliationQueueItem>;

    /// Conditional on the item still being unresolved
    async fn resolve_queue_item(
        &self,
        item_id: Uuid,
        notes: String,
        at: DateTime<Utc>,
    ) -> AppResult<ReconciliationQueueItem>;

    // ========== SETTLEMENTS ==========

    /// Unsettled SUCCESS collections completed in [period_start, period_end)
    /// and refunds completed in [refunds_from, period_end). Transactions held
    /// by an unresolved queue item are left out; once released, earlier ones
    /// whose period already settled carry into the next settlement.
    async fn eligible_transactions(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        refunds_from: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>>;

    async fn find_overlapping_settlement(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<Settlement>>;

    /// Insert the settlement and mark `transaction_ids` settled as one unit
    async fn create_settlement(
        &self,
        settlement: &Settlement,
        transaction_ids: &[Uuid],
    ) -> AppResult<Settlement>;

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>>;

    async fn list_settlements(
        &self,
        filter: &SettlementFilter,
        page: PageRequest,
    ) -> AppResult<Page<Settlement>>;

    async fn settlement_transactions(&self, settlement_id: Uuid) -> AppResult<Vec<Transaction>>;

    async fn start_settlement_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement>;

    async fn complete_settlement(
        &self,
        id: Uuid,
        bank_transfer_reference: Option<String>,
        statement_url: String,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement>;

    /// Mark FAILED and release the included transactions as one unit;
    /// returns the settlement and the number of released transactions
    async fn fail_settlement(
        &self,
        id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    ) -> AppResult<(Settlement, u64)>;

    // ========== NETTING POLICY ==========

    async fn get_netting_policy(&self, merchant_id: Uuid) -> AppResult<Option<NettingPolicy>>;

    async fn put_netting_policy(&self, policy: &NettingPolicy) -> AppResult<NettingPolicy>;
}

// ========== GUARDS SHARED BY STORE IMPLEMENTATIONS ==========
//
// Each store loads the current row under its own lock (a `FOR UPDATE` row
// lock in Postgres, the state write-lock in memory) and runs these checks
// before writing.

/// Next state of a transaction after a gateway callback
pub fn apply_callback_to(
    current: &Transaction,
    callback: &TransactionCallback,
) -> AppResult<Transaction> {
    let reference = callback
        .gateway_reference
        .as_ref()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    if let (Some(existing), Some(incoming)) = (&current.gateway_reference, &reference) {
        if existing != incoming {
            return Err(LedgerError::ReferenceConflict {
                id: current.id,
                existing: existing.clone(),
            }
            .into());
        }
    }

    // Gateways redeliver callbacks; a repeat of the current status is a no-op
    let same_status = current.status == callback.status;
    if !same_status && !current.status.can_transition_to(callback.status) {
        return Err(LedgerError::InvalidStatusTransition {
            id: current.id,
            from: current.status,
            to: callback.status,
        }
        .into());
    }

    let mut next = current.clone();
    next.status = callback.status;
    if next.gateway_reference.is_none() {
        next.gateway_reference = reference;
    }
    if next.status.is_final() && next.completed_at.is_none() {
        next.completed_at = Some(callback.at);
    }

    Ok(next)
}

pub fn check_link(
    item: &ReconciliationQueueItem,
    transaction: &Transaction,
) -> AppResult<()> {
    if item.resolved {
        return Err(ReconError::AlreadyResolved(item.id).into());
    }
    if item.gateway != transaction.gateway {
        return Err(ReconError::GatewayMismatch {
            item_gateway: item.gateway,
            transaction_gateway: transaction.gateway,
        }
        .into());
    }
    if let Some(linked) = item.linked_transaction_id {
        if linked != transaction.id {
            return Err(ReconError::DuplicateLink {
                item_id: item.id,
                linked,
                requested: transaction.id,
            }
            .into());
        }
    }
    Ok(())
}

pub fn check_resolve(item: &ReconciliationQueueItem) -> AppResult<()> {
    if item.resolved {
        return Err(ReconError::AlreadyResolved(item.id).into());
    }
    if item.requires_link() {
        return Err(ReconError::LinkRequired(item.id).into());
    }
    Ok(())
}

pub fn check_transition(settlement: &Settlement, to: SettlementStatus) -> AppResult<()> {
    if !settlement.status.can_transition_to(to) {
        return Err(SettlementError::InvalidTransition {
            id: settlement.id,
            from: settlement.status,
            to,
        }
        .into());
    }
    Ok(())
}

/// Decide whether `holder` may take the lease for (gateway, window)
pub fn check_lease(
    runs: &[ReconciliationRun],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    holder: Uuid,
    now: DateTime<Utc>,
) -> AppResult<()> {
    for run in runs {
        if run.same_window(window_start, window_end) {
            if run.lease_is_live(now) && run.holder != holder {
                return Err(ReconError::RunInProgress {
                    gateway: run.gateway,
                    window_start,
                    window_end,
                }
                .into());
            }
        } else if run.status == RunStatus::Completed && run.overlaps(window_start, window_end) {
            return Err(ReconError::WindowOverlap {
                gateway: run.gateway,
                existing_start: run.window_start,
                existing_end: run.window_end,
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn txn(status: TransactionStatus, reference: Option<&str>) -> Transaction {
        NewTransaction {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount: dec!(1000),
            currency: "XAF".to_string(),
            msisdn: "237670000001".to_string(),
            gateway_reference: reference.map(str::to_string),
            status,
            platform_fee: dec!(0),
            gateway_fee: dec!(0),
            created_at: Utc::now(),
        }
        .into_transaction()
    }

    fn run(start: DateTime<Utc>, end: DateTime<Utc>, status: RunStatus, lease: Option<DateTime<Utc>>) -> ReconciliationRun {
        ReconciliationRun {
            id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            window_start: start,
            window_end: end,
            holder: Uuid::new_v4(),
            status,
            lease_expires_at: lease,
            items_created: 0,
            started_at: start,
            finished_at: None,
        }
    }

    #[test]
    fn test_callback_attaches_reference_and_completes() {
        let current = txn(TransactionStatus::Pending, None);
        let at = Utc::now();
        let next = apply_callback_to(
            &current,
            &TransactionCallback {
                status: TransactionStatus::Success,
                gateway_reference: Some("R1".to_string()),
                at,
            },
        )
        .unwrap();
        assert_eq!(next.gateway_reference.as_deref(), Some("R1"));
        assert_eq!(next.completed_at, Some(at));
    }

    #[test]
    fn test_callback_rejects_regression_and_reference_rewrite() {
        let current = txn(TransactionStatus::Success, Some("R1"));
        let regress = apply_callback_to(
            &current,
            &TransactionCallback {
                status: TransactionStatus::Failed,
                gateway_reference: None,
                at: Utc::now(),
            },
        );
        assert!(matches!(
            regress,
            Err(AppError::Ledger(LedgerError::InvalidStatusTransition { .. }))
        ));

        let rewrite = apply_callback_to(
            &current,
            &TransactionCallback {
                status: TransactionStatus::Success,
                gateway_reference: Some("R2".to_string()),
                at: Utc::now(),
            },
        );
        assert!(matches!(
            rewrite,
            Err(AppError::Ledger(LedgerError::ReferenceConflict { .. }))
        ));

        // Redelivery of the same callback is accepted
        let again = apply_callback_to(
            &current,
            &TransactionCallback {
                status: TransactionStatus::Success,
                gateway_reference: Some("R1".to_string()),
                at: Utc::now(),
            },
        )
        .unwrap();
        assert_eq!(again, current);
    }

    #[test]
    fn test_lease_rules() {
        let now = Utc::now();
        let start = now - Duration::hours(2);
        let end = now - Duration::hours(1);
        let me = Uuid::new_v4();

        let live = run(start, end, RunStatus::Running, Some(now + Duration::minutes(1)));
        assert!(matches!(
            check_lease(&[live], start, end, me, now),
            Err(AppError::Recon(ReconError::RunInProgress { .. }))
        ));

        let expired = run(start, end, RunStatus::Running, Some(now - Duration::minutes(1)));
        assert!(check_lease(&[expired], start, end, me, now).is_ok());

        let done = run(start, end, RunStatus::Completed, None);
        assert!(check_lease(&[done.clone()], start, end, me, now).is_ok());
        assert!(matches!(
            check_lease(&[done.clone()], start + Duration::minutes(30), end + Duration::minutes(30), me, now),
            Err(AppError::Recon(ReconError::WindowOverlap { .. }))
        ));

        // Touching windows do not overlap
        assert!(check_lease(&[done], end, end + Duration::hours(1), me, now).is_ok());
    }

    #[test]
    fn test_page_request_bounds() {
        let page = PageRequest::new(None, None).unwrap();
        assert_eq!(page, PageRequest::default());
        assert_eq!(page.offset(), 0);

        let page = PageRequest::new(Some(3), Some(50)).unwrap();
        assert_eq!(page.offset(), 100);

        assert!(PageRequest::new(Some(0), None).is_err());
        assert!(PageRequest::new(None, Some(0)).is_err());
        assert!(PageRequest::new(None, Some(MAX_PAGE_LIMIT + 1)).is_err());
    }
}
