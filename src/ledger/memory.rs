use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult, LedgerError, ReconError, SettlementError};

#[derive(Default)]
struct MemoryState {
    transactions: HashMap<Uuid, Transaction>,
    records: HashMap<(Gateway, String), GatewayRecord>,
    runs: HashMap<Uuid, ReconciliationRun>,
    queue: HashMap<Uuid, ReconciliationQueueItem>,
    settlements: HashMap<Uuid, Settlement>,
    policies: HashMap<Uuid, NettingPolicy>,
}

/// In-process store. A single write lock makes every trait method atomic,
/// which gives the same guarantees the Postgres store gets from row locks
/// and unique indexes within one process.
pub struct MemoryLedger {
    state: tokio::sync::RwLock<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T>(rows: Vec<T>, page: PageRequest) -> Page<T> {
    let total = rows.len() as i64;
    let data = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    Page::new(data, page, total)
}

impl MemoryState {
    fn is_held(&self, transaction_id: Uuid) -> bool {
        self.queue.values().any(|item| item.holds(transaction_id))
    }

    /// True when a live settlement already covered `at` for the merchant
    fn period_settled(&self, merchant_id: Uuid, at: DateTime<Utc>) -> bool {
        self.settlements.values().any(|s| {
            s.merchant_id == merchant_id
                && s.occupies_period()
                && s.period_start <= at
                && at < s.period_end
        })
    }
}

#[async_trait]
impl ReconStore for MemoryLedger {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> AppResult<Transaction> {
        let mut state = self.state.write().await;

        if let Some(reference) = &transaction.gateway_reference {
            let taken = state.transactions.values().any(|t| {
                t.gateway == transaction.gateway && t.gateway_reference.as_ref() == Some(reference)
            });
            if taken {
                return Err(LedgerError::DuplicateReference {
                    gateway: transaction.gateway,
                    reference: reference.clone(),
                }
                .into());
            }
        }

        state
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(transaction.clone())
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn apply_callback(
        &self,
        id: Uuid,
        callback: &TransactionCallback,
    ) -> AppResult<Transaction> {
        let mut state = self.state.write().await;
        let current = state
            .transactions
            .get(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;

        let next = apply_callback_to(current, callback)?;

        if next.gateway_reference != current.gateway_reference {
            if let Some(reference) = &next.gateway_reference {
                let taken = state.transactions.values().any(|t| {
                    t.id != id
                        && t.gateway == next.gateway
                        && t.gateway_reference.as_ref() == Some(reference)
                });
                if taken {
                    return Err(LedgerError::DuplicateReference {
                        gateway: next.gateway,
                        reference: reference.clone(),
                    }
                    .into());
                }
            }
        }

        state.transactions.insert(id, next.clone());
        Ok(next)
    }

    async fn transactions_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                t.gateway == gateway
                    && t.created_at >= window_start
                    && t.created_at <= window_end
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.created_at, t.id));
        Ok(rows)
    }

    async fn insert_gateway_records(&self, records: &[GatewayRecord]) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for record in records {
            let key = (record.gateway, record.record_key.clone());
            if !state.records.contains_key(&key) {
                state.records.insert(key, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn gateway_records_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>> {
        let state = self.state.read().await;
        let mut rows: Vec<GatewayRecord> = state
            .records
            .values()
            .filter(|r| {
                r.gateway == gateway && r.occurred_at >= window_start && r.occurred_at <= window_end
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.record_key.cmp(&b.record_key))
        });
        Ok(rows)
    }

    async fn acquire_run_lease(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<ReconciliationRun> {
        let mut state = self.state.write().await;
        let runs: Vec<ReconciliationRun> = state
            .runs
            .values()
            .filter(|r| r.gateway == gateway)
            .cloned()
            .collect();

        check_lease(&runs, window_start, window_end, holder, now)?;

        let existing = runs
            .iter()
            .find(|r| r.same_window(window_start, window_end))
            .map(|r| r.id);

        let run = match existing.and_then(|id| state.runs.get_mut(&id)) {
            Some(run) => {
                run.holder = holder;
                run.lease_expires_at = Some(now + ttl);
                run.started_at = now;
                run.finished_at = None;
                run.clone()
            }
            None => {
                let run = ReconciliationRun {
                    id: Uuid::new_v4(),
                    gateway,
                    window_start,
                    window_end,
                    holder,
                    status: RunStatus::Running,
                    lease_expires_at: Some(now + ttl),
                    items_created: 0,
                    started_at: now,
                    finished_at: None,
                };
                state.runs.insert(run.id, run.clone());
                run
            }
        };

        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        holder: Uuid,
        items_created: i32,
        now: DateTime<Utc>,
    ) -> AppResult<ReconciliationRun> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .filter(|r| r.holder == holder)
            .ok_or_else(|| AppError::NotFound(format!("Run {} not held by {}", run_id, holder)))?;

        run.status = RunStatus::Completed;
        run.lease_expires_at = None;
        run.items_created += items_created;
        run.finished_at = Some(now);

        Ok(run.clone())
    }

    async fn release_run(&self, run_id: Uuid, holder: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(run) = state.runs.get_mut(&run_id) {
            if run.holder == holder {
                run.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn last_completed_window_end(&self, gateway: Gateway) -> AppResult<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.gateway == gateway && r.status == RunStatus::Completed)
            .map(|r| r.window_end)
            .max())
    }

    async fn insert_queue_items(
        &self,
        items: &[ReconciliationQueueItem],
    ) -> AppResult<Vec<ReconciliationQueueItem>> {
        let mut state = self.state.write().await;
        let mut inserted = Vec::new();
        for item in items {
            let exists = state
                .queue
                .values()
                .any(|q| q.gateway == item.gateway && q.source_key == item.source_key);
            if !exists {
                state.queue.insert(item.id, item.clone());
                inserted.push(item.clone());
            }
        }
        Ok(inserted)
    }

    async fn get_queue_item(&self, id: Uuid) -> AppResult<Option<ReconciliationQueueItem>> {
        let state = self.state.read().await;
        Ok(state.queue.get(&id).cloned())
    }

    async fn list_queue_items(
        &self,
        filter: &QueueFilter,
        page: PageRequest,
    ) -> AppResult<Page<ReconciliationQueueItem>> {
        let state = self.state.read().await;
        let mut rows: Vec<ReconciliationQueueItem> = state
            .queue
            .values()
            .filter(|q| filter.matches(q))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(rows, page))
    }

    async fn link_queue_item(
        &self,
        item_id: Uuid,
        transaction_id: Uuid,
        notes: Option<String>,
    ) -> AppResult<ReconciliationQueueItem> {
        let mut state = self.state.write().await;
        let transaction = state
            .transactions
            .get(&transaction_id)
            .cloned()
            .ok_or(ReconError::TransactionNotFound(transaction_id))?;
        let item = state
            .queue
            .get_mut(&item_id)
            .ok_or(ReconError::QueueItemNotFound(item_id))?;

        check_link(item, &transaction)?;

        item.linked_transaction_id = Some(transaction.id);
        if notes.is_some() {
            item.link_notes = notes;
        }

        Ok(item.clone())
    }

    async fn resolve_queue_item(
        &self,
        item_id: Uuid,
        notes: String,
        at: DateTime<Utc>,
    ) -> AppResult<ReconciliationQueueItem> {
        let mut state = self.state.write().await;
        let item = state
            .queue
            .get_mut(&item_id)
            .ok_or(ReconError::QueueItemNotFound(item_id))?;

        check_resolve(item)?;

        item.resolved = true;
        item.resolved_at = Some(at);
        item.resolution_notes = Some(notes);

        Ok(item.clone())
    }

    async fn eligible_transactions(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        refunds_from: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                if t.merchant_id != merchant_id
                    || t.status != TransactionStatus::Success
                    || t.is_settled()
                    || state.is_held(t.id)
                {
                    return false;
                }
                let at = t.completed_at.unwrap_or(t.created_at);
                let from = match t.direction {
                    Direction::Collection => period_start,
                    Direction::Refund => refunds_from,
                    Direction::Payout => return false,
                };
                // Rows held back from an earlier settlement carry forward
                (at >= from && at < period_end)
                    || (at < from && state.period_settled(merchant_id, at))
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.completed_at.unwrap_or(t.created_at), t.id));
        Ok(rows)
    }

    async fn find_overlapping_settlement(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<Settlement>> {
        let state = self.state.read().await;
        Ok(state
            .settlements
            .values()
            .find(|s| {
                s.merchant_id == merchant_id
                    && s.occupies_period()
                    && s.overlaps(period_start, period_end)
            })
            .cloned())
    }

    async fn create_settlement(
        &self,
        settlement: &Settlement,
        transaction_ids: &[Uuid],
    ) -> AppResult<Settlement> {
        let mut state = self.state.write().await;

        let conflict = state.settlements.values().any(|s| {
            s.merchant_id == settlement.merchant_id
                && s.occupies_period()
                && s.overlaps(settlement.period_start, settlement.period_end)
        });
        if conflict {
            return Err(SettlementError::PeriodConflict {
                merchant_id: settlement.merchant_id,
                period_start: settlement.period_start,
                period_end: settlement.period_end,
            }
            .into());
        }

        let all_free = transaction_ids.iter().all(|id| {
            state
                .transactions
                .get(id)
                .map(|t| !t.is_settled() && t.status == TransactionStatus::Success)
                .unwrap_or(false)
                && !state.is_held(*id)
        });
        if !all_free {
            return Err(SettlementError::ConcurrentSettlement(settlement.merchant_id).into());
        }

        for id in transaction_ids {
            if let Some(t) = state.transactions.get_mut(id) {
                t.settlement_id = Some(settlement.id);
            }
        }
        state.settlements.insert(settlement.id, settlement.clone());

        Ok(settlement.clone())
    }

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        let state = self.state.read().await;
        Ok(state.settlements.get(&id).cloned())
    }

    async fn list_settlements(
        &self,
        filter: &SettlementFilter,
        page: PageRequest,
    ) -> AppResult<Page<Settlement>> {
        let state = self.state.read().await;
        let mut rows: Vec<Settlement> = state
            .settlements
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.period_start
                .cmp(&a.period_start)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(paginate(rows, page))
    }

    async fn settlement_transactions(&self, settlement_id: Uuid) -> AppResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.settlement_id == Some(settlement_id))
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.completed_at.unwrap_or(t.created_at), t.id));
        Ok(rows)
    }

    async fn start_settlement_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement> {
        let mut state = self.state.write().await;
        let settlement = state
            .settlements
            .get_mut(&id)
            .ok_or(SettlementError::NotFound(id))?;

        check_transition(settlement, SettlementStatus::Processing)?;
        settlement.status = SettlementStatus::Processing;
        settlement.processing_started_at = Some(at);

        Ok(settlement.clone())
    }

    async fn complete_settlement(
        &self,
        id: Uuid,
        bank_transfer_reference: Option<String>,
        statement_url: String,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement> {
        let mut state = self.state.write().await;
        let settlement = state
            .settlements
            .get_mut(&id)
            .ok_or(SettlementError::NotFound(id))?;

        check_transition(settlement, SettlementStatus::Completed)?;
        settlement.status = SettlementStatus::Completed;
        settlement.bank_transfer_reference = bank_transfer_reference;
        settlement.statement_url = Some(statement_url);
        settlement.completed_at = Some(at);

        Ok(settlement.clone())
    }

    async fn fail_settlement(
        &self,
        id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    ) -> AppResult<(Settlement, u64)> {
        let mut state = self.state.write().await;
        let settlement = state
            .settlements
            .get_mut(&id)
            .ok_or(SettlementError::NotFound(id))?;

        check_transition(settlement, SettlementStatus::Failed)?;
        settlement.status = SettlementStatus::Failed;
        settlement.failure_reason = Some(reason);
        settlement.failed_at = Some(at);
        let failed = settlement.clone();

        let mut released = 0;
        for t in state.transactions.values_mut() {
            if t.settlement_id == Some(id) {
                t.settlement_id = None;
                released += 1;
            }
        }

        Ok((failed, released))
    }

    async fn get_netting_policy(&self, merchant_id: Uuid) -> AppResult<Option<NettingPolicy>> {
        let state = self.state.read().await;
        Ok(state.policies.get(&merchant_id).cloned())
    }

    async fn put_netting_policy(&self, policy: &NettingPolicy) -> AppResult<NettingPolicy> {
        let mut state = self.state.write().await;
        state.policies.insert(policy.merchant_id, policy.clone());
        Ok(policy.clone())
    }
}
