use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult, LedgerError, ReconError, SettlementError};

const TRANSACTION_COLUMNS: &str = "id, merchant_id, gateway, direction, amount, currency, msisdn, \
     gateway_reference, status, platform_fee, gateway_fee, settlement_id, created_at, completed_at";

/// Correlated on `t`: a live settlement whose period already covered the
/// transaction, which was held back from it
const SETTLED_PERIOD_FOR_TRANSACTION: &str = "SELECT 1 FROM settlements s \
     WHERE s.merchant_id = t.merchant_id \
       AND s.status <> 'FAILED' \
       AND s.period_start <= COALESCE(t.completed_at, t.created_at) \
       AND s.period_end > COALESCE(t.completed_at, t.created_at)";

/// Correlated on `t`: an unresolved queue item naming the transaction
const OPEN_ITEM_FOR_TRANSACTION: &str = "SELECT 1 FROM reconciliation_queue q \
     WHERE q.resolved = FALSE \
       AND (q.ledger_transaction_id = t.id OR q.linked_transaction_id = t.id)";

const QUEUE_COLUMNS: &str = "id, gateway, gateway_reference, source_key, amount, ledger_amount, \
     currency, msisdn, occurred_at, match_status, detail, ledger_transaction_id, \
     linked_transaction_id, link_notes, resolved, resolved_at, resolution_notes, created_at";

const SETTLEMENT_COLUMNS: &str = "id, merchant_id, period_start, period_end, currency, \
     gross_amount, fees_total, net_amount, transaction_count, status, bank_transfer_reference, \
     statement_url, failure_reason, created_at, processing_started_at, completed_at, failed_at";

const RUN_COLUMNS: &str = "id, gateway, window_start, window_end, holder, status, \
     lease_expires_at, items_created, started_at, finished_at";

/// Postgres-backed store - the source of truth across service instances
pub struct PgLedgerRepository {
    pub pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn push_queue_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &QueueFilter) {
    builder.push(" WHERE TRUE");
    if let Some(gateway) = filter.gateway {
        builder.push(" AND gateway = ").push_bind(gateway);
    }
    if let Some(status) = filter.match_status {
        builder.push(" AND match_status = ").push_bind(status);
    }
    if let Some(resolved) = filter.resolved {
        builder.push(" AND resolved = ").push_bind(resolved);
    }
}

fn push_settlement_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &SettlementFilter) {
    builder.push(" WHERE TRUE");
    if let Some(merchant_id) = filter.merchant_id {
        builder.push(" AND merchant_id = ").push_bind(merchant_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }
    if let Some(start) = filter.start_date {
        builder.push(" AND period_start >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND period_end <= ").push_bind(end);
    }
}

#[async_trait]
impl ReconStore for PgLedgerRepository {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ========== LEDGER ==========

    async fn insert_transaction(&self, transaction: &Transaction) -> AppResult<Transaction> {
        let result = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            INSERT INTO transactions ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {cols}
            "#,
            cols = TRANSACTION_COLUMNS
        ))
        .bind(transaction.id)
        .bind(transaction.merchant_id)
        .bind(transaction.gateway)
        .bind(transaction.direction)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.msisdn)
        .bind(&transaction.gateway_reference)
        .bind(transaction.status)
        .bind(transaction.platform_fee)
        .bind(transaction.gateway_fee)
        .bind(transaction.settlement_id)
        .bind(transaction.created_at)
        .bind(transaction.completed_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateReference {
                gateway: transaction.gateway,
                reference: transaction.gateway_reference.clone().unwrap_or_default(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn apply_callback(
        &self,
        id: Uuid,
        callback: &TransactionCallback,
    ) -> AppResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent callbacks for the same transaction
        let current = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::TransactionNotFound(id))?;

        let next = apply_callback_to(&current, callback)?;

        let result = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET status = $2, gateway_reference = $3, completed_at = $4
            WHERE id = $1
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(next.status)
        .bind(&next.gateway_reference)
        .bind(next.completed_at)
        .fetch_one(&mut *tx)
        .await;

        let updated = match result {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::DuplicateReference {
                    gateway: next.gateway,
                    reference: next.gateway_reference.unwrap_or_default(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;
        debug!("Transaction {} moved {} -> {}", id, current.status, updated.status);

        Ok(updated)
    }

    async fn transactions_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE gateway = $1
              AND created_at >= $2 AND created_at <= $3
            ORDER BY created_at, id
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(gateway)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========== GATEWAY STATEMENTS ==========

    async fn insert_gateway_records(&self, records: &[GatewayRecord]) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO gateway_records
                    (id, gateway, gateway_reference, record_key, amount, currency, msisdn, occurred_at, ingested_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (gateway, record_key) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(record.gateway)
            .bind(&record.gateway_reference)
            .bind(&record.record_key)
            .bind(record.amount)
            .bind(&record.currency)
            .bind(&record.msisdn)
            .bind(record.occurred_at)
            .bind(record.ingested_at)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn gateway_records_in_window(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>> {
        let rows = sqlx::query_as::<_, GatewayRecord>(
            r#"
            SELECT id, gateway, gateway_reference, record_key, amount, currency, msisdn, occurred_at, ingested_at
            FROM gateway_records
            WHERE gateway = $1 AND occurred_at >= $2 AND occurred_at <= $3
            ORDER BY occurred_at, record_key
            "#,
        )
        .bind(gateway)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========== RUN LEASES ==========

    async fn acquire_run_lease(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AppResult<ReconciliationRun> {
        let mut tx = self.pool.begin().await?;

        // One lease decision per gateway at a time, across instances
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('recon_run:' || $1::text))")
            .bind(gateway.as_str())
            .execute(&mut *tx)
            .await?;

        let runs = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            SELECT {}
            FROM reconciliation_runs
            WHERE gateway = $1 AND window_start <= $3 AND window_end >= $2
            "#,
            RUN_COLUMNS
        ))
        .bind(gateway)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&mut *tx)
        .await?;

        check_lease(&runs, window_start, window_end, holder, now)?;

        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            INSERT INTO reconciliation_runs
                (id, gateway, window_start, window_end, holder, status, lease_expires_at, items_created, started_at)
            VALUES ($1, $2, $3, $4, $5, 'RUNNING', $6, 0, $7)
            ON CONFLICT (gateway, window_start, window_end) DO UPDATE
            SET holder = EXCLUDED.holder,
                lease_expires_at = EXCLUDED.lease_expires_at,
                started_at = EXCLUDED.started_at,
                finished_at = NULL
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(gateway)
        .bind(window_start)
        .bind(window_end)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Run lease {} acquired by {} for {}", run.id, holder, gateway);

        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        holder: Uuid,
        items_created: i32,
        now: DateTime<Utc>,
    ) -> AppResult<ReconciliationRun> {
        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            UPDATE reconciliation_runs
            SET status = 'COMPLETED',
                lease_expires_at = NULL,
                items_created = items_created + $3,
                finished_at = $4
            WHERE id = $1 AND holder = $2
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(holder)
        .bind(items_created)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not held by {}", run_id, holder)))?;

        Ok(run)
    }

    async fn release_run(&self, run_id: Uuid, holder: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE reconciliation_runs SET lease_expires_at = NULL WHERE id = $1 AND holder = $2",
        )
        .bind(run_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_completed_window_end(&self, gateway: Gateway) -> AppResult<Option<DateTime<Utc>>> {
        let end = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(window_end) FROM reconciliation_runs WHERE gateway = $1 AND status = 'COMPLETED'",
        )
        .bind(gateway)
        .fetch_one(&self.pool)
        .await?;

        Ok(end)
    }

    // ========== RECONCILIATION QUEUE ==========

    async fn insert_queue_items(
        &self,
        items: &[ReconciliationQueueItem],
    ) -> AppResult<Vec<ReconciliationQueueItem>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(items.len());

        for item in items {
            let row = sqlx::query_as::<_, ReconciliationQueueItem>(&format!(
                r#"
                INSERT INTO reconciliation_queue ({cols})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (gateway, source_key) DO NOTHING
                RETURNING {cols}
                "#,
                cols = QUEUE_COLUMNS
            ))
            .bind(item.id)
            .bind(item.gateway)
            .bind(&item.gateway_reference)
            .bind(&item.source_key)
            .bind(item.amount)
            .bind(item.ledger_amount)
            .bind(&item.currency)
            .bind(&item.msisdn)
            .bind(item.occurred_at)
            .bind(item.match_status)
            .bind(&item.detail)
            .bind(item.ledger_transaction_id)
            .bind(item.linked_transaction_id)
            .bind(&item.link_notes)
            .bind(item.resolved)
            .bind(item.resolved_at)
            .bind(&item.resolution_notes)
            .bind(item.created_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = row {
                inserted.push(row);
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_queue_item(&self, id: Uuid) -> AppResult<Option<ReconciliationQueueItem>> {
        let row = sqlx::query_as::<_, ReconciliationQueueItem>(&format!(
            "SELECT {} FROM reconciliation_queue WHERE id = $1",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_queue_items(
        &self,
        filter: &QueueFilter,
        page: PageRequest,
    ) -> AppResult<Page<ReconciliationQueueItem>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM reconciliation_queue");
        push_queue_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM reconciliation_queue",
            QUEUE_COLUMNS
        ));
        push_queue_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = query
            .build_query_as::<ReconciliationQueueItem>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(rows, page, total))
    }

    async fn link_queue_item(
        &self,
        item_id: Uuid,
        transaction_id: Uuid,
        notes: Option<String>,
    ) -> AppResult<ReconciliationQueueItem> {
        let mut tx = self.pool.begin().await?;

        let item = sqlx::query_as::<_, ReconciliationQueueItem>(&format!(
            "SELECT {} FROM reconciliation_queue WHERE id = $1 FOR UPDATE",
            QUEUE_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ReconError::QueueItemNotFound(item_id))?;

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ReconError::TransactionNotFound(transaction_id))?;

        check_link(&item, &transaction)?;

        let linked = sqlx::query_as::<_, ReconciliationQueueItem>(&format!(
            r#"
            UPDATE reconciliation_queue
            SET linked_transaction_id = $2, link_notes = COALESCE($3, link_notes)
            WHERE id = $1
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(item_id)
        .bind(transaction_id)
        .bind(notes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(linked)
    }

    async fn resolve_queue_item(
        &self,
        item_id: Uuid,
        notes: String,
        at: DateTime<Utc>,
    ) -> AppResult<ReconciliationQueueItem> {
        // Conditional update: exactly one concurrent caller sees a row back
        let resolved = sqlx::query_as::<_, ReconciliationQueueItem>(&format!(
            r#"
            UPDATE reconciliation_queue
            SET resolved = TRUE, resolved_at = $3, resolution_notes = $2
            WHERE id = $1
              AND resolved = FALSE
              AND (match_status <> 'MISSING_IN_ZITOPAY' OR linked_transaction_id IS NOT NULL)
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(item_id)
        .bind(&notes)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(item) = resolved {
            return Ok(item);
        }

        // Nothing updated; report why
        let item = self
            .get_queue_item(item_id)
            .await?
            .ok_or(ReconError::QueueItemNotFound(item_id))?;
        check_resolve(&item)?;

        Err(AppError::Internal(format!(
            "Queue item {} could not be resolved",
            item_id
        )))
    }

    // ========== SETTLEMENTS ==========

    async fn eligible_transactions(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        refunds_from: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {}
            FROM transactions t
            WHERE merchant_id = $1
              AND status = 'SUCCESS'
              AND settlement_id IS NULL
              AND NOT EXISTS ({open_items})
              AND (
                (direction = 'COLLECTION'
                    AND COALESCE(completed_at, created_at) >= $2
                    AND COALESCE(completed_at, created_at) < $3)
                OR (direction = 'REFUND'
                    AND COALESCE(completed_at, created_at) >= $4
                    AND COALESCE(completed_at, created_at) < $3)
                OR (direction IN ('COLLECTION', 'REFUND')
                    AND COALESCE(completed_at, created_at) < $3
                    AND EXISTS ({settled_period}))
              )
            ORDER BY COALESCE(completed_at, created_at), id
            "#,
            TRANSACTION_COLUMNS,
            open_items = OPEN_ITEM_FOR_TRANSACTION,
            settled_period = SETTLED_PERIOD_FOR_TRANSACTION
        ))
        .bind(merchant_id)
        .bind(period_start)
        .bind(period_end)
        .bind(refunds_from)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_overlapping_settlement(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            SELECT {}
            FROM settlements
            WHERE merchant_id = $1
              AND status <> 'FAILED'
              AND period_start < $3 AND period_end > $2
            LIMIT 1
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(merchant_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_settlement(
        &self,
        settlement: &Settlement,
        transaction_ids: &[Uuid],
    ) -> AppResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        // Serialize generation per merchant so the overlap check cannot race
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('settlement:' || $1::text))")
            .bind(settlement.merchant_id.to_string())
            .execute(&mut *tx)
            .await?;

        let overlapping: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM settlements
            WHERE merchant_id = $1
              AND status <> 'FAILED'
              AND period_start < $3 AND period_end > $2
            LIMIT 1
            "#,
        )
        .bind(settlement.merchant_id)
        .bind(settlement.period_start)
        .bind(settlement.period_end)
        .fetch_optional(&mut *tx)
        .await?;

        let conflict = SettlementError::PeriodConflict {
            merchant_id: settlement.merchant_id,
            period_start: settlement.period_start,
            period_end: settlement.period_end,
        };
        if overlapping.is_some() {
            return Err(conflict.into());
        }

        let result = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            INSERT INTO settlements ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {cols}
            "#,
            cols = SETTLEMENT_COLUMNS
        ))
        .bind(settlement.id)
        .bind(settlement.merchant_id)
        .bind(settlement.period_start)
        .bind(settlement.period_end)
        .bind(&settlement.currency)
        .bind(settlement.gross_amount)
        .bind(settlement.fees_total)
        .bind(settlement.net_amount)
        .bind(settlement.transaction_count)
        .bind(settlement.status)
        .bind(&settlement.bank_transfer_reference)
        .bind(&settlement.statement_url)
        .bind(&settlement.failure_reason)
        .bind(settlement.created_at)
        .bind(settlement.processing_started_at)
        .bind(settlement.completed_at)
        .bind(settlement.failed_at)
        .fetch_one(&mut *tx)
        .await;

        let created = match result {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => return Err(conflict.into()),
            Err(e) => return Err(e.into()),
        };

        let claimed = sqlx::query(&format!(
            r#"
            UPDATE transactions t
            SET settlement_id = $1
            WHERE id = ANY($2) AND settlement_id IS NULL AND status = 'SUCCESS'
              AND NOT EXISTS ({})
            "#,
            OPEN_ITEM_FOR_TRANSACTION
        ))
        .bind(created.id)
        .bind(transaction_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed != transaction_ids.len() as u64 {
            warn!(
                "Settlement {} claimed {} of {} transactions; rolling back",
                created.id,
                claimed,
                transaction_ids.len()
            );
            tx.rollback().await?;
            return Err(SettlementError::ConcurrentSettlement(settlement.merchant_id).into());
        }

        tx.commit().await?;
        info!(
            "Settlement {} created for merchant {} with {} transactions",
            created.id, created.merchant_id, claimed
        );

        Ok(created)
    }

    async fn get_settlement(&self, id: Uuid) -> AppResult<Option<Settlement>> {
        let row = sqlx::query_as::<_, Settlement>(&format!(
            "SELECT {} FROM settlements WHERE id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_settlements(
        &self,
        filter: &SettlementFilter,
        page: PageRequest,
    ) -> AppResult<Page<Settlement>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM settlements");
        push_settlement_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM settlements", SETTLEMENT_COLUMNS));
        push_settlement_filter(&mut query, filter);
        query
            .push(" ORDER BY period_start DESC, created_at DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows = query
            .build_query_as::<Settlement>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(rows, page, total))
    }

    async fn settlement_transactions(&self, settlement_id: Uuid) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE settlement_id = $1
            ORDER BY COALESCE(completed_at, created_at), id
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(settlement_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn start_settlement_processing(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement> {
        let mut tx = self.pool.begin().await?;
        let current = lock_settlement(&mut tx, id).await?;
        check_transition(&current, SettlementStatus::Processing)?;

        let updated = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            UPDATE settlements
            SET status = 'PROCESSING', processing_started_at = $2
            WHERE id = $1
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn complete_settlement(
        &self,
        id: Uuid,
        bank_transfer_reference: Option<String>,
        statement_url: String,
        at: DateTime<Utc>,
    ) -> AppResult<Settlement> {
        let mut tx = self.pool.begin().await?;
        let current = lock_settlement(&mut tx, id).await?;
        check_transition(&current, SettlementStatus::Completed)?;

        let updated = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            UPDATE settlements
            SET status = 'COMPLETED', bank_transfer_reference = $2, statement_url = $3, completed_at = $4
            WHERE id = $1
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(id)
        .bind(bank_transfer_reference)
        .bind(statement_url)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn fail_settlement(
        &self,
        id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    ) -> AppResult<(Settlement, u64)> {
        let mut tx = self.pool.begin().await?;
        let current = lock_settlement(&mut tx, id).await?;
        check_transition(&current, SettlementStatus::Failed)?;

        let updated = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            UPDATE settlements
            SET status = 'FAILED', failure_reason = $2, failed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(id)
        .bind(reason)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        let released = sqlx::query("UPDATE transactions SET settlement_id = NULL WHERE settlement_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok((updated, released))
    }

    // ========== NETTING POLICY ==========

    async fn get_netting_policy(&self, merchant_id: Uuid) -> AppResult<Option<NettingPolicy>> {
        let row = sqlx::query_as::<_, NettingPolicy>(
            "SELECT merchant_id, refund_lookback_days, updated_at FROM netting_policies WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn put_netting_policy(&self, policy: &NettingPolicy) -> AppResult<NettingPolicy> {
        let row = sqlx::query_as::<_, NettingPolicy>(
            r#"
            INSERT INTO netting_policies (merchant_id, refund_lookback_days, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (merchant_id) DO UPDATE
            SET refund_lookback_days = EXCLUDED.refund_lookback_days,
                updated_at = EXCLUDED.updated_at
            RETURNING merchant_id, refund_lookback_days, updated_at
            "#,
        )
        .bind(policy.merchant_id)
        .bind(policy.refund_lookback_days)
        .bind(policy.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }
}

async fn lock_settlement(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: Uuid,
) -> AppResult<Settlement> {
    let row = sqlx::query_as::<_, Settlement>(&format!(
        "SELECT {} FROM settlements WHERE id = $1 FOR UPDATE",
        SETTLEMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(SettlementError::NotFound(id))?;

    Ok(row)
}
