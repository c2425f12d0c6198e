// Settlement aggregator - groups settleable transactions per merchant
//
// 1. Reject inverted periods and periods overlapping a live settlement
// 2. Collect unsettled SUCCESS collections for the period, plus refunds
//    inside the merchant's netting lookback
// 3. gross = collections - refunds, fees = platform + gateway fees
// 4. Persist PENDING and claim the transactions in one unit

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::notifier::{SettlementEvent, SettlementEventKind, SettlementNotifier};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Direction, NettingPolicy, Settlement, SettlementStatus, Transaction};
use crate::ledger::ReconStore;

pub const MAX_REFUND_LOOKBACK_DAYS: i32 = 366;

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementTotals {
    pub currency: String,
    pub gross_amount: Decimal,
    pub fees_total: Decimal,
    pub net_amount: Decimal,
    pub transaction_count: usize,
}

/// Pure aggregation over the eligible set. Payouts never contribute.
pub fn compute_totals(
    merchant_id: Uuid,
    transactions: &[Transaction],
    default_currency: &str,
) -> AppResult<SettlementTotals> {
    let currencies: BTreeSet<&str> = transactions.iter().map(|t| t.currency.as_str()).collect();
    if currencies.len() > 1 {
        return Err(
            SettlementError::MixedCurrency(currencies.into_iter().map(str::to_string).collect())
                .into(),
        );
    }
    let currency = currencies
        .into_iter()
        .next()
        .unwrap_or(default_currency)
        .to_string();

    let mut gross = Decimal::ZERO;
    let mut fees = Decimal::ZERO;
    let mut count = 0;
    for t in transactions {
        match t.direction {
            Direction::Collection => gross += t.amount,
            Direction::Refund => gross -= t.amount,
            Direction::Payout => continue,
        }
        fees += t.fee_total();
        count += 1;
    }

    let net = gross - fees;
    if net < Decimal::ZERO {
        return Err(SettlementError::NegativeNetAmount {
            merchant_id,
            gross,
            fees,
        }
        .into());
    }

    Ok(SettlementTotals {
        currency,
        gross_amount: gross,
        fees_total: fees,
        net_amount: net,
        transaction_count: count,
    })
}

pub struct SettlementAggregator {
    store: Arc<dyn ReconStore>,
    notifier: Arc<dyn SettlementNotifier>,
    default_currency: String,
    default_refund_lookback_days: i32,
}

impl SettlementAggregator {
    pub fn new(
        store: Arc<dyn ReconStore>,
        notifier: Arc<dyn SettlementNotifier>,
        default_currency: String,
        default_refund_lookback_days: i32,
    ) -> Self {
        Self {
            store,
            notifier,
            default_currency,
            default_refund_lookback_days,
        }
    }

    pub async fn generate(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Settlement> {
        if period_start >= period_end {
            return Err(SettlementError::InvalidPeriod.into());
        }

        if let Some(existing) = self
            .store
            .find_overlapping_settlement(merchant_id, period_start, period_end)
            .await?
        {
            warn!(
                "Settlement for merchant {} overlaps {} ({}..{})",
                merchant_id, existing.id, existing.period_start, existing.period_end
            );
            return Err(SettlementError::PeriodConflict {
                merchant_id,
                period_start,
                period_end,
            }
            .into());
        }

        let policy = self.netting_policy(merchant_id).await?;
        let refunds_from = period_start - Duration::days(policy.refund_lookback_days as i64);

        let eligible = self
            .store
            .eligible_transactions(merchant_id, period_start, period_end, refunds_from)
            .await?;

        let totals = compute_totals(merchant_id, &eligible, &self.default_currency).map_err(|e| {
            if let AppError::Settlement(SettlementError::NegativeNetAmount { .. }) = &e {
                error!("🚨 Integrity violation for merchant {}: {}", merchant_id, e);
            }
            e
        })?;

        let settlement = Settlement {
            id: Uuid::new_v4(),
            merchant_id,
            period_start,
            period_end,
            currency: totals.currency,
            gross_amount: totals.gross_amount,
            fees_total: totals.fees_total,
            net_amount: totals.net_amount,
            transaction_count: totals.transaction_count as i32,
            status: SettlementStatus::Pending,
            bank_transfer_reference: None,
            statement_url: None,
            failure_reason: None,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
        };

        let ids: Vec<Uuid> = eligible.iter().map(|t| t.id).collect();
        let created = self.store.create_settlement(&settlement, &ids).await?;

        info!(
            "📊 Settlement {} generated for merchant {}: gross {} fees {} net {} {} ({} txns)",
            created.id,
            merchant_id,
            created.gross_amount,
            created.fees_total,
            created.net_amount,
            created.currency,
            created.transaction_count
        );

        self.notifier
            .notify(SettlementEvent::new(SettlementEventKind::Generated, &created))
            .await;

        Ok(created)
    }

    /// Stored policy, or the configured default when none was set
    pub async fn netting_policy(&self, merchant_id: Uuid) -> AppResult<NettingPolicy> {
        Ok(self
            .store
            .get_netting_policy(merchant_id)
            .await?
            .unwrap_or_else(|| NettingPolicy {
                merchant_id,
                refund_lookback_days: self.default_refund_lookback_days,
                updated_at: Utc::now(),
            }))
    }

    pub async fn set_netting_policy(
        &self,
        merchant_id: Uuid,
        refund_lookback_days: i32,
    ) -> AppResult<NettingPolicy> {
        if !(0..=MAX_REFUND_LOOKBACK_DAYS).contains(&refund_lookback_days) {
            return Err(AppError::Validation(format!(
                "refundLookbackDays must be between 0 and {}",
                MAX_REFUND_LOOKBACK_DAYS
            )));
        }

        let policy = self
            .store
            .put_netting_policy(&NettingPolicy {
                merchant_id,
                refund_lookback_days,
                updated_at: Utc::now(),
            })
            .await?;

        info!(
            "Netting policy for merchant {} set to {} days",
            merchant_id, refund_lookback_days
        );
        Ok(policy)
    }
}
