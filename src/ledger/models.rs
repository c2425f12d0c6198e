use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Mobile-money gateways the platform collects and pays out through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "gateway_kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gateway {
    MtnMomo,
    OrangeMoney,
    AirtelMoney,
    MoovMoney,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::MtnMomo => "MTN_MOMO",
            Gateway::OrangeMoney => "ORANGE_MONEY",
            Gateway::AirtelMoney => "AIRTEL_MONEY",
            Gateway::MoovMoney => "MOOV_MONEY",
        }
    }

    pub fn all() -> Vec<Gateway> {
        vec![
            Gateway::MtnMomo,
            Gateway::OrangeMoney,
            Gateway::AirtelMoney,
            Gateway::MoovMoney,
        ]
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Gateway {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MTN_MOMO" => Ok(Gateway::MtnMomo),
            "ORANGE_MONEY" => Ok(Gateway::OrangeMoney),
            "AIRTEL_MONEY" => Ok(Gateway::AirtelMoney),
            "MOOV_MONEY" => Ok(Gateway::MoovMoney),
            other => Err(AppError::Validation(format!("Unknown gateway: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "transaction_direction", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Collection,
    Payout,
    Refund,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Collection => "COLLECTION",
            Direction::Payout => "PAYOUT",
            Direction::Refund => "REFUND",
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COLLECTION" => Ok(Direction::Collection),
            "PAYOUT" => Ok(Direction::Payout),
            "REFUND" => Ok(Direction::Refund),
            other => Err(AppError::Validation(format!("Unknown direction: {}", other))),
        }
    }
}

/// Ledger transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Verifying,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Verifying => "VERIFYING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    /// Final statuses never change again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    /// Gateway callbacks may only move a transaction forward
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        match (self, next) {
            (TransactionStatus::Pending, TransactionStatus::Pending) => false,
            (TransactionStatus::Pending, _) => true,
            (TransactionStatus::Verifying, next) => next.is_final(),
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "VERIFYING" => Ok(TransactionStatus::Verifying),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(AppError::Validation(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Internal ledger transaction (collection, payout or refund)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub gateway: Gateway,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub msisdn: String,
    pub gateway_reference: Option<String>,
    pub status: TransactionStatus,
    pub platform_fee: Decimal,
    pub gateway_fee: Decimal,
    /// Set once the transaction is included in a settlement
    pub settlement_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn fee_total(&self) -> Decimal {
        self.platform_fee + self.gateway_fee
    }

    pub fn is_settled(&self) -> bool {
        self.settlement_id.is_some()
    }

    /// Eligible for matching: no longer waiting on the gateway
    pub fn is_matchable(&self) -> bool {
        self.status.is_final()
    }
}

/// Input for recording a new ledger transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub merchant_id: Uuid,
    pub gateway: Gateway,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub msisdn: String,
    pub gateway_reference: Option<String>,
    pub status: TransactionStatus,
    pub platform_fee: Decimal,
    pub gateway_fee: Decimal,
    pub created_at: DateTime<Utc>,
}

impl NewTransaction {
    pub fn into_transaction(self) -> Transaction {
        let completed_at = if self.status.is_final() {
            Some(self.created_at)
        } else {
            None
        };

        Transaction {
            id: Uuid::new_v4(),
            merchant_id: self.merchant_id,
            gateway: self.gateway,
            direction: self.direction,
            amount: self.amount,
            currency: self.currency,
            msisdn: self.msisdn,
            gateway_reference: self.gateway_reference,
            status: self.status,
            platform_fee: self.platform_fee,
            gateway_fee: self.gateway_fee,
            settlement_id: None,
            created_at: self.created_at,
            completed_at,
        }
    }
}

/// Normalized line from a gateway statement. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub id: Uuid,
    pub gateway: Gateway,
    pub gateway_reference: Option<String>,
    /// Reference when present, otherwise `msisdn|amount|timestamp`
    pub record_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub msisdn: String,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl GatewayRecord {
    pub fn new(
        gateway: Gateway,
        gateway_reference: Option<String>,
        amount: Decimal,
        currency: String,
        msisdn: String,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let gateway_reference = gateway_reference
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let record_key = match &gateway_reference {
            Some(reference) => reference.clone(),
            None => composite_key(&msisdn, amount, occurred_at),
        };

        Self {
            id: Uuid::new_v4(),
            gateway,
            gateway_reference,
            record_key,
            amount,
            currency,
            msisdn,
            occurred_at,
            ingested_at: Utc::now(),
        }
    }
}

/// Key used for lines that carry no gateway reference
pub fn composite_key(msisdn: &str, amount: Decimal, at: DateTime<Utc>) -> String {
    format!("{}|{}|{}", msisdn, amount.normalize(), at.timestamp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "match_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// Gateway moved money the ledger does not account for
    MissingInZitopay,
    /// Ledger success the gateway never reported
    MissingInGateway,
    AmountMismatch,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::MissingInZitopay => "MISSING_IN_ZITOPAY",
            MatchStatus::MissingInGateway => "MISSING_IN_GATEWAY",
            MatchStatus::AmountMismatch => "AMOUNT_MISMATCH",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MISSING_IN_ZITOPAY" => Ok(MatchStatus::MissingInZitopay),
            "MISSING_IN_GATEWAY" => Ok(MatchStatus::MissingInGateway),
            "AMOUNT_MISMATCH" => Ok(MatchStatus::AmountMismatch),
            other => Err(AppError::Validation(format!("Unknown match status: {}", other))),
        }
    }
}

/// One unmatched or mismatched unit of work awaiting an operator.
///
/// Append-only: items are flagged resolved, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationQueueItem {
    pub id: Uuid,
    pub gateway: Gateway,
    pub gateway_reference: Option<String>,
    /// Uniqueness key within a gateway, see `Discrepancy::source_key`
    pub source_key: String,
    pub amount: Decimal,
    /// Ledger side of an amount mismatch
    pub ledger_amount: Option<Decimal>,
    pub currency: String,
    pub msisdn: String,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    pub match_status: MatchStatus,
    pub detail: Option<String>,
    /// Ledger candidate the matcher paired with this item, if any
    pub ledger_transaction_id: Option<Uuid>,
    pub linked_transaction_id: Option<Uuid>,
    pub link_notes: Option<String>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationQueueItem {
    /// `resolved` implies notes, and a resolved MISSING_IN_ZITOPAY implies a link
    pub fn satisfies_invariants(&self) -> bool {
        if !self.resolved {
            return true;
        }

        let has_notes = self
            .resolution_notes
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false);
        let link_ok = self.match_status != MatchStatus::MissingInZitopay
            || self.linked_transaction_id.is_some();

        has_notes && link_ok && self.resolved_at.is_some()
    }

    pub fn requires_link(&self) -> bool {
        self.match_status == MatchStatus::MissingInZitopay && self.linked_transaction_id.is_none()
    }

    /// An open item keeps the transaction it names out of settlement
    pub fn holds(&self, transaction_id: Uuid) -> bool {
        !self.resolved
            && (self.ledger_transaction_id == Some(transaction_id)
                || self.linked_transaction_id == Some(transaction_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "settlement_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Processing => "PROCESSING",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }

    /// PENDING -> PROCESSING -> {COMPLETED, FAILED}; nothing skips PROCESSING
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        matches!(
            (self, next),
            (SettlementStatus::Pending, SettlementStatus::Processing)
                | (SettlementStatus::Processing, SettlementStatus::Completed)
                | (SettlementStatus::Processing, SettlementStatus::Failed)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SettlementStatus::Pending),
            "PROCESSING" => Ok(SettlementStatus::Processing),
            "COMPLETED" => Ok(SettlementStatus::Completed),
            "FAILED" => Ok(SettlementStatus::Failed),
            other => Err(AppError::Validation(format!(
                "Unknown settlement status: {}",
                other
            ))),
        }
    }
}

/// Periodic aggregation of a merchant's net settleable funds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub gross_amount: Decimal,
    pub fees_total: Decimal,
    pub net_amount: Decimal,
    pub transaction_count: i32,
    pub status: SettlementStatus,
    pub bank_transfer_reference: Option<String>,
    pub statement_url: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Settlement {
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.period_start < end && self.period_end > start
    }

    /// Failed settlements release their period and transactions
    pub fn occupies_period(&self) -> bool {
        self.status != SettlementStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "run_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
}

/// Lease row guarding one (gateway, window) matcher run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub gateway: Gateway,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub holder: Uuid,
    pub status: RunStatus,
    /// `None` once released or completed
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub items_created: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconciliationRun {
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map(|at| at > now).unwrap_or(false)
    }

    pub fn same_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.window_start == start && self.window_end == end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.window_start < end && self.window_end > start
    }
}

/// How far back unsettled refunds are netted into a merchant's settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct NettingPolicy {
    pub merchant_id: Uuid,
    pub refund_lookback_days: i32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_enum_parsing_rejects_unknown_values() {
        assert_eq!("mtn_momo".parse::<Gateway>().unwrap(), Gateway::MtnMomo);
        assert!("MPESA".parse::<Gateway>().is_err());
        assert!("MATCHED".parse::<MatchStatus>().is_err());
        assert!("SETTLED".parse::<SettlementStatus>().is_err());
    }

    #[test]
    fn test_enum_serde_uses_screaming_case() {
        let json = serde_json::to_string(&MatchStatus::MissingInZitopay).unwrap();
        assert_eq!(json, "\"MISSING_IN_ZITOPAY\"");
        let gw: Gateway = serde_json::from_str("\"ORANGE_MONEY\"").unwrap();
        assert_eq!(gw, Gateway::OrangeMoney);
    }

    #[test]
    fn test_settlement_transitions() {
        use SettlementStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        for next in [Pending, Processing, Completed, Failed] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_transaction_status_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Verifying));
        assert!(Pending.can_transition_to(Success));
        assert!(Verifying.can_transition_to(Failed));
        assert!(!Verifying.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Success));
    }

    #[test]
    fn test_record_key_falls_back_to_composite() {
        let at = Utc::now();
        let with_ref = GatewayRecord::new(
            Gateway::MtnMomo,
            Some(" R1 ".to_string()),
            dec!(100),
            "XAF".to_string(),
            "237670000000".to_string(),
            at,
        );
        assert_eq!(with_ref.record_key, "R1");

        let blank_ref = GatewayRecord::new(
            Gateway::MtnMomo,
            Some("  ".to_string()),
            dec!(100.00),
            "XAF".to_string(),
            "237670000000".to_string(),
            at,
        );
        assert!(blank_ref.gateway_reference.is_none());
        assert_eq!(
            blank_ref.record_key,
            format!("237670000000|100|{}", at.timestamp())
        );
    }
}
