use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ledger::models::{Direction, Gateway, Settlement, Transaction};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementLine {
    pub transaction_id: Uuid,
    pub gateway: Gateway,
    pub direction: Direction,
    pub gateway_reference: Option<String>,
    pub amount: Decimal,
    pub fees: Decimal,
    pub completed_at: DateTime<Utc>,
}

impl StatementLine {
    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.transaction_id,
            self.gateway,
            self.direction.as_str(),
            self.gateway_reference.as_deref().unwrap_or("-"),
            self.amount.normalize(),
            self.fees.normalize(),
            self.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Payout statement for one settlement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStatement {
    pub settlement: Settlement,
    pub lines: Vec<StatementLine>,
    /// Hex SHA-256 over the header and canonical lines
    pub digest: String,
}

fn canonical_header(settlement: &Settlement) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        settlement.id,
        settlement.merchant_id,
        settlement.period_start.to_rfc3339_opts(SecondsFormat::Secs, true),
        settlement.period_end.to_rfc3339_opts(SecondsFormat::Secs, true),
        settlement.currency,
        settlement.gross_amount.normalize(),
        settlement.fees_total.normalize(),
        settlement.net_amount.normalize()
    )
}

pub fn build_statement(settlement: Settlement, transactions: &[Transaction]) -> SettlementStatement {
    let mut lines: Vec<StatementLine> = transactions
        .iter()
        .map(|t| StatementLine {
            transaction_id: t.id,
            gateway: t.gateway,
            direction: t.direction,
            gateway_reference: t.gateway_reference.clone(),
            amount: t.amount,
            fees: t.fee_total(),
            completed_at: t.completed_at.unwrap_or(t.created_at),
        })
        .collect();
    lines.sort_by_key(|l| (l.completed_at, l.transaction_id));

    let mut hasher = Sha256::new();
    hasher.update(canonical_header(&settlement).as_bytes());
    for line in &lines {
        hasher.update(b"\n");
        hasher.update(line.canonical().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());

    SettlementStatement {
        settlement,
        lines,
        digest,
    }
}

pub fn statement_url(base_url: &str, settlement_id: Uuid) -> String {
    format!(
        "{}/settlements/{}/statement",
        base_url.trim_end_matches('/'),
        settlement_id
    )
}
