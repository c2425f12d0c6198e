//! Three-way classification of ledger transactions against a gateway
//! statement. Pure: the engine loads both sides and persists the result.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::ledger::models::{
    GatewayRecord, MatchStatus, ReconciliationQueueItem, Transaction, TransactionStatus, Gateway,
};

/// One unmatched or mismatched unit found by [`classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub match_status: MatchStatus,
    pub gateway_reference: Option<String>,
    /// Uniqueness key within the gateway's queue
    pub source_key: String,
    pub amount: Decimal,
    pub ledger_amount: Option<Decimal>,
    pub currency: String,
    pub msisdn: String,
    pub occurred_at: DateTime<Utc>,
    pub detail: Option<String>,
    pub ledger_transaction_id: Option<Uuid>,
}

impl Discrepancy {
    fn from_record(record: &GatewayRecord, match_status: MatchStatus) -> Self {
        Self {
            match_status,
            gateway_reference: record.gateway_reference.clone(),
            source_key: record.record_key.clone(),
            amount: record.amount,
            ledger_amount: None,
            currency: record.currency.clone(),
            msisdn: record.msisdn.clone(),
            occurred_at: record.occurred_at,
            detail: None,
            ledger_transaction_id: None,
        }
    }

    fn from_ledger(transaction: &Transaction) -> Self {
        Self {
            match_status: MatchStatus::MissingInGateway,
            gateway_reference: transaction.gateway_reference.clone(),
            source_key: ledger_source_key(transaction.id),
            amount: transaction.amount,
            ledger_amount: Some(transaction.amount),
            currency: transaction.currency.clone(),
            msisdn: transaction.msisdn.clone(),
            occurred_at: transaction.created_at,
            detail: None,
            ledger_transaction_id: Some(transaction.id),
        }
    }

    fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn into_queue_item(self, gateway: Gateway, created_at: DateTime<Utc>) -> ReconciliationQueueItem {
        ReconciliationQueueItem {
            id: Uuid::new_v4(),
            gateway,
            gateway_reference: self.gateway_reference,
            source_key: self.source_key,
            amount: self.amount,
            ledger_amount: self.ledger_amount,
            currency: self.currency,
            msisdn: self.msisdn,
            occurred_at: self.occurred_at,
            match_status: self.match_status,
            detail: self.detail,
            ledger_transaction_id: self.ledger_transaction_id,
            linked_transaction_id: None,
            link_notes: None,
            resolved: false,
            resolved_at: None,
            resolution_notes: None,
            created_at,
        }
    }
}

/// Ledger-side items are keyed by transaction so a later statement line with
/// the same reference still gets its own item.
pub fn ledger_source_key(transaction_id: Uuid) -> String {
    format!("ledger:{}", transaction_id)
}

fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: Duration) -> bool {
    (a - b).abs() <= tolerance
}

/// The half-open window a run is responsible for. Rows loaded from outside
/// it (the engine widens both sides by the match tolerance) only serve as
/// join partners and never produce items of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MatchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Bounds the engine loads: the window grown by `tolerance` on each side
    pub fn widened(&self, tolerance: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start - tolerance, self.end + tolerance)
    }
}

/// Classify one gateway window.
///
/// `ledger` may hold transactions of any status; PENDING and VERIFYING ones
/// never produce items and a statement line referencing one is deferred to
/// a later run. Lines that carry no reference, or whose reference is unknown
/// to the ledger, fall back to (msisdn, exact amount, timestamp within
/// `tolerance`). A referenced line only pairs this way with a ledger row that
/// has no reference yet. Fallback pairs form only when the candidate is
/// unique on both sides.
pub fn classify(
    ledger: &[Transaction],
    records: &[GatewayRecord],
    window: MatchWindow,
    tolerance: Duration,
) -> Vec<Discrepancy> {
    let mut out = Vec::new();
    let mut consumed: HashSet<Uuid> = HashSet::new();

    let by_reference: HashMap<&str, &Transaction> = ledger
        .iter()
        .filter_map(|t| t.gateway_reference.as_deref().map(|r| (r, t)))
        .collect();

    let feed_references: HashSet<&str> = records
        .iter()
        .filter_map(|r| r.gateway_reference.as_deref())
        .collect();

    let mut emit = |record: &GatewayRecord, item: Discrepancy| {
        if window.contains(record.occurred_at) {
            out.push(item);
        }
    };

    // Pass 1: join on gateway reference
    let mut unpaired: Vec<&GatewayRecord> = Vec::new();
    for record in records {
        let transaction = match record
            .gateway_reference
            .as_deref()
            .and_then(|reference| by_reference.get(reference))
        {
            Some(t) => *t,
            None => {
                unpaired.push(record);
                continue;
            }
        };
        consumed.insert(transaction.id);

        if !transaction.is_matchable() {
            continue;
        }

        if transaction.status != TransactionStatus::Success {
            let mut item = Discrepancy::from_record(record, MatchStatus::MissingInZitopay)
                .with_detail(format!(
                    "ledger transaction {} is {}",
                    transaction.id, transaction.status
                ));
            item.ledger_transaction_id = Some(transaction.id);
            emit(record, item);
        } else if transaction.currency != record.currency {
            let mut item = Discrepancy::from_record(record, MatchStatus::AmountMismatch)
                .with_detail(format!(
                    "currency differs: ledger {} vs gateway {}",
                    transaction.currency, record.currency
                ));
            item.ledger_amount = Some(transaction.amount);
            item.ledger_transaction_id = Some(transaction.id);
            emit(record, item);
        } else if transaction.amount != record.amount {
            let mut item = Discrepancy::from_record(record, MatchStatus::AmountMismatch);
            item.ledger_amount = Some(transaction.amount);
            item.ledger_transaction_id = Some(transaction.id);
            emit(record, item);
        }
    }

    // Pass 2: composite-key fallback for lines the reference join missed
    let fallback_pool: Vec<&Transaction> = ledger
        .iter()
        .filter(|t| {
            t.status == TransactionStatus::Success
                && !consumed.contains(&t.id)
                && t
                    .gateway_reference
                    .as_deref()
                    .map_or(true, |r| !feed_references.contains(r))
        })
        .collect();

    let candidates: Vec<Vec<&Transaction>> = unpaired
        .iter()
        .map(|record| {
            fallback_pool
                .iter()
                .copied()
                .filter(|t| {
                    (record.gateway_reference.is_none() || t.gateway_reference.is_none())
                        && t.msisdn == record.msisdn
                        && t.amount == record.amount
                        && within_tolerance(t.created_at, record.occurred_at, tolerance)
                })
                .collect()
        })
        .collect();

    let mut claims: HashMap<Uuid, usize> = HashMap::new();
    for found in &candidates {
        for t in found {
            *claims.entry(t.id).or_insert(0) += 1;
        }
    }

    for (record, found) in unpaired.iter().copied().zip(candidates.iter()) {
        match found.as_slice() {
            [] => emit(record, Discrepancy::from_record(record, MatchStatus::MissingInZitopay)),
            [only] if claims.get(&only.id) == Some(&1) => {
                consumed.insert(only.id);
            }
            [only] => emit(
                record,
                Discrepancy::from_record(record, MatchStatus::MissingInZitopay).with_detail(
                    format!(
                        "ambiguous match: ledger transaction {} fits {} statement lines",
                        only.id,
                        claims.get(&only.id).copied().unwrap_or(0)
                    ),
                ),
            ),
            many => emit(
                record,
                Discrepancy::from_record(record, MatchStatus::MissingInZitopay).with_detail(
                    format!(
                        "ambiguous match: {} ledger transactions within tolerance ({})",
                        many.len(),
                        many.iter()
                            .map(|t| t.id.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ),
            ),
        }
    }

    // Pass 3: ledger successes in the window the gateway never reported
    for transaction in ledger {
        if transaction.status == TransactionStatus::Success
            && !consumed.contains(&transaction.id)
            && window.contains(transaction.created_at)
        {
            out.push(Discrepancy::from_ledger(transaction));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{Direction, NewTransaction};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn base_time() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    fn txn(reference: Option<&str>, amount: Decimal, status: TransactionStatus) -> Transaction {
        NewTransaction {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount,
            currency: "XAF".to_string(),
            msisdn: "237670000001".to_string(),
            gateway_reference: reference.map(str::to_string),
            status,
            platform_fee: dec!(0),
            gateway_fee: dec!(0),
            created_at: base_time(),
        }
        .into_transaction()
    }

    fn record(reference: Option<&str>, amount: Decimal, offset_secs: i64) -> GatewayRecord {
        GatewayRecord::new(
            Gateway::MtnMomo,
            reference.map(str::to_string),
            amount,
            "XAF".to_string(),
            "237670000001".to_string(),
            base_time() + Duration::seconds(offset_secs),
        )
    }

    fn tolerance() -> Duration {
        Duration::minutes(5)
    }

    fn window() -> MatchWindow {
        MatchWindow::new(base_time() - Duration::hours(1), base_time() + Duration::hours(1))
    }

    #[test]
    fn test_missing_in_gateway() {
        let ledger = vec![txn(Some("R1"), dec!(10000), TransactionStatus::Success)];
        let out = classify(&ledger, &[], window(), tolerance());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].match_status, MatchStatus::MissingInGateway);
        assert_eq!(out[0].ledger_transaction_id, Some(ledger[0].id));
        assert_eq!(out[0].source_key, ledger_source_key(ledger[0].id));
    }

    #[test]
    fn test_missing_in_zitopay() {
        let out = classify(&[], &[record(Some("R2"), dec!(5000), 0)], window(), tolerance());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].match_status, MatchStatus::MissingInZitopay);
        assert_eq!(out[0].source_key, "R2");
    }

    #[test]
    fn test_amount_mismatch_has_zero_tolerance() {
        let ledger = vec![txn(Some("R3"), dec!(10000), TransactionStatus::Success)];
        let out = classify(&ledger, &[record(Some("R3"), dec!(10050), 0)], window(), tolerance());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].match_status, MatchStatus::AmountMismatch);
        assert_eq!(out[0].amount, dec!(10050));
        assert_eq!(out[0].ledger_amount, Some(dec!(10000)));
    }

    #[test]
    fn test_failed_ledger_transaction_counts_as_missing() {
        let ledger = vec![txn(Some("R4"), dec!(100), TransactionStatus::Failed)];
        let out = classify(&ledger, &[record(Some("R4"), dec!(100), 0)], window(), tolerance());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].match_status, MatchStatus::MissingInZitopay);
        assert_eq!(out[0].ledger_transaction_id, Some(ledger[0].id));
        assert!(out[0].detail.as_deref().unwrap().contains("FAILED"));
    }

    #[test]
    fn test_pending_transactions_are_deferred() {
        let ledger = vec![
            txn(Some("R5"), dec!(100), TransactionStatus::Pending),
            txn(None, dec!(100), TransactionStatus::Verifying),
        ];
        let out = classify(&ledger, &[record(Some("R5"), dec!(100), 0)], window(), tolerance());
        assert!(out.is_empty());
    }

    #[test]
    fn test_currency_difference_is_a_mismatch() {
        let ledger = vec![txn(Some("R6"), dec!(100), TransactionStatus::Success)];
        let mut line = record(Some("R6"), dec!(100), 0);
        line.currency = "XOF".to_string();
        let out = classify(&ledger, &[line], window(), tolerance());
        assert_eq!(out[0].match_status, MatchStatus::AmountMismatch);
    }

    #[test]
    fn test_composite_fallback_pairs_unique_candidate() {
        let ledger = vec![txn(None, dec!(2500), TransactionStatus::Success)];
        let out = classify(&ledger, &[record(None, dec!(2500), 120)], window(), tolerance());
        assert!(out.is_empty());

        // Outside tolerance: both sides surface
        let out = classify(&ledger, &[record(None, dec!(2500), 301)], window(), tolerance());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_ambiguous_fallback_is_never_paired() {
        let ledger = vec![
            txn(None, dec!(2500), TransactionStatus::Success),
            txn(None, dec!(2500), TransactionStatus::Success),
        ];
        let out = classify(&ledger, &[record(None, dec!(2500), 60)], window(), tolerance());

        let missing_here: Vec<_> = out
            .iter()
            .filter(|d| d.match_status == MatchStatus::MissingInZitopay)
            .collect();
        assert_eq!(missing_here.len(), 1);
        assert!(missing_here[0].detail.as_deref().unwrap().starts_with("ambiguous"));
        assert_eq!(
            out.iter()
                .filter(|d| d.match_status == MatchStatus::MissingInGateway)
                .count(),
            2
        );
    }

    #[test]
    fn test_one_ledger_candidate_for_two_lines_is_ambiguous() {
        let ledger = vec![txn(None, dec!(700), TransactionStatus::Success)];
        let out = classify(
            &ledger,
            &[record(None, dec!(700), 10), record(None, dec!(700), 20)],
            window(),
            tolerance(),
        );
        assert_eq!(out.len(), 3);
        assert_eq!(
            out.iter()
                .filter(|d| d.detail.as_deref().map_or(false, |s| s.starts_with("ambiguous")))
                .count(),
            2
        );
    }

    #[test]
    fn test_referenced_line_pairs_with_unreferenced_ledger_row() {
        let ledger = vec![txn(None, dec!(10000), TransactionStatus::Success)];
        let out = classify(&ledger, &[record(Some("GW-9"), dec!(10000), 60)], window(), tolerance());
        assert!(out.is_empty());

        // A ledger row that already carries another reference is a different payment
        let ledger = vec![txn(Some("GW-8"), dec!(10000), TransactionStatus::Success)];
        let out = classify(&ledger, &[record(Some("GW-9"), dec!(10000), 60)], window(), tolerance());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_referenced_line_with_two_unreferenced_candidates_is_ambiguous() {
        let ledger = vec![
            txn(None, dec!(10000), TransactionStatus::Success),
            txn(None, dec!(10000), TransactionStatus::Success),
        ];
        let out = classify(&ledger, &[record(Some("GW-9"), dec!(10000), 60)], window(), tolerance());
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .any(|d| d.match_status == MatchStatus::MissingInZitopay
                && d.detail.as_deref().map_or(false, |s| s.starts_with("ambiguous"))));
    }

    #[test]
    fn test_pair_straddling_window_edge_is_matched_from_both_sides() {
        let edge = base_time();
        let mut ledger_row = txn(Some("RB"), dec!(4000), TransactionStatus::Success);
        ledger_row.created_at = edge - Duration::seconds(1);
        let line = record(Some("RB"), dec!(4000), 1);

        let before = MatchWindow::new(edge - Duration::hours(1), edge);
        let after = MatchWindow::new(edge, edge + Duration::hours(1));
        let ledger = vec![ledger_row];
        let records = vec![line];

        assert!(classify(&ledger, &records, before, tolerance()).is_empty());
        assert!(classify(&ledger, &records, after, tolerance()).is_empty());
    }

    #[test]
    fn test_rows_outside_window_produce_no_items() {
        let edge = base_time();
        let mut early = txn(Some("R7"), dec!(100), TransactionStatus::Success);
        early.created_at = edge - Duration::seconds(30);
        let late_line = record(Some("R8"), dec!(200), 30);

        let current = MatchWindow::new(edge, edge + Duration::hours(1));
        let out = classify(&[early.clone()], &[], current, tolerance());
        assert!(out.is_empty());

        let previous = MatchWindow::new(edge - Duration::hours(1), edge);
        let out = classify(&[early], &[late_line], previous, tolerance());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].match_status, MatchStatus::MissingInGateway);
    }

    proptest! {
        #[test]
        fn prop_matching_pairs_produce_no_items(amounts in prop::collection::vec(1u64..1_000_000, 1..20)) {
            let ledger: Vec<Transaction> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| txn(Some(&format!("REF-{}", i)), Decimal::from(*a), TransactionStatus::Success))
                .collect();
            let records: Vec<GatewayRecord> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| record(Some(&format!("REF-{}", i)), Decimal::from(*a), 0))
                .collect();

            prop_assert!(classify(&ledger, &records, window(), tolerance()).is_empty());
        }

        #[test]
        fn prop_classification_is_deterministic(
            ledger_amounts in prop::collection::vec(1u64..10_000, 0..10),
            record_amounts in prop::collection::vec(1u64..10_000, 0..10),
        ) {
            let ledger: Vec<Transaction> = ledger_amounts
                .iter()
                .enumerate()
                .map(|(i, a)| txn(Some(&format!("L-{}", i % 4)), Decimal::from(*a), TransactionStatus::Success))
                .filter({
                    let mut seen = HashSet::new();
                    move |t| seen.insert(t.gateway_reference.clone())
                })
                .collect();
            let records: Vec<GatewayRecord> = record_amounts
                .iter()
                .enumerate()
                .map(|(i, a)| record(Some(&format!("L-{}", i)), Decimal::from(*a), 0))
                .collect();

            let first = classify(&ledger, &records, window(), tolerance());
            let second = classify(&ledger, &records, window(), tolerance());
            prop_assert_eq!(first.clone(), second);

            let keys: HashSet<&str> = first.iter().map(|d| d.source_key.as_str()).collect();
            prop_assert_eq!(keys.len(), first.len());
        }
    }
}
