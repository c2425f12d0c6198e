//! Gateway statement normalization.
//!
//! Each gateway publishes statements in its own JSON shape. Lines are
//! normalized into [`GatewayRecord`]s; a single malformed line rejects the
//! whole batch so a partial statement is never matched.

pub mod source;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{AppResult, ReconError};
use crate::ledger::models::{Gateway, GatewayRecord};

pub use source::{HttpStatementSource, StatementSource, StoredStatementSource};

const ORANGE_DEFAULT_CURRENCY: &str = "XAF";

/// Amount fields arrive as JSON strings or numbers depending on the gateway
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Number(serde_json::Number),
}

impl RawAmount {
    fn parse(&self) -> Result<Decimal, String> {
        let raw = match self {
            RawAmount::Text(s) => s.trim().to_string(),
            RawAmount::Number(n) => n.to_string(),
        };
        let amount = Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map_err(|_| format!("amount '{}' is not a decimal", raw))?;
        if amount.is_sign_negative() {
            return Err(format!("amount {} is negative", amount));
        }
        Ok(amount)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MtnParty {
    party_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MtnLine {
    financial_transaction_id: Option<String>,
    amount: RawAmount,
    currency: String,
    payer: Option<MtnParty>,
    party_id: Option<String>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrangeLine {
    txnid: Option<String>,
    amount: RawAmount,
    currency: Option<String>,
    subscriber_msisdn: String,
    date: String,
}

/// Shape shared by gateways without a dedicated format
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalLine {
    gateway_reference: Option<String>,
    amount: RawAmount,
    currency: String,
    msisdn: String,
    timestamp: String,
}

struct ParsedLine {
    reference: Option<String>,
    amount: Decimal,
    currency: String,
    msisdn: String,
    occurred_at: DateTime<Utc>,
}

/// Normalize a raw statement into records, collapsing repeated references
/// to their first occurrence.
pub fn normalize_statement(gateway: Gateway, lines: &[Value]) -> AppResult<Vec<GatewayRecord>> {
    let mut records = Vec::with_capacity(lines.len());
    let mut seen = HashSet::new();

    for (index, line) in lines.iter().enumerate() {
        let parsed = parse_line(gateway, line).map_err(|message| {
            ReconError::InvalidStatementLine {
                gateway,
                line: index + 1,
                message,
            }
        })?;

        let record = GatewayRecord::new(
            gateway,
            parsed.reference,
            parsed.amount,
            parsed.currency,
            parsed.msisdn,
            parsed.occurred_at,
        );

        if seen.insert(record.record_key.clone()) {
            records.push(record);
        }
    }

    Ok(records)
}

fn parse_line(gateway: Gateway, line: &Value) -> Result<ParsedLine, String> {
    match gateway {
        Gateway::MtnMomo => {
            let raw: MtnLine = serde_json::from_value(line.clone()).map_err(|e| e.to_string())?;
            let msisdn = raw
                .payer
                .map(|p| p.party_id)
                .or(raw.party_id)
                .ok_or_else(|| "missing payer.partyId".to_string())?;
            Ok(ParsedLine {
                reference: raw.financial_transaction_id,
                amount: raw.amount.parse()?,
                currency: normalize_currency(&raw.currency)?,
                msisdn: normalize_msisdn(&msisdn)?,
                occurred_at: parse_timestamp(&raw.created_at)?,
            })
        }
        Gateway::OrangeMoney => {
            let raw: OrangeLine =
                serde_json::from_value(line.clone()).map_err(|e| e.to_string())?;
            let currency = raw
                .currency
                .unwrap_or_else(|| ORANGE_DEFAULT_CURRENCY.to_string());
            Ok(ParsedLine {
                reference: raw.txnid,
                amount: raw.amount.parse()?,
                currency: normalize_currency(&currency)?,
                msisdn: normalize_msisdn(&raw.subscriber_msisdn)?,
                occurred_at: parse_timestamp(&raw.date)?,
            })
        }
        Gateway::AirtelMoney | Gateway::MoovMoney => {
            let raw: CanonicalLine =
                serde_json::from_value(line.clone()).map_err(|e| e.to_string())?;
            Ok(ParsedLine {
                reference: raw.gateway_reference,
                amount: raw.amount.parse()?,
                currency: normalize_currency(&raw.currency)?,
                msisdn: normalize_msisdn(&raw.msisdn)?,
                occurred_at: parse_timestamp(&raw.timestamp)?,
            })
        }
    }
}

/// Digits only: strips `+`, a leading `00`, spaces and dashes
pub fn normalize_msisdn(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix('+')
        .or_else(|| trimmed.strip_prefix("00"))
        .unwrap_or(trimmed);

    let mut digits = String::with_capacity(without_prefix.len());
    for c in without_prefix.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' => {}
            other => return Err(format!("msisdn '{}' contains '{}'", raw, other)),
        }
    }

    if digits.is_empty() {
        return Err("msisdn is empty".to_string());
    }
    Ok(digits)
}

pub fn normalize_currency(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("currency '{}' is not a 3-letter code", raw));
    }
    Ok(code)
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` read as UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("timestamp '{}' is not RFC 3339", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_mtn_lines_normalize() {
        let lines = vec![
            json!({
                "financialTransactionId": "MTN-1",
                "amount": "10000",
                "currency": "xaf",
                "payer": { "partyId": "+237 670-000-001" },
                "createdAt": "2024-03-01T10:00:00Z"
            }),
            json!({
                "amount": 2500.5,
                "currency": "XAF",
                "partyId": "00237670000002",
                "createdAt": "2024-03-01T11:00:00+01:00"
            }),
        ];

        let records = normalize_statement(Gateway::MtnMomo, &lines).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].gateway_reference.as_deref(), Some("MTN-1"));
        assert_eq!(records[0].msisdn, "237670000001");
        assert_eq!(records[0].currency, "XAF");
        assert_eq!(records[1].amount, dec!(2500.5));
        assert_eq!(records[1].msisdn, "237670000002");
        assert_eq!(
            records[1].occurred_at,
            "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(records[1].gateway_reference.is_none());
    }

    #[test]
    fn test_orange_defaults_currency_and_accepts_naive_dates() {
        let lines = vec![json!({
            "txnid": "OM-9",
            "amount": 5000,
            "subscriberMsisdn": "237690000000",
            "date": "2024-03-01 09:30:00"
        })];

        let records = normalize_statement(Gateway::OrangeMoney, &lines).unwrap();
        assert_eq!(records[0].currency, "XAF");
        assert_eq!(
            records[0].occurred_at,
            "2024-03-01T09:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_duplicate_references_collapse_to_first() {
        let line = |amount: &str| {
            json!({
                "gatewayReference": "AT-1",
                "amount": amount,
                "currency": "XOF",
                "msisdn": "22670000000",
                "timestamp": "2024-03-01T10:00:00Z"
            })
        };
        let records =
            normalize_statement(Gateway::AirtelMoney, &[line("100"), line("200")]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, dec!(100));
    }

    #[test]
    fn test_one_bad_line_rejects_the_batch() {
        let lines = vec![
            json!({
                "gatewayReference": "MV-1",
                "amount": "100",
                "currency": "XOF",
                "msisdn": "22990000000",
                "timestamp": "2024-03-01T10:00:00Z"
            }),
            json!({
                "gatewayReference": "MV-2",
                "amount": "-5",
                "currency": "XOF",
                "msisdn": "22990000000",
                "timestamp": "2024-03-01T10:00:00Z"
            }),
        ];

        let err = normalize_statement(Gateway::MoovMoney, &lines).unwrap_err();
        match err {
            AppError::Recon(ReconError::InvalidStatementLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_msisdn_and_currency_rules() {
        assert_eq!(normalize_msisdn("+237 670-00").unwrap(), "23767000");
        assert!(normalize_msisdn("abc").is_err());
        assert!(normalize_msisdn("  ").is_err());
        assert!(normalize_currency("XA").is_err());
        assert_eq!(normalize_currency(" xof ").unwrap(), "XOF");
    }
}
