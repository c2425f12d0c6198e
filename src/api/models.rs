use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult};
use crate::ingest::{normalize_currency, normalize_msisdn, parse_timestamp};
use crate::ledger::models::*;
use crate::ledger::{PageRequest, QueueFilter, SettlementFilter};

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::new("must_be_non_negative"));
    }
    Ok(())
}

// ========== REQUEST MODELS ==========

/// POST /transactions
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub merchant_id: Uuid,
    pub gateway: Gateway,
    pub direction: Direction,
    #[validate(custom = "non_negative")]
    pub amount: Decimal,
    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,
    #[validate(length(min = 1, max = 32))]
    pub msisdn: String,
    #[validate(length(min = 1, max = 128))]
    pub gateway_reference: Option<String>,
    pub status: Option<TransactionStatus>,
    #[validate(custom = "non_negative")]
    pub platform_fee: Option<Decimal>,
    #[validate(custom = "non_negative")]
    pub gateway_fee: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
}

impl CreateTransactionRequest {
    pub fn into_new_transaction(self) -> AppResult<NewTransaction> {
        Ok(NewTransaction {
            merchant_id: self.merchant_id,
            gateway: self.gateway,
            direction: self.direction,
            amount: self.amount,
            currency: normalize_currency(&self.currency).map_err(AppError::Validation)?,
            msisdn: normalize_msisdn(&self.msisdn).map_err(AppError::Validation)?,
            gateway_reference: self
                .gateway_reference
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            status: self.status.unwrap_or(TransactionStatus::Pending),
            platform_fee: self.platform_fee.unwrap_or(Decimal::ZERO),
            gateway_fee: self.gateway_fee.unwrap_or(Decimal::ZERO),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// POST /transactions/:id/callback
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCallbackRequest {
    pub status: TransactionStatus,
    #[validate(length(min = 1, max = 128))]
    pub gateway_reference: Option<String>,
}

/// POST /reconciliation/queue/:id/link
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub transaction_id: Uuid,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

/// POST /reconciliation/queue/:id/resolve
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[validate(length(max = 2000))]
    pub notes: String,
}

/// POST /reconciliation/runs
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub gateway: Gateway,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// POST /settlements
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSettlementRequest {
    pub merchant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSettlementRequest {
    #[validate(length(max = 128))]
    pub bank_transfer_reference: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FailSettlementRequest {
    #[validate(length(max = 2000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NettingPolicyRequest {
    #[validate(range(min = 0, max = 366))]
    pub refund_lookback_days: i32,
}

/// POST /reconciliation/statements/:gateway - lines in the gateway's own shape
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct StatementUpload(pub Vec<serde_json::Value>);

impl Validate for StatementUpload {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        // Line shapes differ per gateway; the ingestor checks them
        Ok(())
    }
}

// ========== QUERY MODELS ==========
//
// Query values stay strings until parsed here so that unknown enum values and
// bad numbers come back as VALIDATION_ERROR bodies.

fn parse_opt<T>(name: &str, raw: Option<String>) -> AppResult<Option<T>>
where
    T: FromStr,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("Invalid {}: {}", name, value))),
    }
}

fn parse_opt_enum<T>(raw: Option<String>) -> AppResult<Option<T>>
where
    T: FromStr<Err = AppError>,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse::<T>().map(Some),
    }
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC)
fn parse_date(name: &str, raw: Option<String>) -> AppResult<Option<DateTime<Utc>>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => {
            if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Some(midnight.and_utc()));
                }
            }
            parse_timestamp(value)
                .map(Some)
                .map_err(|e| AppError::Validation(format!("Invalid {}: {}", name, e)))
        }
    }
}

fn page_request(page: Option<String>, limit: Option<String>) -> AppResult<PageRequest> {
    PageRequest::new(parse_opt("page", page)?, parse_opt("limit", limit)?)
}

/// GET /reconciliation/queue
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueQuery {
    pub gateway: Option<String>,
    pub match_status: Option<String>,
    pub resolved: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl QueueQuery {
    pub fn into_filter(self) -> AppResult<(QueueFilter, PageRequest)> {
        let filter = QueueFilter {
            gateway: parse_opt_enum(self.gateway)?,
            match_status: parse_opt_enum(self.match_status)?,
            resolved: parse_opt("resolved", self.resolved)?,
        };
        Ok((filter, page_request(self.page, self.limit)?))
    }
}

/// GET /settlements
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementQuery {
    pub merchant_id: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl SettlementQuery {
    pub fn into_filter(self) -> AppResult<(SettlementFilter, PageRequest)> {
        let filter = SettlementFilter {
            merchant_id: parse_opt("merchantId", self.merchant_id)?,
            status: parse_opt_enum(self.status)?,
            start_date: parse_date("startDate", self.start_date)?,
            end_date: parse_date("endDate", self.end_date)?,
        };

        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            if start > end {
                return Err(AppError::Validation(
                    "startDate must not be after endDate".to_string(),
                ));
            }
        }

        Ok((filter, page_request(self.page, self.limit)?))
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_query_parsing() {
        let (filter, page) = QueueQuery {
            gateway: Some("mtn_momo".to_string()),
            match_status: Some("MISSING_IN_GATEWAY".to_string()),
            resolved: Some("false".to_string()),
            page: None,
            limit: Some("50".to_string()),
        }
        .into_filter()
        .unwrap();

        assert_eq!(filter.gateway, Some(Gateway::MtnMomo));
        assert_eq!(filter.match_status, Some(MatchStatus::MissingInGateway));
        assert_eq!(filter.resolved, Some(false));
        assert_eq!(page, PageRequest { page: 1, limit: 50 });
    }

    #[test]
    fn test_bad_query_values_are_validation_errors() {
        let unknown = QueueQuery {
            match_status: Some("MATCHED".to_string()),
            ..Default::default()
        };
        assert!(matches!(unknown.into_filter(), Err(AppError::Validation(_))));

        let bad_limit = QueueQuery {
            limit: Some("500".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_limit.into_filter(), Err(AppError::Validation(_))));

        let reversed = SettlementQuery {
            start_date: Some("2024-03-10".to_string()),
            end_date: Some("2024-03-01".to_string()),
            ..Default::default()
        };
        assert!(matches!(reversed.into_filter(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_settlement_query_dates() {
        let (filter, _) = SettlementQuery {
            start_date: Some("2024-03-01".to_string()),
            end_date: Some("2024-03-31T23:59:59Z".to_string()),
            ..Default::default()
        }
        .into_filter()
        .unwrap();

        assert_eq!(
            filter.start_date,
            Some("2024-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
        assert!(filter.end_date.is_some());
    }

    #[test]
    fn test_create_transaction_normalizes() {
        let request = CreateTransactionRequest {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::OrangeMoney,
            direction: Direction::Collection,
            amount: Decimal::new(5000, 0),
            currency: "xaf".to_string(),
            msisdn: "+237 690-000-001".to_string(),
            gateway_reference: Some("  ".to_string()),
            status: None,
            platform_fee: None,
            gateway_fee: None,
            created_at: None,
        };
        assert!(request.validate().is_ok());

        let txn = request.into_new_transaction().unwrap();
        assert_eq!(txn.currency, "XAF");
        assert_eq!(txn.msisdn, "237690000001");
        assert_eq!(txn.gateway_reference, None);
        assert_eq!(txn.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_negative_amount_fails_validation() {
        let request = CreateTransactionRequest {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount: Decimal::new(-1, 0),
            currency: "XAF".to_string(),
            msisdn: "237670000000".to_string(),
            gateway_reference: None,
            status: None,
            platform_fee: None,
            gateway_fee: None,
            created_at: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_zero_amount_is_accepted() {
        let request = CreateTransactionRequest {
            merchant_id: Uuid::new_v4(),
            gateway: Gateway::MtnMomo,
            direction: Direction::Collection,
            amount: Decimal::ZERO,
            currency: "XAF".to_string(),
            msisdn: "237670000000".to_string(),
            gateway_reference: Some("MTN-ZERO".to_string()),
            status: Some(TransactionStatus::Success),
            platform_fee: None,
            gateway_fee: None,
            created_at: None,
        };
        assert!(request.validate().is_ok());
        assert_eq!(request.into_new_transaction().unwrap().amount, Decimal::ZERO);
    }
}
