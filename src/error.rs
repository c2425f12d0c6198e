use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{Gateway, SettlementStatus, TransactionStatus};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Reconciliation error: {0}")]
    Recon(#[from] ReconError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Ledger store errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Transaction {id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Transaction {id} already carries gateway reference {existing}")]
    ReferenceConflict { id: Uuid, existing: String },

    #[error("Gateway reference {reference} already recorded on {gateway}")]
    DuplicateReference { gateway: Gateway, reference: String },
}

/// Matcher and resolution-queue errors
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Queue item not found: {0}")]
    QueueItemNotFound(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Queue item {0} was already resolved by another operator")]
    AlreadyResolved(Uuid),

    #[error("Resolution notes are required")]
    EmptyNotes,

    #[error("Queue item {0} is missing on our side and must be linked to a ledger transaction before it can be resolved")]
    LinkRequired(Uuid),

    #[error("Transaction belongs to {transaction_gateway}, queue item belongs to {item_gateway}")]
    GatewayMismatch {
        item_gateway: Gateway,
        transaction_gateway: Gateway,
    },

    #[error("Queue item {item_id} is already linked to {linked}; refusing to relink to {requested}")]
    DuplicateLink {
        item_id: Uuid,
        linked: Uuid,
        requested: Uuid,
    },

    #[error("Window end must be after window start")]
    InvalidWindow,

    #[error("A reconciliation run for {gateway} {window_start}..{window_end} is already in progress")]
    RunInProgress {
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    #[error("Window overlaps the reconciled window {existing_start}..{existing_end} for {gateway}")]
    WindowOverlap {
        gateway: Gateway,
        existing_start: DateTime<Utc>,
        existing_end: DateTime<Utc>,
    },

    #[error("Statement fetch for {gateway} failed: {message}")]
    StatementFetch { gateway: Gateway, message: String },

    #[error("Malformed {gateway} statement line {line}: {message}")]
    InvalidStatementLine {
        gateway: Gateway,
        line: usize,
        message: String,
    },
}

/// Settlement aggregation and lifecycle errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Settlement not found: {0}")]
    NotFound(Uuid),

    #[error("Period end must be after period start")]
    InvalidPeriod,

    #[error("Merchant {merchant_id} already has a settlement overlapping {period_start}..{period_end}")]
    PeriodConflict {
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },

    #[error("Net amount for merchant {merchant_id} would be negative: gross {gross}, fees {fees}")]
    NegativeNetAmount {
        merchant_id: Uuid,
        gross: Decimal,
        fees: Decimal,
    },

    #[error("Settlement {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
    },

    #[error("A failure reason is required")]
    MissingReason,

    #[error("Eligible transactions mix currencies: {0:?}")]
    MixedCurrency(Vec<String>),

    #[error("Transactions for merchant {0} were settled concurrently; retry generation")]
    ConcurrentSettlement(Uuid),
}

/// Coarse taxonomy exposed to callers and used for log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Integrity,
    Upstream,
    Internal,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Validation(_) => ErrorClass::Validation,
            AppError::NotFound(_) => ErrorClass::NotFound,
            AppError::Upstream(_) => ErrorClass::Upstream,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorClass::Internal
            }
            AppError::Ledger(e) => match e {
                LedgerError::TransactionNotFound(_) => ErrorClass::NotFound,
                LedgerError::InvalidStatusTransition { .. }
                | LedgerError::ReferenceConflict { .. }
                | LedgerError::DuplicateReference { .. } => ErrorClass::Conflict,
            },
            AppError::Recon(e) => match e {
                ReconError::QueueItemNotFound(_) | ReconError::TransactionNotFound(_) => {
                    ErrorClass::NotFound
                }
                ReconError::AlreadyResolved(_)
                | ReconError::RunInProgress { .. }
                | ReconError::WindowOverlap { .. } => ErrorClass::Conflict,
                ReconError::EmptyNotes
                | ReconError::LinkRequired(_)
                | ReconError::GatewayMismatch { .. }
                | ReconError::InvalidWindow
                | ReconError::InvalidStatementLine { .. } => ErrorClass::Validation,
                ReconError::DuplicateLink { .. } => ErrorClass::Integrity,
                ReconError::StatementFetch { .. } => ErrorClass::Upstream,
            },
            AppError::Settlement(e) => match e {
                SettlementError::NotFound(_) => ErrorClass::NotFound,
                SettlementError::InvalidPeriod
                | SettlementError::MissingReason
                | SettlementError::MixedCurrency(_) => ErrorClass::Validation,
                SettlementError::PeriodConflict { .. }
                | SettlementError::InvalidTransition { .. }
                | SettlementError::ConcurrentSettlement(_) => ErrorClass::Conflict,
                SettlementError::NegativeNetAmount { .. } => ErrorClass::Integrity,
            },
        }
    }

    /// Stable machine-readable code for the calling UI
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::Config(_) | AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Ledger(e) => match e {
                LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
                LedgerError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
                LedgerError::ReferenceConflict { .. } => "REFERENCE_CONFLICT",
                LedgerError::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            },
            AppError::Recon(e) => match e {
                ReconError::QueueItemNotFound(_) => "QUEUE_ITEM_NOT_FOUND",
                ReconError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
                ReconError::AlreadyResolved(_) => "ALREADY_RESOLVED",
                ReconError::EmptyNotes => "NOTES_REQUIRED",
                ReconError::LinkRequired(_) => "LINK_REQUIRED",
                ReconError::GatewayMismatch { .. } => "GATEWAY_MISMATCH",
                ReconError::DuplicateLink { .. } => "DUPLICATE_LINK",
                ReconError::InvalidWindow => "INVALID_WINDOW",
                ReconError::RunInProgress { .. } => "RUN_IN_PROGRESS",
                ReconError::WindowOverlap { .. } => "WINDOW_OVERLAP",
                ReconError::StatementFetch { .. } => "STATEMENT_FETCH_FAILED",
                ReconError::InvalidStatementLine { .. } => "INVALID_STATEMENT_LINE",
            },
            AppError::Settlement(e) => match e {
                SettlementError::NotFound(_) => "SETTLEMENT_NOT_FOUND",
                SettlementError::InvalidPeriod => "INVALID_PERIOD",
                SettlementError::PeriodConflict { .. } => "PERIOD_CONFLICT",
                SettlementError::NegativeNetAmount { .. } => "NEGATIVE_NET_AMOUNT",
                SettlementError::InvalidTransition { .. } => "INVALID_TRANSITION",
                SettlementError::MissingReason => "REASON_REQUIRED",
                SettlementError::MixedCurrency(_) => "MIXED_CURRENCY",
                SettlementError::ConcurrentSettlement(_) => "CONCURRENT_SETTLEMENT",
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.class() {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Upstream => StatusCode::BAD_GATEWAY,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Recon(ReconError::DuplicateLink {
                item_id,
                linked,
                requested,
            }) => Some(serde_json::json!({
                "itemId": item_id,
                "linkedTransactionId": linked,
                "requestedTransactionId": requested,
            })),
            AppError::Recon(ReconError::GatewayMismatch {
                item_gateway,
                transaction_gateway,
            }) => Some(serde_json::json!({
                "itemGateway": item_gateway,
                "transactionGateway": transaction_gateway,
            })),
            AppError::Settlement(SettlementError::NegativeNetAmount {
                merchant_id,
                gross,
                fees,
            }) => Some(serde_json::json!({
                "merchantId": merchant_id,
                "grossAmount": gross,
                "feesTotal": fees,
            })),
            AppError::Settlement(SettlementError::InvalidTransition { id, from, to }) => {
                Some(serde_json::json!({
                    "settlementId": id,
                    "currentStatus": from,
                    "requestedStatus": to,
                }))
            }
            _ => None,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let class = self.class();

        // Internal details stay in the logs
        let message = match class {
            ErrorClass::Internal => {
                tracing::error!(error = %self, "request failed with internal error");
                "An internal error occurred".to_string()
            }
            ErrorClass::Integrity => {
                tracing::error!(error = %self, code = self.error_code(), "integrity violation surfaced to operator");
                self.to_string()
            }
            ErrorClass::Upstream => {
                tracing::warn!(error = %self, "upstream failure");
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: self.error_code().to_string(),
            details: self.details(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Validation(format!("Decimal conversion error: {}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Upstream(format!("HTTP request error: {}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::Validation(format!("Validation failed: {}", message))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
