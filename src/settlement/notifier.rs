// Settlement notifications
//
// Delivery (webhooks, email) belongs to an adjacent system; the engine only
// emits events through this seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::ledger::models::{Settlement, SettlementStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettlementEventKind {
    #[serde(rename = "settlement.generated")]
    Generated,
    #[serde(rename = "settlement.completed")]
    Completed,
    #[serde(rename = "settlement.failed")]
    Failed,
}

impl SettlementEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementEventKind::Generated => "settlement.generated",
            SettlementEventKind::Completed => "settlement.completed",
            SettlementEventKind::Failed => "settlement.failed",
        }
    }
}

/// Public fields of a settlement at the moment of the event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub kind: SettlementEventKind,
    pub settlement_id: Uuid,
    pub merchant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub net_amount: Decimal,
    pub status: SettlementStatus,
    pub occurred_at: DateTime<Utc>,
}

impl SettlementEvent {
    pub fn new(kind: SettlementEventKind, settlement: &Settlement) -> Self {
        Self {
            kind,
            settlement_id: settlement.id,
            merchant_id: settlement.merchant_id,
            period_start: settlement.period_start,
            period_end: settlement.period_end,
            currency: settlement.currency.clone(),
            net_amount: settlement.net_amount,
            status: settlement.status,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SettlementNotifier: Send + Sync {
    async fn notify(&self, event: SettlementEvent);
}

/// Emits each event as a structured log line
pub struct LoggingNotifier;

#[async_trait]
impl SettlementNotifier for LoggingNotifier {
    async fn notify(&self, event: SettlementEvent) {
        info!(
            event = event.kind.as_str(),
            settlement_id = %event.settlement_id,
            merchant_id = %event.merchant_id,
            net_amount = %event.net_amount,
            currency = %event.currency,
            status = %event.status,
            "📣 settlement event"
        );
    }
}

/// Keeps events in memory; used by tests
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SettlementEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl SettlementNotifier for RecordingNotifier {
    async fn notify(&self, event: SettlementEvent) {
        self.events.lock().push(event);
    }
}
