use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppResult, ReconError};
use crate::ledger::models::ReconciliationQueueItem;
use crate::ledger::{Page, PageRequest, QueueFilter, ReconStore};

/// Operator actions on the reconciliation queue. Nothing here resolves an
/// item automatically.
pub struct ResolutionDesk {
    store: Arc<dyn ReconStore>,
}

impl ResolutionDesk {
    pub fn new(store: Arc<dyn ReconStore>) -> Self {
        Self { store }
    }

    pub async fn get_item(&self, item_id: Uuid) -> AppResult<ReconciliationQueueItem> {
        self.store
            .get_queue_item(item_id)
            .await?
            .ok_or_else(|| ReconError::QueueItemNotFound(item_id).into())
    }

    pub async fn list_items(
        &self,
        filter: &QueueFilter,
        page: PageRequest,
    ) -> AppResult<Page<ReconciliationQueueItem>> {
        self.store.list_queue_items(filter, page).await
    }

    /// Attach a ledger transaction to an item without resolving it
    pub async fn link_transaction(
        &self,
        item_id: Uuid,
        transaction_id: Uuid,
        notes: Option<String>,
    ) -> AppResult<ReconciliationQueueItem> {
        let notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        match self
            .store
            .link_queue_item(item_id, transaction_id, notes)
            .await
        {
            Ok(item) => {
                info!("🔗 Queue item {} linked to transaction {}", item_id, transaction_id);
                Ok(item)
            }
            Err(e) => {
                warn!("Link of queue item {} rejected: {}", item_id, e);
                Err(e)
            }
        }
    }

    /// Resolve an item exactly once; a second call reports `AlreadyResolved`
    pub async fn mark_resolved(
        &self,
        item_id: Uuid,
        notes: &str,
    ) -> AppResult<ReconciliationQueueItem> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(ReconError::EmptyNotes.into());
        }

        match self
            .store
            .resolve_queue_item(item_id, notes.to_string(), Utc::now())
            .await
        {
            Ok(item) => {
                info!("✓ Queue item {} resolved ({})", item_id, item.match_status);
                Ok(item)
            }
            Err(e) => {
                warn!("Resolve of queue item {} rejected: {}", item_id, e);
                Err(e)
            }
        }
    }
}
