//! Local event store seam.

use async_trait::async_trait;

use crate::error::LiveSyncResult;

/// The local store reconciliation writes into. Both mutations are keyed on
/// the provider's own event id, which makes re-applying a change record a
/// no-op rather than a duplicate.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts or replaces the event. Idempotent per (id, data).
    async fn upsert(&self, provider_event_id: &str, data: &serde_json::Value)
        -> LiveSyncResult<()>;

    /// Removes the event; absent ids are a no-op.
    async fn delete(&self, provider_event_id: &str) -> LiveSyncResult<()>;

    /// All provider event ids currently stored. Used by full resync to drop
    /// events the provider no longer returns.
    async fn event_ids(&self) -> LiveSyncResult<Vec<String>>;
}
