//! Calendar provider seam.
//!
//! The daemon talks to the provider through this trait: register a watch,
//! stop a watch, and pull incremental changes with a sync token. Any client
//! implementing it (HTTP, fake, subprocess) can back the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::channel::ResourceSelector;

/// Provider failures, classified for retry policy.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Network-level or 5xx-equivalent failure; safe to retry with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Rejected request (bad address, invalid configuration); retrying the
    /// same call cannot succeed.
    #[error("permanent provider rejection: {0}")]
    Permanent(String),

    /// The sync token is stale; the caller must fall back to a full listing.
    #[error("sync token no longer valid")]
    TokenInvalid,
}

/// Result of a successful watch registration.
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One changed resource in an incremental diff. The `deleted` marker on the
/// record decides upsert vs delete; the push notification's resource state
/// never does.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub event_id: String,
    pub deleted: bool,
    pub data: serde_json::Value,
}

/// A page-complete diff plus the cursor for the next incremental call.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub records: Vec<ChangeRecord>,
    pub next_sync_token: String,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Registers a watch on the selected resource. Each successful call
    /// creates one provider-side subscription, so callers renew by
    /// registering a successor and retiring the old channel, never by
    /// re-registering blindly.
    async fn register_watch(
        &self,
        selector: &ResourceSelector,
        channel_id: &str,
        callback_address: &str,
        verification_token: Option<&str>,
    ) -> Result<WatchRegistration, ProviderError>;

    /// Tells the provider to stop delivering to a channel.
    async fn stop_watch(&self, channel_id: &str, resource_id: &str) -> Result<(), ProviderError>;

    /// Lists changes since the token, or everything when `sync_token` is
    /// `None` (full resync). Fails with `TokenInvalid` when the cursor is
    /// stale.
    async fn list_changes(
        &self,
        resource_id: &str,
        sync_token: Option<&str>,
    ) -> Result<ChangeSet, ProviderError>;
}
