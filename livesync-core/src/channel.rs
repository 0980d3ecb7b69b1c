//! Watch channel and notification types.
//!
//! A watch channel is a time-limited subscription on a provider resource.
//! The provider pushes change notifications to our callback address for as
//! long as the channel is alive; renewal means registering a fresh channel
//! and retiring the old one after a grace period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the provider resource a channel watches (e.g. a calendar id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSelector(pub String);

impl ResourceSelector {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An active (or retiring) watch channel as recorded in the channel store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchChannel {
    /// Our identifier, generated at registration time.
    pub id: String,
    /// Opaque provider-assigned identifier for the watched resource.
    pub resource_id: String,
    /// The selector we registered the watch for.
    pub selector: ResourceSelector,
    /// Public callback URL the provider pushes to.
    pub address: String,
    /// When the provider will stop delivering to this channel.
    pub expires_at: DateTime<Utc>,
    /// Incremental-diff cursor, updated after each successful reconciliation.
    /// `None` until the first reconciliation completes.
    pub sync_token: Option<String>,
    /// Token echoed back by the provider on each notification.
    pub verification_token: Option<String>,
    /// Set when a successor channel is confirmed; the channel is deleted
    /// once this deadline passes and in-flight notifications have drained.
    pub retire_after: Option<DateTime<Utc>>,
}

impl WatchChannel {
    pub fn is_retiring(&self) -> bool {
        self.retire_after.is_some()
    }
}

/// State of the watched resource as reported in a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Initial handshake, sent once right after channel creation.
    Sync,
    Exists,
    NotExists,
}

impl ResourceState {
    /// Parses the `X-Goog-Resource-State` header value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sync" => Some(ResourceState::Sync),
            "exists" => Some(ResourceState::Exists),
            "not_exists" => Some(ResourceState::NotExists),
            _ => None,
        }
    }
}

/// A parsed inbound push notification. Ephemeral: nothing here is persisted
/// beyond the dedup watermark.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub channel_id: String,
    pub resource_id: String,
    pub resource_state: ResourceState,
    /// Strictly increasing per channel, assigned by the provider.
    pub message_number: u64,
    pub resource_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_state_parse() {
        assert_eq!(ResourceState::parse("sync"), Some(ResourceState::Sync));
        assert_eq!(ResourceState::parse("exists"), Some(ResourceState::Exists));
        assert_eq!(
            ResourceState::parse("not_exists"),
            Some(ResourceState::NotExists)
        );
        assert_eq!(ResourceState::parse("updated"), None);
    }
}
