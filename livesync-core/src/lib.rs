//! Core types for the livesync ecosystem.
//!
//! This crate provides what the daemon and any embedder share:
//! - `WatchChannel` and notification types
//! - the `ChannelStore` and dedup watermark table
//! - the `CalendarProvider` and `EventStore` collaborator traits

pub mod channel;
pub mod error;
pub mod event_store;
pub mod provider;
pub mod store;
pub mod watermark;

pub use channel::{NotificationEvent, ResourceSelector, ResourceState, WatchChannel};
pub use error::{LiveSyncError, LiveSyncResult};
pub use event_store::EventStore;
pub use provider::{CalendarProvider, ChangeRecord, ChangeSet, ProviderError, WatchRegistration};
pub use store::ChannelStore;
pub use watermark::DedupWatermarks;
