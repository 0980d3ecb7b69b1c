//! Durable channel store.
//!
//! Holds the active watch channels in memory behind a mutex and snapshots
//! them to a JSON file after every mutation (atomic write via temp file +
//! rename), so channels survive restarts without re-registering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::channel::{ResourceSelector, WatchChannel};
use crate::error::{LiveSyncError, LiveSyncResult};

pub struct ChannelStore {
    path: Option<PathBuf>,
    channels: Mutex<HashMap<String, WatchChannel>>,
}

impl ChannelStore {
    /// Store without persistence, for tests and embedding.
    pub fn in_memory() -> Self {
        ChannelStore {
            path: None,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store backed by a snapshot file, loading it if present.
    pub fn open(path: &Path) -> LiveSyncResult<Self> {
        let channels = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)
                .map_err(|e| LiveSyncError::Serialization(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(ChannelStore {
            path: Some(path.to_path_buf()),
            channels: Mutex::new(channels),
        })
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, WatchChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot to disk (atomic write via temp file + rename). Called with
    /// the lock held so snapshots observe a consistent map.
    fn persist(&self, map: &HashMap<String, WatchChannel>) -> LiveSyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(map)
            .map_err(|e| LiveSyncError::Serialization(e.to_string()))?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn create(&self, channel: WatchChannel) -> LiveSyncResult<()> {
        let mut map = self.map();
        if map.contains_key(&channel.id) {
            return Err(LiveSyncError::DuplicateChannel(channel.id));
        }
        map.insert(channel.id.clone(), channel);
        self.persist(&map)
    }

    pub fn get(&self, id: &str) -> LiveSyncResult<WatchChannel> {
        self.map()
            .get(id)
            .cloned()
            .ok_or_else(|| LiveSyncError::ChannelNotFound(id.to_string()))
    }

    /// All channels with `expires_at` before the threshold, in no particular
    /// order. Includes retiring channels; callers filter as needed.
    pub fn list_expiring_before(&self, threshold: DateTime<Utc>) -> Vec<WatchChannel> {
        self.map()
            .values()
            .filter(|c| c.expires_at < threshold)
            .cloned()
            .collect()
    }

    /// Idempotent: deleting an absent channel is not an error.
    pub fn delete(&self, id: &str) -> LiveSyncResult<()> {
        let mut map = self.map();
        if map.remove(id).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }

    pub fn update_sync_token(&self, id: &str, token: &str) -> LiveSyncResult<()> {
        let mut map = self.map();
        let channel = map
            .get_mut(id)
            .ok_or_else(|| LiveSyncError::ChannelNotFound(id.to_string()))?;
        channel.sync_token = Some(token.to_string());
        self.persist(&map)
    }

    pub fn update_expiry(&self, id: &str, new_expiry: DateTime<Utc>) -> LiveSyncResult<()> {
        let mut map = self.map();
        let channel = map
            .get_mut(id)
            .ok_or_else(|| LiveSyncError::ChannelNotFound(id.to_string()))?;
        channel.expires_at = new_expiry;
        self.persist(&map)
    }

    /// Marks a superseded channel for deletion once the grace deadline
    /// passes, leaving it valid for in-flight notifications until then.
    pub fn mark_retiring(&self, id: &str, retire_after: DateTime<Utc>) -> LiveSyncResult<()> {
        let mut map = self.map();
        let channel = map
            .get_mut(id)
            .ok_or_else(|| LiveSyncError::ChannelNotFound(id.to_string()))?;
        channel.retire_after = Some(retire_after);
        self.persist(&map)
    }

    /// Removes and returns channels whose grace deadline has passed.
    pub fn sweep_retired(&self, now: DateTime<Utc>) -> LiveSyncResult<Vec<WatchChannel>> {
        let mut map = self.map();
        let expired: Vec<String> = map
            .values()
            .filter(|c| c.retire_after.is_some_and(|t| t < now))
            .map(|c| c.id.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(channel) = map.remove(id) {
                removed.push(channel);
            }
        }
        if !removed.is_empty() {
            self.persist(&map)?;
        }
        Ok(removed)
    }

    /// Whether a non-retiring channel exists for the selector.
    pub fn has_active_for(&self, selector: &ResourceSelector) -> bool {
        self.map()
            .values()
            .any(|c| &c.selector == selector && !c.is_retiring())
    }

    /// True when another active channel for the same resource selector
    /// outlives this one, i.e. a handover already produced a successor.
    pub fn has_successor(&self, channel: &WatchChannel) -> bool {
        self.map().values().any(|c| {
            c.id != channel.id
                && c.selector == channel.selector
                && !c.is_retiring()
                && c.expires_at > channel.expires_at
        })
    }
}
