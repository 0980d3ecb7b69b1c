//! Per-channel dedup watermarks.
//!
//! Provider delivery is at-least-once and unordered across retries, so each
//! channel keeps the highest successfully processed message number. A
//! notification is admitted only if its number is strictly greater; replays
//! and stale deliveries are rejected as no-ops, never errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{LiveSyncError, LiveSyncResult};

pub struct DedupWatermarks {
    path: Option<PathBuf>,
    marks: Mutex<HashMap<String, u64>>,
}

impl DedupWatermarks {
    pub fn in_memory() -> Self {
        DedupWatermarks {
            path: None,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Open a watermark table backed by a snapshot file.
    pub fn open(path: &Path) -> LiveSyncResult<Self> {
        let marks = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)
                .map_err(|e| LiveSyncError::Serialization(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(DedupWatermarks {
            path: Some(path.to_path_buf()),
            marks: Mutex::new(marks),
        })
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, map: &HashMap<String, u64>) -> LiveSyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string(map)
            .map_err(|e| LiveSyncError::Serialization(e.to_string()))?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Whether a message should be processed: true if the channel has no
    /// watermark yet or the number is strictly above it. Does not advance
    /// the watermark; call `commit` after successful processing.
    pub fn admit(&self, channel_id: &str, message_number: u64) -> bool {
        match self.map().get(channel_id) {
            None => true,
            Some(&mark) => message_number > mark,
        }
    }

    /// Advances the watermark, but only forward. Concurrent deliveries can
    /// commit out of order; a lower number never regresses the mark.
    pub fn commit(&self, channel_id: &str, message_number: u64) -> LiveSyncResult<()> {
        let mut map = self.map();
        if let Some(&mark) = map.get(channel_id) {
            if message_number <= mark {
                return Ok(());
            }
        }
        map.insert(channel_id.to_string(), message_number);
        self.persist(&map)
    }

    /// Drops the watermark for a deleted channel.
    pub fn forget(&self, channel_id: &str) -> LiveSyncResult<()> {
        let mut map = self.map();
        if map.remove(channel_id).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_message_is_admitted() {
        let marks = DedupWatermarks::in_memory();
        assert!(marks.admit("ch", 1));
        assert!(marks.admit("ch", 900));
    }

    #[test]
    fn test_out_of_order_and_replay_sequence() {
        // Delivery order 5, 3, 5, 7: only 5 and 7 may be admitted.
        let marks = DedupWatermarks::in_memory();

        assert!(marks.admit("ch", 5));
        marks.commit("ch", 5).unwrap();

        assert!(!marks.admit("ch", 3));
        assert!(!marks.admit("ch", 5));

        assert!(marks.admit("ch", 7));
        marks.commit("ch", 7).unwrap();
        assert!(!marks.admit("ch", 7));
    }

    #[test]
    fn test_commit_never_regresses() {
        let marks = DedupWatermarks::in_memory();
        marks.commit("ch", 10).unwrap();
        marks.commit("ch", 4).unwrap();
        assert!(!marks.admit("ch", 10));
        assert!(marks.admit("ch", 11));
    }

    #[test]
    fn test_same_number_admitted_twice_before_commit() {
        // Two deliveries of one message can both be admitted before either
        // run commits; the double commit is harmless and afterwards the
        // number is fenced out while newer ones still pass.
        let marks = DedupWatermarks::in_memory();
        assert!(marks.admit("ch", 5));
        assert!(marks.admit("ch", 5));

        marks.commit("ch", 5).unwrap();
        marks.commit("ch", 5).unwrap();

        assert!(!marks.admit("ch", 5));
        assert!(marks.admit("ch", 6));
    }

    #[test]
    fn test_channels_are_independent() {
        let marks = DedupWatermarks::in_memory();
        marks.commit("a", 10).unwrap();
        assert!(marks.admit("b", 1));
    }

    #[test]
    fn test_forget_resets_channel() {
        let marks = DedupWatermarks::in_memory();
        marks.commit("ch", 10).unwrap();
        marks.forget("ch").unwrap();
        assert!(marks.admit("ch", 1));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermarks.json");

        let marks = DedupWatermarks::open(&path).unwrap();
        marks.commit("ch", 42).unwrap();
        drop(marks);

        let reopened = DedupWatermarks::open(&path).unwrap();
        assert!(!reopened.admit("ch", 42));
        assert!(reopened.admit("ch", 43));
    }
}
