//! Filesystem-backed local event store.
//!
//! Each event lives as one JSON file named after the provider's event id,
//! which makes upsert and delete naturally idempotent. Embedders with a
//! real database supply their own `EventStore` instead.

use std::path::PathBuf;

use async_trait::async_trait;
use livesync_core::{EventStore, LiveSyncError, LiveSyncResult};

pub struct LocalEventStore {
    dir: PathBuf,
}

impl LocalEventStore {
    pub fn new(dir: PathBuf) -> LiveSyncResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalEventStore { dir })
    }

    /// Provider event ids are used as file names. Anything outside a
    /// conservative character set is percent-encoded so `event_ids` can
    /// recover the exact id from the file name.
    fn file_name(provider_event_id: &str) -> String {
        let mut safe = String::with_capacity(provider_event_id.len());
        for byte in provider_event_id.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'@') {
                safe.push(byte as char);
            } else {
                safe.push_str(&format!("%{byte:02X}"));
            }
        }
        format!("{safe}.json")
    }

    fn id_from_file_name(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(".json")?;
        let mut bytes = Vec::with_capacity(encoded.len());
        let mut rest = encoded.bytes();
        while let Some(byte) = rest.next() {
            if byte == b'%' {
                let hi = rest.next()?;
                let lo = rest.next()?;
                let pair = [hi, lo];
                let pair = std::str::from_utf8(&pair).ok()?;
                bytes.push(u8::from_str_radix(pair, 16).ok()?);
            } else {
                bytes.push(byte);
            }
        }
        String::from_utf8(bytes).ok()
    }

    fn path_for(&self, provider_event_id: &str) -> PathBuf {
        self.dir.join(Self::file_name(provider_event_id))
    }
}

#[async_trait]
impl EventStore for LocalEventStore {
    async fn upsert(
        &self,
        provider_event_id: &str,
        data: &serde_json::Value,
    ) -> LiveSyncResult<()> {
        let contents = serde_json::to_string_pretty(data)
            .map_err(|e| LiveSyncError::Serialization(e.to_string()))?;
        let path = self.path_for(provider_event_id);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, provider_event_id: &str) -> LiveSyncResult<()> {
        match tokio::fs::remove_file(self.path_for(provider_event_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn event_ids(&self) -> LiveSyncResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = Self::id_from_file_name(name) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
