//! Reconciliation pipeline.
//!
//! Notifications only say "something changed"; the actual diff comes from
//! the provider's incremental listing keyed on the channel's sync token.
//! Reconciliation for a channel is single-flight: triggers that arrive while
//! a run is in progress coalesce into one follow-up run, since every run
//! fetches everything since the last token anyway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use livesync_core::{
    CalendarProvider, ChangeSet, ChannelStore, DedupWatermarks, EventStore, ProviderError,
};
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

/// Per-channel in-flight bookkeeping: key present means a run is active,
/// the value holds the latest coalesced trigger waiting for it to finish.
type Inflight = HashMap<String, Option<u64>>;

pub struct Reconciler {
    provider: Arc<dyn CalendarProvider>,
    store: Arc<ChannelStore>,
    events: Arc<dyn EventStore>,
    watermarks: Arc<DedupWatermarks>,
    retry: RetryPolicy,
    inflight: Mutex<Inflight>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn CalendarProvider>,
        store: Arc<ChannelStore>,
        events: Arc<dyn EventStore>,
        watermarks: Arc<DedupWatermarks>,
        retry: RetryPolicy,
    ) -> Self {
        Reconciler {
            provider,
            store,
            events,
            watermarks,
            retry,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands an admitted notification to the pipeline and returns
    /// immediately. If the channel is already reconciling, the trigger is
    /// coalesced instead of starting a second run.
    pub fn trigger(self: &Arc<Self>, channel_id: &str, message_number: u64) {
        {
            let mut inflight = self.inflight();
            if let Some(pending) = inflight.get_mut(channel_id) {
                let latest = pending.map_or(message_number, |n| n.max(message_number));
                *pending = Some(latest);
                debug!(channel = channel_id, message_number, "coalesced trigger");
                return;
            }
            inflight.insert(channel_id.to_string(), None);
        }

        let this = self.clone();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            this.drive(channel_id, message_number).await;
        });
    }

    /// Runs reconciliations for a channel until no trigger is pending.
    async fn drive(self: Arc<Self>, channel_id: String, mut message_number: u64) {
        loop {
            match self.run_with_retry(&channel_id).await {
                Ok(()) => {
                    if let Err(err) = self.watermarks.commit(&channel_id, message_number) {
                        warn!(channel = %channel_id, "failed to persist watermark: {err}");
                    }
                }
                Err(err) => {
                    // Watermark stays put: the next admitted message will
                    // re-trigger a diff that covers this window.
                    error!(
                        channel = %channel_id,
                        "reconciliation failed, giving up until next notification: {err}"
                    );
                }
            }

            let pending = {
                let mut inflight = self.inflight();
                let pending = inflight.get_mut(&channel_id).and_then(Option::take);
                if pending.is_none() {
                    inflight.remove(&channel_id);
                }
                pending
            };
            match pending {
                Some(number) => message_number = number,
                None => return,
            }
        }
    }

    async fn run_with_retry(&self, channel_id: &str) -> Result<(), ProviderError> {
        let mut attempt = 1;
        loop {
            match self.reconcile(channel_id).await {
                Ok(()) => return Ok(()),
                Err(ProviderError::Transient(msg)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        channel = channel_id,
                        attempt,
                        ?delay,
                        "transient reconciliation failure, retrying: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One reconciliation pass: incremental diff with the freshest stored
    /// token, falling back to a full resync when the token has gone stale.
    pub async fn reconcile(&self, channel_id: &str) -> Result<(), ProviderError> {
        // Re-read the channel each pass: the token is single-use and a
        // coalesced run must not reuse the one its predecessor consumed.
        let channel = match self.store.get(channel_id) {
            Ok(channel) => channel,
            Err(_) => {
                // Deleted mid-flight (retirement race); nothing to do.
                debug!(channel = channel_id, "channel gone, skipping reconciliation");
                return Ok(());
            }
        };

        let changes = match self
            .provider
            .list_changes(&channel.resource_id, channel.sync_token.as_deref())
            .await
        {
            Ok(changes) => changes,
            Err(ProviderError::TokenInvalid) => {
                info!(channel = channel_id, "sync token stale, full resync");
                return self.full_resync(channel_id, &channel.resource_id).await;
            }
            Err(err) => return Err(err),
        };

        self.apply(&changes).await?;
        self.store_token(channel_id, &changes.next_sync_token);
        debug!(
            channel = channel_id,
            records = changes.records.len(),
            "incremental reconciliation applied"
        );
        Ok(())
    }

    /// Applies a diff: each record's own deletion marker decides upsert vs
    /// delete, keyed on the provider event id so replays are no-ops.
    async fn apply(&self, changes: &ChangeSet) -> Result<(), ProviderError> {
        for record in &changes.records {
            let result = if record.deleted {
                self.events.delete(&record.event_id).await
            } else {
                self.events.upsert(&record.event_id, &record.data).await
            };
            result.map_err(|e| ProviderError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// Recovery path for a stale token: fetch the complete current state,
    /// upsert everything present and delete whatever the provider no longer
    /// returns. Idempotent, so a failed resync can simply run again.
    async fn full_resync(&self, channel_id: &str, resource_id: &str) -> Result<(), ProviderError> {
        let listing = self.provider.list_changes(resource_id, None).await?;

        let mut present: Vec<&str> = Vec::with_capacity(listing.records.len());
        for record in &listing.records {
            if record.deleted {
                self.events
                    .delete(&record.event_id)
                    .await
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
            } else {
                self.events
                    .upsert(&record.event_id, &record.data)
                    .await
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
                present.push(&record.event_id);
            }
        }

        let local_ids = self
            .events
            .event_ids()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        for id in local_ids {
            if !present.iter().any(|p| *p == id) {
                self.events
                    .delete(&id)
                    .await
                    .map_err(|e| ProviderError::Transient(e.to_string()))?;
            }
        }

        self.store_token(channel_id, &listing.next_sync_token);
        info!(channel = channel_id, "full resync complete");
        Ok(())
    }

    fn store_token(&self, channel_id: &str, token: &str) {
        // A channel swept during the run is the only miss here; the token
        // dies with it.
        if let Err(err) = self.store.update_sync_token(channel_id, token) {
            warn!(channel = channel_id, "could not store sync token: {err}");
        }
    }

    #[cfg(test)]
    fn is_idle(&self, channel_id: &str) -> bool {
        !self.inflight().contains_key(channel_id)
    }
}
