//! Channel registration against the provider.

use std::sync::Arc;

use livesync_core::{
    CalendarProvider, ChannelStore, LiveSyncError, LiveSyncResult, ProviderError,
    ResourceSelector, WatchChannel,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Creates watch channels via the provider and records them in the channel
/// store. Transient provider failures are retried with bounded backoff;
/// permanent rejections fail immediately.
pub struct Registrar {
    provider: Arc<dyn CalendarProvider>,
    store: Arc<ChannelStore>,
    callback_address: String,
    retry: RetryPolicy,
}

impl Registrar {
    pub fn new(
        provider: Arc<dyn CalendarProvider>,
        store: Arc<ChannelStore>,
        callback_address: String,
        retry: RetryPolicy,
    ) -> Self {
        Registrar {
            provider,
            store,
            callback_address,
            retry,
        }
    }

    /// Registers a watch on the resource and persists the resulting channel.
    ///
    /// Every successful call creates one provider-side subscription; callers
    /// renewing a watch must retire the superseded channel themselves.
    pub async fn register(&self, selector: &ResourceSelector) -> LiveSyncResult<WatchChannel> {
        // Same id across retries: the provider either never saw the failed
        // attempt or treats the repeat as the same channel.
        let channel_id = Uuid::new_v4().to_string();
        let verification_token = Uuid::new_v4().to_string();

        let mut attempt = 1;
        let registration = loop {
            let result = self
                .provider
                .register_watch(
                    selector,
                    &channel_id,
                    &self.callback_address,
                    Some(&verification_token),
                )
                .await;

            match result {
                Ok(registration) => break registration,
                Err(ProviderError::Transient(msg)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        resource = selector.as_str(),
                        attempt,
                        ?delay,
                        "transient registration failure, retrying: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ProviderError::Transient(msg)) => {
                    return Err(LiveSyncError::Provider(format!(
                        "registration for '{}' failed after {} attempts: {msg}",
                        selector.as_str(),
                        attempt
                    )));
                }
                Err(err) => {
                    return Err(LiveSyncError::Registration(err.to_string()));
                }
            }
        };

        let channel = WatchChannel {
            id: channel_id,
            resource_id: registration.resource_id,
            selector: selector.clone(),
            address: self.callback_address.clone(),
            expires_at: registration.expires_at,
            sync_token: None,
            verification_token: Some(verification_token),
            retire_after: None,
        };

        info!(
            channel = %channel.id,
            resource = selector.as_str(),
            expires_at = %channel.expires_at,
            "registered watch channel"
        );

        self.store.create(channel.clone())?;
        Ok(channel)
    }
}
