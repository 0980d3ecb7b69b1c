//! Channel renewal scheduler.
//!
//! Watch channels are time-limited, so a background loop re-registers them
//! before expiry. Renewal is a two-phase handover: register a successor
//! while the old channel keeps receiving pushes, then retire the old one
//! after a grace period. A resource therefore never has zero channels, and
//! briefly has two.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use livesync_core::{
    CalendarProvider, ChannelStore, DedupWatermarks, ResourceSelector, WatchChannel,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registrar::Registrar;

pub struct RenewalScheduler {
    store: Arc<ChannelStore>,
    registrar: Arc<Registrar>,
    provider: Arc<dyn CalendarProvider>,
    watermarks: Arc<DedupWatermarks>,
    /// Resources the daemon is configured to keep watched; any of them
    /// found without an active channel gets one registered.
    selectors: Vec<ResourceSelector>,
    interval: Duration,
    window: chrono::Duration,
    grace: chrono::Duration,
    /// Resource ids with a renewal in progress; renewal is single-flight
    /// per resource.
    renewing: Mutex<HashSet<String>>,
}

impl RenewalScheduler {
    pub fn new(
        store: Arc<ChannelStore>,
        registrar: Arc<Registrar>,
        provider: Arc<dyn CalendarProvider>,
        watermarks: Arc<DedupWatermarks>,
        selectors: Vec<ResourceSelector>,
        interval: Duration,
        window: chrono::Duration,
        grace: chrono::Duration,
    ) -> Self {
        RenewalScheduler {
            store,
            registrar,
            provider,
            watermarks,
            selectors,
            interval,
            window,
            grace,
            renewing: Mutex::new(HashSet::new()),
        }
    }

    fn renewing(&self) -> MutexGuard<'_, HashSet<String>> {
        self.renewing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs until cancelled. Cancellation lets in-flight renewals finish so
    /// shutdown never leaves a resource without a confirmed channel.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut renewals: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(&mut renewals),
            }
            // Reap finished renewals between ticks.
            while renewals.try_join_next().is_some() {}
        }

        info!("renewal scheduler stopping, draining in-flight renewals");
        while renewals.join_next().await.is_some() {}
    }

    /// One scheduler pass: drop channels past their grace deadline, then
    /// start renewals for channels expiring inside the window.
    pub fn tick(self: &Arc<Self>, renewals: &mut JoinSet<()>) {
        let now = Utc::now();

        match self.store.sweep_retired(now) {
            Ok(removed) => {
                for channel in removed {
                    renewals.spawn(self.clone().retire(channel));
                }
            }
            Err(err) => warn!("retired-channel sweep failed: {err}"),
        }

        for channel in self.store.list_expiring_before(now + self.window) {
            if channel.is_retiring() {
                continue;
            }
            // A successor from an earlier handover that never finished (say,
            // a crash between register and retire) means no new registration
            // is needed; just complete the retirement.
            if self.store.has_successor(&channel) {
                info!(channel = %channel.id, "successor already active, retiring old channel");
                if let Err(err) = self.store.mark_retiring(&channel.id, now + self.grace) {
                    warn!(channel = %channel.id, "could not mark channel retiring: {err}");
                }
                continue;
            }
            let resource_id = channel.resource_id.clone();
            if !self.renewing().insert(resource_id.clone()) {
                debug!(resource = %resource_id, "renewal already in flight, skipping");
                continue;
            }
            renewals.spawn(self.clone().renew(channel));
        }

        // Configured resources without a channel at all (first start, or a
        // watch that could never be established) get one registered here.
        for selector in self.selectors.clone() {
            if self.store.has_active_for(&selector) {
                continue;
            }
            let key = format!("selector:{}", selector.as_str());
            if !self.renewing().insert(key) {
                continue;
            }
            renewals.spawn(self.clone().establish(selector));
        }
    }

    async fn establish(self: Arc<Self>, selector: ResourceSelector) {
        let result = self.registrar.register(&selector).await;
        self.renewing()
            .remove(&format!("selector:{}", selector.as_str()));
        if let Err(err) = result {
            error!(
                resource = selector.as_str(),
                "could not establish watch, will retry next tick: {err}"
            );
        }
    }

    /// Registers a successor channel, carries the sync cursor over, and
    /// marks the old channel for retirement. On failure the old channel is
    /// left untouched; the next tick tries again. The resource stays marked
    /// as renewing until the old channel is retiring, so a tick landing
    /// mid-handover cannot start a second renewal.
    async fn renew(self: Arc<Self>, old: WatchChannel) {
        self.handover(&old).await;
        self.renewing().remove(&old.resource_id);
    }

    async fn handover(&self, old: &WatchChannel) {
        let new = match self.registrar.register(&old.selector).await {
            Ok(new) => new,
            Err(err) => {
                error!(
                    channel = %old.id,
                    resource = %old.resource_id,
                    "renewal failed, keeping old channel: {err}"
                );
                return;
            }
        };

        // The incremental cursor survives the handover; the successor picks
        // up diffs exactly where the old channel left off.
        if let Some(token) = &old.sync_token {
            if let Err(err) = self.store.update_sync_token(&new.id, token) {
                warn!(channel = %new.id, "could not carry sync token over: {err}");
            }
        }

        let retire_after = Utc::now() + self.grace;
        if let Err(err) = self.store.mark_retiring(&old.id, retire_after) {
            warn!(channel = %old.id, "could not mark channel retiring: {err}");
            return;
        }
        info!(
            old_channel = %old.id,
            new_channel = %new.id,
            resource = %old.resource_id,
            %retire_after,
            "channel renewed"
        );
    }

    /// Final teardown of a swept channel: best-effort provider stop plus
    /// watermark cleanup.
    async fn retire(self: Arc<Self>, channel: WatchChannel) {
        if let Err(err) = self
            .provider
            .stop_watch(&channel.id, &channel.resource_id)
            .await
        {
            warn!(channel = %channel.id, "stop_watch failed: {err}");
        }
        if let Err(err) = self.watermarks.forget(&channel.id) {
            warn!(channel = %channel.id, "could not drop watermark: {err}");
        }
        info!(channel = %channel.id, "retired channel deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use livesync_core::{
        ChangeSet, ProviderError, ResourceSelector, WatchRegistration,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeProvider {
        register_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        fail_register: bool,
        gate: Option<Notify>,
    }

    impl Default for FakeProvider {
        fn default() -> Self {
            FakeProvider {
                register_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
                fail_register: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl CalendarProvider for FakeProvider {
        async fn register_watch(
            &self,
            selector: &ResourceSelector,
            _channel_id: &str,
            _callback_address: &str,
            _verification_token: Option<&str>,
        ) -> Result<WatchRegistration, ProviderError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_register {
                return Err(ProviderError::Transient("provider down".into()));
            }
            Ok(WatchRegistration {
                resource_id: format!("res-{}", selector.as_str()),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            })
        }

        async fn stop_watch(
            &self,
            _channel_id: &str,
            _resource_id: &str,
        ) -> Result<(), ProviderError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_changes(
            &self,
            _resource_id: &str,
            _sync_token: Option<&str>,
        ) -> Result<ChangeSet, ProviderError> {
            unimplemented!("not used in scheduler tests")
        }
    }

    fn scheduler(
        provider: Arc<FakeProvider>,
        grace: chrono::Duration,
    ) -> (Arc<RenewalScheduler>, Arc<ChannelStore>, Arc<DedupWatermarks>) {
        scheduler_with_selectors(provider, grace, vec![])
    }

    fn scheduler_with_selectors(
        provider: Arc<FakeProvider>,
        grace: chrono::Duration,
        selectors: Vec<ResourceSelector>,
    ) -> (Arc<RenewalScheduler>, Arc<ChannelStore>, Arc<DedupWatermarks>) {
        let store = Arc::new(ChannelStore::in_memory());
        let watermarks = Arc::new(DedupWatermarks::in_memory());
        let registrar = Arc::new(Registrar::new(
            provider.clone(),
            store.clone(),
            "https://example.com/webhook".to_string(),
            RetryPolicy::new(&RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                max_attempts: 1,
            }),
        ));
        let scheduler = Arc::new(RenewalScheduler::new(
            store.clone(),
            registrar,
            provider,
            watermarks.clone(),
            selectors,
            Duration::from_millis(10),
            ChronoDuration::minutes(10),
            grace,
        ));
        (scheduler, store, watermarks)
    }

    fn seed_channel(store: &ChannelStore, id: &str, expires_in: ChronoDuration) {
        store
            .create(WatchChannel {
                id: id.to_string(),
                resource_id: "res-primary".to_string(),
                selector: ResourceSelector("primary".to_string()),
                address: "https://example.com/webhook".to_string(),
                expires_at: Utc::now() + expires_in,
                sync_token: Some("tok-old".to_string()),
                verification_token: None,
                retire_after: None,
            })
            .unwrap();
    }

    async fn drain(renewals: &mut JoinSet<()>) {
        while renewals.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_expiring_channel_gets_successor_old_kept_through_grace() {
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, store, _marks) = scheduler(provider.clone(), ChronoDuration::minutes(2));
        seed_channel(&store, "old", ChronoDuration::minutes(5));

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;

        // Old channel still queryable, now retiring; successor is active.
        let old = store.get("old").unwrap();
        assert!(old.is_retiring());
        assert!(store.has_active_for(&ResourceSelector("primary".into())));
        assert_eq!(provider.register_calls.load(Ordering::SeqCst), 1);

        // Successor inherited the sync cursor.
        let successor = store
            .list_expiring_before(Utc::now() + ChronoDuration::hours(2))
            .into_iter()
            .find(|c| c.id != "old")
            .unwrap();
        assert_eq!(successor.sync_token.as_deref(), Some("tok-old"));
    }

    #[tokio::test]
    async fn test_retired_channel_swept_after_grace() {
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, store, marks) =
            scheduler(provider.clone(), ChronoDuration::milliseconds(1));
        seed_channel(&store, "old", ChronoDuration::minutes(5));
        marks.commit("old", 9).unwrap();

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;
        assert!(store.get("old").is_ok());

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;

        assert!(store.get("old").is_err());
        assert_eq!(provider.stop_calls.load(Ordering::SeqCst), 1);
        assert!(marks.admit("old", 1));
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_old_channel_active() {
        let provider = Arc::new(FakeProvider {
            fail_register: true,
            ..FakeProvider::default()
        });
        let (scheduler, store, _marks) = scheduler(provider.clone(), ChronoDuration::minutes(2));
        seed_channel(&store, "old", ChronoDuration::minutes(5));

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;

        let old = store.get("old").unwrap();
        assert!(!old.is_retiring());
        assert!(store.has_active_for(&ResourceSelector("primary".into())));

        // Next tick tries again rather than giving up.
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;
        assert_eq!(provider.register_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_renewal_is_single_flight_per_resource() {
        let mut provider = FakeProvider::default();
        provider.gate = Some(Notify::new());
        let provider = Arc::new(provider);
        let (scheduler, store, _marks) = scheduler(provider.clone(), ChronoDuration::minutes(2));
        seed_channel(&store, "old", ChronoDuration::minutes(5));

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        // Second tick while the first renewal is parked on the gate.
        scheduler.tick(&mut renewals);

        provider.gate.as_ref().unwrap().notify_one();
        drain(&mut renewals).await;

        assert_eq!(provider.register_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_existing_successor_blocks_second_renewal() {
        // State left by an interrupted handover: successor registered and
        // active, old channel still not marked retiring.
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, store, _marks) = scheduler(provider.clone(), ChronoDuration::minutes(2));
        seed_channel(&store, "old", ChronoDuration::minutes(5));
        store
            .create(WatchChannel {
                id: "new".to_string(),
                resource_id: "res-primary".to_string(),
                selector: ResourceSelector("primary".to_string()),
                address: "https://example.com/webhook".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
                sync_token: Some("tok-old".to_string()),
                verification_token: None,
                retire_after: None,
            })
            .unwrap();

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;

        // The handover is completed in place, without a third channel.
        assert_eq!(provider.register_calls.load(Ordering::SeqCst), 0);
        assert!(store.get("old").unwrap().is_retiring());
        assert!(!store.get("new").unwrap().is_retiring());
    }

    #[tokio::test]
    async fn test_renew_releases_resource_only_once_old_is_retiring() {
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, store, _marks) = scheduler(provider.clone(), ChronoDuration::minutes(2));
        seed_channel(&store, "old", ChronoDuration::minutes(5));

        assert!(scheduler.renewing().insert("res-primary".to_string()));
        let old = store.get("old").unwrap();
        // The handover itself does not release the guard; only the renew
        // wrapper does, once the old channel is already retiring.
        scheduler.handover(&old).await;
        assert!(scheduler.renewing().contains("res-primary"));
        assert!(store.get("old").unwrap().is_retiring());

        scheduler.renewing().remove("res-primary");
        seed_channel(&store, "other", ChronoDuration::minutes(5));
        assert!(scheduler.renewing().insert("res-primary".to_string()));
        scheduler.clone().renew(store.get("other").unwrap()).await;
        assert!(store.get("other").unwrap().is_retiring());
        assert!(!scheduler.renewing().contains("res-primary"));
    }

    #[tokio::test]
    async fn test_unwatched_selector_gets_channel_established() {
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, store, _marks) = scheduler_with_selectors(
            provider.clone(),
            ChronoDuration::minutes(2),
            vec![ResourceSelector("primary".to_string())],
        );

        let mut renewals = JoinSet::new();
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;

        assert!(store.has_active_for(&ResourceSelector("primary".into())));

        // A second tick leaves the established channel alone.
        scheduler.tick(&mut renewals);
        drain(&mut renewals).await;
        assert_eq!(provider.register_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let provider = Arc::new(FakeProvider::default());
        let (scheduler, _store, _marks) = scheduler(provider, ChronoDuration::minutes(2));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
