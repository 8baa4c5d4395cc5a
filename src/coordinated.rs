//! In-process tier kept coherent across processes
//!
//! Wraps a [`LocalTier`]. Every local mutation is applied first and then
//! announced on the invalidation bus. Messages from other processes evict
//! local entries rather than adopting foreign values: a `set` only evicts
//! when the local copy differs from what the publisher stored, a `remove`
//! always evicts and a `flush` clears the whole tier. Messages from this
//! process are ignored. When the bus reports lost messages the whole tier is
//! cleared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::invalidation::{
    BusEvent, Channels, InvalidationBus, InvalidationMessage, InvalidationOp, Origin,
    Subscription, fingerprint,
};
use crate::local::LocalTier;
use crate::task::spawn_detached;
use crate::tier::{Blob, Locality, Tier};
use crate::CacheError;

/// Settings for a [`CoordinatedTier`].
#[derive(Debug, Clone)]
pub struct CoordinationSettings {
    pub app_name: String,
    pub domain: String,
    pub origin: Origin,
    /// Clear the whole tier this often, bounding staleness from lost messages.
    pub full_clear_interval: Option<Duration>,
}

impl CoordinationSettings {
    pub fn from_config(config: &CacheConfig, origin: Origin) -> Self {
        Self {
            app_name: config.app_name.clone(),
            domain: config.domain.clone(),
            origin,
            full_clear_interval: config.full_clear_interval,
        }
    }
}

struct Shared {
    local: LocalTier,
    bus: Arc<dyn InvalidationBus>,
    origin: Origin,
    channels: Channels,
}

pub struct CoordinatedTier {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatedTier {
    /// Subscribe to the domain's channels and start listening.
    ///
    /// Fails when the subscription cannot be established.
    pub async fn start(
        local: LocalTier,
        bus: Arc<dyn InvalidationBus>,
        settings: CoordinationSettings,
    ) -> Result<Self, CacheError> {
        let channels = Channels::new(&settings.app_name, &settings.domain);
        let subscription = bus.subscribe(&channels.pattern()).await?;

        let shared = Arc::new(Shared {
            local,
            bus,
            origin: settings.origin,
            channels,
        });

        let mut tasks = vec![tokio::spawn(listen(Arc::clone(&shared), subscription))];
        if let Some(period) = settings.full_clear_interval {
            tasks.push(tokio::spawn(clear_periodically(Arc::clone(&shared), period)));
        }

        Ok(Self { shared, tasks })
    }

    pub fn local(&self) -> &LocalTier {
        &self.shared.local
    }

    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    fn announce(&self, op: InvalidationOp, message: InvalidationMessage) {
        let bus = Arc::clone(&self.shared.bus);
        let channel = self.shared.channels.channel(op);
        spawn_detached("cache-invalidation-publish", async move {
            let payload = serde_json::to_string(&message)?;
            bus.publish(&channel, payload).await
        });
    }
}

impl Drop for CoordinatedTier {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Shared {
    fn apply(&self, channel: &str, payload: &str) {
        let Some(op) = self.channels.op_of(channel) else {
            debug!(channel, "Ignoring message on unrelated channel");
            return;
        };

        let message: InvalidationMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel, error = %e, "Unable to parse invalidation payload");
                return;
            }
        };

        if message.origin == self.origin {
            debug!(channel, "Ignoring own invalidation echo");
            return;
        }

        match op {
            InvalidationOp::Set => {
                if let Some(key) = &message.key {
                    self.evict_if_changed(key, message.fingerprint.as_deref());
                }
            }
            InvalidationOp::Mset => {
                let fingerprints = message.fingerprints.as_ref();
                for key in message.affected_keys() {
                    let remote = fingerprints.and_then(|fps| fps.get(key)).map(String::as_str);
                    self.evict_if_changed(key, remote);
                }
            }
            InvalidationOp::Remove => {
                for key in message.affected_keys() {
                    self.local.remove(key);
                    debug!(key, origin = %message.origin, "Evicted after remote remove");
                }
            }
            InvalidationOp::Flush => {
                self.local.clear();
                debug!(origin = %message.origin, "Cleared after remote flush");
            }
        }
    }

    fn evict_if_changed(&self, key: &str, remote: Option<&str>) {
        let Some(local) = self.local.get(key) else {
            return;
        };
        if remote.is_some_and(|fp| fp == fingerprint(&local)) {
            debug!(key, "Local copy matches remote write; keeping");
            return;
        }
        self.local.remove(key);
        debug!(key, "Evicted after remote write");
    }
}

async fn listen(shared: Arc<Shared>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            BusEvent::Message(msg) => shared.apply(&msg.channel, &msg.payload),
            BusEvent::Gap => {
                shared.local.clear();
                warn!(origin = %shared.origin, "Invalidations were lost; cleared local tier");
            }
        }
    }
    warn!(origin = %shared.origin, "Invalidation subscription ended; local tier is no longer coordinated");
}

async fn clear_periodically(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.local.clear();
        debug!(period_ms = period.as_millis() as u64, "Periodic full clear of coordinated tier");
    }
}

#[async_trait]
impl Tier for CoordinatedTier {
    fn name(&self) -> &'static str {
        "coordinated"
    }

    fn locality(&self) -> Locality {
        Locality::InProcess
    }

    async fn get(&self, key: &str) -> Option<Blob> {
        self.shared.local.get(key)
    }

    async fn set(&self, key: &str, value: Blob, _expire: Option<Duration>) {
        let fp = fingerprint(&value);
        self.shared.local.set(key, value);
        self.announce(
            InvalidationOp::Set,
            InvalidationMessage::set(self.shared.origin.clone(), key, fp),
        );
    }

    async fn remove(&self, key: &str) {
        self.shared.local.remove(key);
        self.announce(
            InvalidationOp::Remove,
            InvalidationMessage::remove(self.shared.origin.clone(), key),
        );
    }

    async fn mget(&self, keys: &[String]) -> HashMap<String, Blob> {
        self.shared.local.mget(keys)
    }

    async fn mset(&self, entries: Vec<(String, Blob)>, _expire: Option<Duration>) {
        let fingerprints: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.clone(), fingerprint(v)))
            .collect();
        self.shared.local.mset(entries);
        self.announce(
            InvalidationOp::Mset,
            InvalidationMessage::mset(self.shared.origin.clone(), fingerprints),
        );
    }

    async fn clear(&self) {
        self.shared.local.clear();
        self.announce(
            InvalidationOp::Flush,
            InvalidationMessage::flush(self.shared.origin.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::MemoryBus;

    fn blob(s: &str) -> Blob {
        Blob::from(s.as_bytes())
    }

    fn settings(pid: u32) -> CoordinationSettings {
        CoordinationSettings {
            app_name: "test".to_owned(),
            domain: "global_runtime".to_owned(),
            origin: Origin::new("host", pid),
            full_clear_interval: None,
        }
    }

    async fn process(bus: &MemoryBus, pid: u32) -> CoordinatedTier {
        CoordinatedTier::start(LocalTier::new(100), Arc::new(bus.clone()), settings(pid))
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_foreign_set_evicts_differing_copy() {
        let bus = MemoryBus::new();
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;

        b.local().set("k", blob("v0"));
        Tier::set(&a, "k", blob("v1"), None).await;

        assert!(eventually(|| b.local().get("k").is_none()).await);
        assert_eq!(a.local().get("k").as_deref(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn test_foreign_set_keeps_identical_copy() {
        let bus = MemoryBus::new();
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;
        let witness = process(&bus, 3).await;

        b.local().set("k", blob("same"));
        witness.local().set("k", blob("other"));
        Tier::set(&a, "k", blob("same"), None).await;

        // once the witness has processed the message, so has b
        assert!(eventually(|| witness.local().get("k").is_none()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.local().get("k").as_deref(), Some(&b"same"[..]));
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let bus = MemoryBus::new();
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;

        b.local().set("k", blob("old"));
        Tier::set(&a, "k", blob("new"), None).await;

        assert!(eventually(|| b.local().get("k").is_none()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.local().get("k").as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_remove_and_flush_propagate() {
        let bus = MemoryBus::new();
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;

        b.local().set("gone", blob("x"));
        b.local().set("other", blob("y"));

        Tier::remove(&a, "gone").await;
        assert!(eventually(|| b.local().get("gone").is_none()).await);
        assert!(b.local().get("other").is_some());

        Tier::clear(&a).await;
        assert!(eventually(|| b.local().is_empty()).await);
    }

    #[tokio::test]
    async fn test_mset_compares_per_key() {
        let bus = MemoryBus::new();
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;

        b.local().set("same", blob("1"));
        b.local().set("changed", blob("old"));

        Tier::mset(
            &a,
            vec![
                ("same".to_owned(), blob("1")),
                ("changed".to_owned(), blob("new")),
            ],
            None,
        )
        .await;

        assert!(eventually(|| b.local().get("changed").is_none()).await);
        assert!(b.local().get("same").is_some());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_ignored() {
        let bus = MemoryBus::new();
        let b = process(&bus, 2).await;
        let witness = process(&bus, 3).await;
        b.local().set("k", blob("v"));
        witness.local().set("k", blob("v"));

        bus.publish("test.global_runtime.remove", "not json".to_owned())
            .await
            .unwrap();
        bus.publish(
            "test.global_runtime.remove",
            r#"{"hostname":"host","pid":9,"key":"k"}"#.to_owned(),
        )
        .await
        .unwrap();

        assert!(eventually(|| b.local().get("k").is_none()).await);
        assert!(eventually(|| witness.local().get("k").is_none()).await);
    }

    #[tokio::test]
    async fn test_lost_invalidations_clear_local_tier() {
        let bus = MemoryBus::with_capacity(4);
        let a = process(&bus, 1).await;
        let b = process(&bus, 2).await;

        b.local().set("untouched", blob("0"));
        let keys: Vec<String> = (0..16).map(|i| format!("k{i}")).collect();
        for key in &keys {
            b.local().set(key, blob("0"));
        }
        // publishes queue up faster than b's subscription drains them
        for key in &keys {
            Tier::set(&a, key, blob("1"), None).await;
        }

        assert!(eventually(|| keys.iter().all(|k| b.local().get(k).is_none())).await);
        assert!(b.local().get("untouched").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_full_clear() {
        let bus = MemoryBus::new();
        let mut cfg = settings(1);
        cfg.full_clear_interval = Some(Duration::from_millis(1000));
        let tier = CoordinatedTier::start(LocalTier::new(10), Arc::new(bus), cfg)
            .await
            .unwrap();

        tier.local().set("k", blob("v"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tier.local().get("k").is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(tier.local().get("k").is_none());
    }
}
