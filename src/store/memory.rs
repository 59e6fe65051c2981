//! In-process counter store.

use crate::decision::Decision;
use crate::degradation::EvictionPolicy;
use crate::error::StoreError;
use crate::identity::ClientKey;
use crate::rule::RouteRule;
use crate::store::window::{WindowEntry, WindowKey};
use crate::store::CounterStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counter store backed by a sharded concurrent map.
///
/// The record-and-check step runs under the write lock of the shard holding the key, so it is
/// atomic per key while keys in other shards proceed in parallel. Sweeps take the same shard
/// locks, so an entry is either updated or removed, never both: a request arriving after its
/// stale entry was evicted simply starts a fresh window.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    entries: Arc<DashMap<WindowKey, WindowEntry>>,
    eviction: EvictionPolicy,
    calls: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    /// Store with the default eviction policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a custom eviction policy.
    pub fn with_eviction(eviction: EvictionPolicy) -> Self {
        Self { eviction, ..Self::default() }
    }

    /// Eviction settings in effect.
    pub fn eviction(&self) -> &EvictionPolicy {
        &self.eviction
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no window is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the window for `client` on `route`.
    pub fn entry(&self, client: &ClientKey, route: &str) -> Option<WindowEntry> {
        let key = WindowKey::new(client.clone(), Arc::from(route));
        self.entries.get(&key).map(|e| e.value().clone())
    }

    /// Remove entries idle for at least `idle_multiple` of their longest window.
    pub fn sweep_idle(&self, now_millis: u64) -> usize {
        let removed = self.evict_idle(now_millis, |_, _| {});
        if removed > 0 {
            debug!(
                target: "quotagate::store",
                removed,
                remaining = self.entries.len(),
                "evicted idle windows"
            );
        }
        removed
    }

    /// Remove idle entries, handing each to `on_evict` under its shard lock.
    fn evict_idle(
        &self,
        now_millis: u64,
        mut on_evict: impl FnMut(&WindowKey, &WindowEntry),
    ) -> usize {
        let multiple = self.eviction.idle_multiple;
        let mut removed = 0usize;
        self.entries.retain(|key, entry| {
            if entry.is_idle(now_millis, multiple) {
                on_evict(key, entry);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    fn maybe_sweep(&self, now_millis: u64) {
        if let Some(every) = self.eviction.inline_sweep_every() {
            let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            if calls % every == 0 {
                self.sweep_idle(now_millis);
            }
        }
    }

    fn ensure_capacity(&self, key: &WindowKey, now_millis: u64) -> Result<(), StoreError> {
        let Some(max) = self.eviction.max_entries else {
            return Ok(());
        };
        // Soft cap: concurrent inserts of distinct new keys may overshoot by a few entries.
        if self.entries.contains_key(key) || self.entries.len() < max {
            return Ok(());
        }
        self.sweep_idle(now_millis);
        let entries = self.entries.len();
        if entries >= max {
            warn!(target: "quotagate::store", entries, max, "window store full; refusing new key");
            return Err(StoreError::CapacityExhausted { entries, max });
        }
        Ok(())
    }

    /// Synchronous record-and-check; the async trait method delegates here.
    pub fn record(
        &self,
        client: &ClientKey,
        rule: &RouteRule,
        now_millis: u64,
    ) -> Result<Decision, StoreError> {
        let key = WindowKey::new(client.clone(), rule.route_id().clone());
        self.maybe_sweep(now_millis);
        self.ensure_capacity(&key, now_millis)?;

        let limits = rule.limits();
        let mut entry =
            self.entries.entry(key).or_insert_with(|| WindowEntry::new(now_millis, limits));
        Ok(entry.record(limits, now_millis))
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn record_and_check(
        &self,
        key: &ClientKey,
        rule: &RouteRule,
        now_millis: u64,
    ) -> Result<Decision, StoreError> {
        self.record(key, rule, now_millis)
    }

    async fn sweep(&self, now_millis: u64) -> Result<usize, StoreError> {
        Ok(self.sweep_idle(now_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::DEFAULT_SWEEP_EVERY;
    use std::time::Duration;

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s).unwrap()
    }

    fn rule(quota: u32, window: Duration) -> RouteRule {
        RouteRule::new("/chat", quota, window).unwrap()
    }

    #[test]
    fn keys_are_isolated() {
        let store = InMemoryCounterStore::new();
        let rule = rule(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(store.record(&key("A"), &rule, 0).unwrap().admitted);
            assert!(store.record(&key("B"), &rule, 0).unwrap().admitted);
        }
        assert!(!store.record(&key("A"), &rule, 0).unwrap().admitted);
        assert_eq!(store.entry(&key("B"), "/chat").unwrap().count(), 5);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn routes_are_isolated() {
        let store = InMemoryCounterStore::new();
        let chat = RouteRule::new("/chat", 1, Duration::from_secs(60)).unwrap();
        let search = RouteRule::new("/search", 1, Duration::from_secs(60)).unwrap();
        assert!(store.record(&key("A"), &chat, 0).unwrap().admitted);
        assert!(store.record(&key("A"), &search, 0).unwrap().admitted);
        assert!(!store.record(&key("A"), &chat, 0).unwrap().admitted);
    }

    #[test]
    fn sweep_removes_only_idle_entries() {
        let store = InMemoryCounterStore::with_eviction(EvictionPolicy {
            idle_multiple: 2,
            ..EvictionPolicy::default()
        });
        let rule = rule(5, Duration::from_secs(1));
        store.record(&key("old"), &rule, 0).unwrap();
        store.record(&key("new"), &rule, 1_500).unwrap();
        assert_eq!(store.sweep_idle(2_000), 1);
        assert!(store.entry(&key("old"), "/chat").is_none());
        assert!(store.entry(&key("new"), "/chat").is_some());
    }

    #[test]
    fn evicted_key_starts_fresh_window() {
        let store = InMemoryCounterStore::new();
        let rule = rule(1, Duration::from_secs(1));
        assert!(store.record(&key("K"), &rule, 0).unwrap().admitted);
        assert!(!store.record(&key("K"), &rule, 10).unwrap().admitted);
        assert_eq!(store.sweep_idle(10_010), 1);
        let d = store.record(&key("K"), &rule, 10_010).unwrap();
        assert!(d.admitted);
        assert_eq!(store.entry(&key("K"), "/chat").unwrap().window_start(), 10_010);
    }

    #[test]
    fn capacity_cap_sweeps_then_refuses() {
        let store = InMemoryCounterStore::with_eviction(EvictionPolicy {
            max_entries: Some(2),
            ..EvictionPolicy::default()
        });
        let rule = rule(5, Duration::from_secs(1));
        store.record(&key("a"), &rule, 0).unwrap();
        store.record(&key("b"), &rule, 0).unwrap();
        // known keys keep working when full
        assert!(store.record(&key("a"), &rule, 1).unwrap().admitted);
        assert_eq!(
            store.record(&key("c"), &rule, 1),
            Err(StoreError::CapacityExhausted { entries: 2, max: 2 })
        );
        // once a and b are idle, the sweep makes room
        assert!(store.record(&key("c"), &rule, 20_000).unwrap().admitted);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn default_policy_sweeps_inline() {
        let store = InMemoryCounterStore::with_eviction(EvictionPolicy {
            idle_multiple: 1,
            ..EvictionPolicy::default()
        });
        let rule = rule(5, Duration::from_secs(1));
        store.record(&key("stale"), &rule, 0).unwrap();
        for _ in 1..DEFAULT_SWEEP_EVERY {
            store.record(&key("live"), &rule, 5_000).unwrap();
        }
        assert!(store.entry(&key("stale"), "/chat").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stacked_rule_counts_every_window_under_one_key() {
        let store = InMemoryCounterStore::new();
        let rule = RouteRule::parse("/chat", "2 per second; 3 per minute").unwrap();
        assert!(store.record(&key("K"), &rule, 0).unwrap().admitted);
        assert!(store.record(&key("K"), &rule, 0).unwrap().admitted);
        assert!(!store.record(&key("K"), &rule, 500).unwrap().admitted);
        let d = store.record(&key("K"), &rule, 1_000).unwrap();
        assert_eq!((d.admitted, d.limit, d.remaining), (true, 3, 0));
        let d = store.record(&key("K"), &rule, 2_000).unwrap();
        assert_eq!((d.admitted, d.limit), (false, 3));
        assert_eq!(d.retry_after, Duration::from_secs(58));

        let entry = store.entry(&key("K"), "/chat").unwrap();
        assert_eq!(entry.windows().len(), 2);
        assert_eq!(entry.windows()[1].count(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn eviction_racing_records_loses_no_admission() {
        let store = InMemoryCounterStore::new();
        let quota = 40;
        let rule = rule(quota, Duration::from_secs(60));
        let done = std::sync::atomic::AtomicBool::new(false);
        let admitted = AtomicU64::new(0);

        let evicted_counts = std::thread::scope(|s| {
            let sweeper = s.spawn(|| {
                let mut counts = Vec::new();
                while !done.load(Ordering::Acquire) {
                    store.evict_idle(u64::MAX, |k, entry| {
                        assert_eq!(k.route(), "/chat");
                        counts.push(entry.count());
                    });
                    std::thread::yield_now();
                }
                counts
            });
            let (store, rule, admitted) = (&store, &rule, &admitted);
            let recorders: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(move || {
                        for _ in 0..2_000 {
                            if store.record(&key("K"), &rule, 0).unwrap().admitted {
                                admitted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                })
                .collect();
            for recorder in recorders {
                recorder.join().unwrap();
            }
            done.store(true, Ordering::Release);
            sweeper.join().unwrap()
        });

        let remaining = store.entry(&key("K"), "/chat").map_or(0, |e| e.count());
        assert!(remaining <= quota);
        assert!(evicted_counts.iter().all(|c| *c <= quota));
        // every admission is in exactly one window: an evicted one or the live one
        let counted: u64 =
            evicted_counts.iter().map(|c| u64::from(*c)).sum::<u64>() + u64::from(remaining);
        assert_eq!(counted, admitted.load(Ordering::Relaxed));
    }

    #[test]
    fn on_access_sweep_runs_every_n_calls() {
        let store = InMemoryCounterStore::with_eviction(EvictionPolicy {
            sweep_every: Some(3),
            idle_multiple: 1,
            ..EvictionPolicy::default()
        });
        let rule = rule(5, Duration::from_secs(1));
        store.record(&key("stale"), &rule, 0).unwrap();
        store.record(&key("x"), &rule, 5_000).unwrap();
        assert!(store.entry(&key("stale"), "/chat").is_some());
        store.record(&key("x"), &rule, 5_000).unwrap();
        assert!(store.entry(&key("stale"), "/chat").is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_never_exceed_quota() {
        let store = InMemoryCounterStore::new();
        let rule = Arc::new(rule(10, Duration::from_secs(60)));
        let mut handles = vec![];
        for _ in 0..50 {
            let store = store.clone();
            let rule = rule.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                store.record(&key("K"), &rule, 0).unwrap().admitted
            }));
        }
        let results = futures::future::join_all(handles).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, 10);
    }
}
