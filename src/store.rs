//! Window counter stores.
//!
//! A [`CounterStore`] owns every [`WindowEntry`] and performs the record-and-check step
//! atomically per `(client, route)` key. Two implementations share the interface:
//!
//! - [`InMemoryCounterStore`]: per-process counting, sharded locks, idle-entry eviction.
//! - Network stores (see the `quotagate-redis` crate) for limits shared by many instances. These
//!   suspend on I/O, so the engine bounds every call with a timeout and treats a timeout as the
//!   store being unavailable.

use crate::decision::Decision;
use crate::error::StoreError;
use crate::identity::ClientKey;
use crate::rule::RouteRule;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub mod window;

pub use memory::InMemoryCounterStore;
pub use window::{Window, WindowEntry, WindowKey};

/// Storage and atomic update of window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request from `key` against `rule` at `now_millis` and decide.
    ///
    /// Must be linearizable per `(key, rule.route())`: two concurrent calls never both observe
    /// the last free slot. Calls for different keys must not serialize behind each other.
    async fn record_and_check(
        &self,
        key: &ClientKey,
        rule: &RouteRule,
        now_millis: u64,
    ) -> Result<Decision, StoreError>;

    /// Drop idle entries; returns how many were removed.
    ///
    /// Stores with native expiry keep the default, which does nothing.
    async fn sweep(&self, _now_millis: u64) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[async_trait]
impl<T> CounterStore for Arc<T>
where
    T: CounterStore + ?Sized,
{
    async fn record_and_check(
        &self,
        key: &ClientKey,
        rule: &RouteRule,
        now_millis: u64,
    ) -> Result<Decision, StoreError> {
        (**self).record_and_check(key, rule, now_millis).await
    }

    async fn sweep(&self, now_millis: u64) -> Result<usize, StoreError> {
        (**self).sweep(now_millis).await
    }
}
