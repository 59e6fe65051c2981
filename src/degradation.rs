//! What to do when the counter store cannot be consulted, and how stale windows are reclaimed.

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::store::CounterStore;
use crate::telemetry::{emit_best_effort, AdmissionEvent, TelemetrySink};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome applied when the store errors or times out.
///
/// Deliberately has no `Default`: a deployment must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Admit the request without counting it.
    FailOpen,
    /// Reject the request with a retry-after hint.
    FailClosed,
}

impl DegradationPolicy {
    /// Stable snake_case label.
    pub fn as_str(self) -> &'static str {
        match self {
            DegradationPolicy::FailOpen => "fail_open",
            DegradationPolicy::FailClosed => "fail_closed",
        }
    }
}

/// Inline sweep period, in record calls, when neither `sweep_every` nor a background sweeper is
/// configured.
pub const DEFAULT_SWEEP_EVERY: u64 = 4_096;

/// Idle-window reclamation and memory bounds for the in-process store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// An entry is idle once unseen for this many of its windows.
    pub idle_multiple: u32,
    /// Soft cap on tracked windows; new keys are refused beyond it.
    pub max_entries: Option<usize>,
    /// Sweep inline every N record calls. Defaults to [`DEFAULT_SWEEP_EVERY`] unless
    /// `sweep_interval_ms` is set.
    pub sweep_every: Option<u64>,
    /// Period of the background sweeper, in milliseconds.
    pub sweep_interval_ms: Option<u64>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self { idle_multiple: 10, max_entries: None, sweep_every: None, sweep_interval_ms: None }
    }
}

impl EvictionPolicy {
    /// Background sweep period, if enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }

    /// Inline sweep period actually used by the in-memory store.
    pub fn inline_sweep_every(&self) -> Option<u64> {
        match (self.sweep_every, self.sweep_interval_ms) {
            (Some(every), _) => Some(every.max(1)),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_SWEEP_EVERY),
        }
    }

    /// Reject zero values, which would evict live windows or spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_multiple == 0 {
            return Err(ConfigError::InvalidEviction("idle_multiple must be > 0".into()));
        }
        if self.max_entries == Some(0) {
            return Err(ConfigError::InvalidEviction("max_entries must be > 0".into()));
        }
        if self.sweep_every == Some(0) {
            return Err(ConfigError::InvalidEviction("sweep_every must be > 0".into()));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(ConfigError::InvalidEviction("sweep_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Handle to a background sweeper; the task stops when the handle is dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping now.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Periodically sweep `store` for idle windows.
///
/// Must be called from within a tokio runtime. Each pass that removes entries emits
/// [`AdmissionEvent::Evicted`] to `sink`.
///
/// # Errors
/// [`ConfigError::InvalidEviction`] for a zero interval.
pub fn spawn_sweeper<S, K>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    sink: K,
) -> Result<SweeperHandle, ConfigError>
where
    S: CounterStore + ?Sized + 'static,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    if interval.is_zero() {
        return Err(ConfigError::InvalidEviction("sweep interval must be > 0".into()));
    }
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.sweep(clock.now_millis()).await {
                Ok(0) => {}
                Ok(removed) => {
                    debug!(target: "quotagate::sweeper", removed, "sweep pass");
                    emit_best_effort(sink.clone(), AdmissionEvent::Evicted { removed }).await;
                }
                Err(e) => {
                    warn!(target: "quotagate::sweeper", error = %e, "sweep failed");
                }
            }
        }
    });
    Ok(SweeperHandle { task })
}
