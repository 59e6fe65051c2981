//! Per-key window state and the reset-window transition.

use crate::decision::Decision;
use crate::identity::ClientKey;
use crate::rule::Limit;
use std::sync::Arc;
use std::time::Duration;

/// Composite `(client, route)` key of one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    client: ClientKey,
    route: Arc<str>,
}

impl WindowKey {
    /// Key for `client` on `route`.
    pub fn new(client: ClientKey, route: Arc<str>) -> Self {
        Self { client, route }
    }

    /// Caller half of the key.
    pub fn client(&self) -> &ClientKey {
        &self.client
    }

    /// Route half of the key.
    pub fn route(&self) -> &str {
        &self.route
    }
}

/// Counter for one limit of a rule. Timestamps are clock milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    count: u32,
    start: u64,
    millis: u64,
}

impl Window {
    fn new(now: u64, millis: u64) -> Self {
        Self { count: 0, start: now, millis: millis.max(1) }
    }

    /// Restart the window at `now` if it is at least `millis` old.
    fn roll(&mut self, millis: u64, now: u64) {
        self.millis = millis.max(1);
        if now.saturating_sub(self.start) >= self.millis {
            self.start = now;
            self.count = 0;
        }
    }

    fn until_reset(&self, now: u64) -> Duration {
        Duration::from_millis(self.start.saturating_add(self.millis).saturating_sub(now))
    }

    /// Requests admitted in this window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Start of this window.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Length of this window in milliseconds.
    pub fn millis(&self) -> u64 {
        self.millis
    }
}

/// Counter state for one `(client, route)` pair: one [`Window`] per limit of the rule.
///
/// All windows live in one entry so a stacked limit is checked and counted in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    windows: Vec<Window>,
    last_seen: u64,
}

impl WindowEntry {
    /// Fresh, empty windows for `limits` starting at `now`.
    pub fn new(now: u64, limits: &[Limit]) -> Self {
        let windows = limits.iter().map(|l| Window::new(now, l.window_millis())).collect();
        Self { windows, last_seen: now }
    }

    /// Record one request against every limit and decide.
    ///
    /// Each window at least its length old is restarted at `now` first. The request is admitted
    /// only if every window has room, and then counts against all of them. A rejection counts
    /// against none and reports the longest wait among the full windows. An admission reports
    /// the window with the fewest slots left.
    pub fn record(&mut self, limits: &[Limit], now: u64) -> Decision {
        if self.windows.len() != limits.len() {
            self.windows = limits.iter().map(|l| Window::new(now, l.window_millis())).collect();
        }
        self.last_seen = self.last_seen.max(now);
        for (window, limit) in self.windows.iter_mut().zip(limits) {
            window.roll(limit.window_millis(), now);
        }

        let blocking = self
            .windows
            .iter()
            .zip(limits)
            .filter(|(window, limit)| window.count >= limit.quota())
            .max_by_key(|(window, _)| window.until_reset(now));
        if let Some((window, limit)) = blocking {
            return Decision::reject(limit.quota(), window.until_reset(now));
        }

        for window in &mut self.windows {
            window.count += 1;
        }
        self.windows
            .iter()
            .zip(limits)
            .map(|(window, limit)| (limit.quota() - window.count, window.until_reset(now), limit))
            .min_by_key(|(remaining, reset, _)| (*remaining, std::cmp::Reverse(*reset)))
            .map(|(remaining, reset, limit)| Decision::admit(limit.quota(), remaining, reset))
            // rules always carry at least one limit
            .unwrap_or_else(|| Decision::admit(0, 0, Duration::ZERO))
    }

    /// True once the entry has been untouched for `idle_multiple` of its longest window.
    pub fn is_idle(&self, now: u64, idle_multiple: u32) -> bool {
        let longest = self.windows.iter().map(|w| w.millis).max().unwrap_or(1);
        let threshold = longest.saturating_mul(u64::from(idle_multiple.max(1)));
        now.saturating_sub(self.last_seen) >= threshold
    }

    /// Requests admitted in the current window of the first limit.
    pub fn count(&self) -> u32 {
        self.windows.first().map_or(0, |w| w.count)
    }

    /// Start of the current window of the first limit.
    pub fn window_start(&self) -> u64 {
        self.windows.first().map_or(self.last_seen, |w| w.start)
    }

    /// Last time the entry was touched.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// One window per limit, in rule order.
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }
}
