//! Prometheus metrics sink for `quotagate`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounter, IntCounterVec, Registry};
use quotagate::telemetry::{AdmissionEvent, TelemetrySink};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// [`TelemetrySink`] that counts admission events in a Prometheus registry.
///
/// The `route` label is the rule id, so every unregistered route served by the default rule
/// shares the `*` label and label cardinality stays bounded by the rule set.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    rejections: IntCounterVec,
    evicted: IntCounter,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// Registers `quotagate_events_total{route,event}`,
    /// `quotagate_rejections_total{route,cause}` and `quotagate_evicted_windows_total`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            prometheus::Opts::new("quotagate_events_total", "Admission events"),
            &["route", "event"],
        )?;
        let rejections = IntCounterVec::new(
            prometheus::Opts::new("quotagate_rejections_total", "Rejected requests by cause"),
            &["route", "cause"],
        )?;
        let evicted =
            IntCounter::new("quotagate_evicted_windows_total", "Idle windows removed by sweeps")?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(evicted.clone()))?;
        Ok(Self { registry, events, rejections, evicted })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let route = event.route().unwrap_or("");
        self.events.with_label_values(&[route, event.kind()]).inc();
        match &event {
            AdmissionEvent::Rejected { cause, .. } => {
                self.rejections.with_label_values(&[route, cause.as_str()]).inc();
            }
            AdmissionEvent::Evicted { removed } => {
                self.evicted.inc_by(*removed as u64);
            }
            AdmissionEvent::Admitted { .. }
            | AdmissionEvent::StoreUnavailable { .. }
            | AdmissionEvent::IdentityUnavailable { .. } => {}
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
