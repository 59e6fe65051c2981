//! Convenient re-exports for common quotagate types.
pub use crate::{
    config::AdmissionConfig,
    degradation::{DegradationPolicy, EvictionPolicy},
    engine::{Admission, AdmissionEngine},
    error::{AdmissionServiceError, ConfigError, QuotaExceeded, RejectCause},
    identity::{ClientKey, IdentityFallback, IdentityStrategy, PeerAddr, RouteId},
    layer::AdmissionLayer,
    rule::{Limit, RouteRule, RuleRegistry, UnregisteredRoutes},
    store::{CounterStore, InMemoryCounterStore},
    telemetry::{LogSink, MemorySink, TelemetrySink},
};
