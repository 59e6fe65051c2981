#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Request admission control for async Rust services: per-caller, per-route quotas over time
//! windows, with explicit behavior when the counting infrastructure is degraded.
//!
//! ## Features
//!
//! - **Pluggable identity**: peer address (default), trusted forwarded-for, or hashed API key
//! - **Immutable rule registry** with slowapi-style limits (`"5 per minute"`, stacked as
//!   `"200 per day; 50 per hour"`) and a default rule
//! - **Sharded window store** with atomic record-and-check per key and idle-window eviction
//! - **Explicit degradation policy**: fail-open or fail-closed, never implicit
//! - **Tower middleware** and a standard `429` response with `Retry-After`
//! - **Telemetry sinks** for every decision and every degradation
//!
//! ## Quick Start
//!
//! ```rust
//! use quotagate::{AdmissionEngine, AdmissionLayer, DegradationPolicy, Limit, RouteRule, RuleRegistry};
//! use tower::{service_fn, Layer};
//!
//! # fn main() -> Result<(), quotagate::ConfigError> {
//! let rules = RuleRegistry::builder()
//!     .rule(RouteRule::parse("/chat", "5 per minute")?)
//!     .default_limit(Limit::per_minute(60))?
//!     .build()?;
//! let engine = AdmissionEngine::builder(rules)
//!     .degradation(DegradationPolicy::FailClosed)
//!     .build()?;
//!
//! let service = AdmissionLayer::new(engine).layer(service_fn(|_req: http::Request<()>| async {
//!     Ok::<_, std::convert::Infallible>("ok")
//! }));
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod decision;
pub mod degradation;
pub mod engine;
pub mod error;
pub mod identity;
pub mod layer;
pub mod prelude;
pub mod rule;
pub mod store;
pub mod telemetry;

// Re-exports
pub use crate::config::{AdmissionConfig, LimitSpec, RouteConfig};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decision::Decision;
pub use degradation::{spawn_sweeper, DegradationPolicy, EvictionPolicy, SweeperHandle};
pub use engine::{Admission, AdmissionEngine, AdmissionEngineBuilder, PreparedCheck};
pub use error::{
    AdmissionError, AdmissionServiceError, ConfigError, IdentityError, LimitParseError,
    QuotaExceeded, RejectCause, StoreError,
};
pub use identity::{
    ClientKey, ForwardedForExtractor, HeaderKeyExtractor, IdentityExtractor, IdentityFallback,
    IdentityStrategy, PeerAddr, PeerAddrExtractor, RequestMeta, RouteId,
};
pub use layer::{AdmissionLayer, AdmissionService};
pub use rule::{Limit, Resolution, RouteRule, RuleRegistry, RuleRegistryBuilder, UnregisteredRoutes};
pub use store::{CounterStore, InMemoryCounterStore, Window, WindowEntry, WindowKey};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
