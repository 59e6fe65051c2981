//! Telemetry and observability for admission control.
//!
//! The engine emits an [`AdmissionEvent`] for every decision and for every degradation.
//! Events flow through `TelemetrySink` implementations which can log, aggregate, or forward
//! them to external systems.
//!
//! # Event Types
//!
//! - **Decisions**: `Admitted`, `Rejected` (with the [`RejectCause`](crate::RejectCause))
//! - **Degradation**: `StoreUnavailable`, `IdentityUnavailable`
//! - **Housekeeping**: `Evicted`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AdmissionEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
