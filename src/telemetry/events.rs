use crate::degradation::DegradationPolicy;
use crate::error::{IdentityError, RejectCause, StoreError};
use crate::identity::IdentityFallback;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by the admission engine and the eviction sweeper.
///
/// `route` is the id of the rule that matched, so traffic under the default rule is reported
/// as [`DEFAULT_ROUTE`](crate::rule::DEFAULT_ROUTE) whatever path it addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// A request was counted and admitted.
    Admitted {
        /// Rule id.
        route: Arc<str>,
        /// Slots left in the window.
        remaining: u32,
    },
    /// A request was turned away.
    Rejected {
        /// Rule id.
        route: Arc<str>,
        /// Why.
        cause: RejectCause,
        /// Hint handed to the caller.
        retry_after: Duration,
    },
    /// The counter store failed or timed out; the degradation policy decided the outcome.
    StoreUnavailable {
        /// Rule id.
        route: Arc<str>,
        /// Policy that was applied.
        policy: DegradationPolicy,
        /// Store failure.
        error: StoreError,
    },
    /// No identity could be extracted; the fallback decided the outcome.
    IdentityUnavailable {
        /// Rule id.
        route: Arc<str>,
        /// Fallback that was applied.
        fallback: IdentityFallback,
        /// Extraction failure.
        error: IdentityError,
    },
    /// A sweep removed idle windows.
    Evicted {
        /// Entries removed.
        removed: usize,
    },
}

impl AdmissionEvent {
    /// Short snake_case label of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Admitted { .. } => "admitted",
            AdmissionEvent::Rejected { .. } => "rejected",
            AdmissionEvent::StoreUnavailable { .. } => "store_unavailable",
            AdmissionEvent::IdentityUnavailable { .. } => "identity_unavailable",
            AdmissionEvent::Evicted { .. } => "evicted",
        }
    }

    /// Rule id the event concerns, if any.
    pub fn route(&self) -> Option<&str> {
        match self {
            AdmissionEvent::Admitted { route, .. }
            | AdmissionEvent::Rejected { route, .. }
            | AdmissionEvent::StoreUnavailable { route, .. }
            | AdmissionEvent::IdentityUnavailable { route, .. } => Some(route),
            AdmissionEvent::Evicted { .. } => None,
        }
    }

    /// Structured JSON form, for sinks that ship events elsewhere.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AdmissionEvent::Admitted { route, remaining } => {
                json!({ "kind": self.kind(), "route": &**route, "remaining": remaining })
            }
            AdmissionEvent::Rejected { route, cause, retry_after } => json!({
                "kind": self.kind(),
                "route": &**route,
                "cause": cause.as_str(),
                "retry_after_ms": retry_after.as_millis() as u64,
            }),
            AdmissionEvent::StoreUnavailable { route, policy, error } => json!({
                "kind": self.kind(),
                "route": &**route,
                "policy": policy.as_str(),
                "error": error.to_string(),
            }),
            AdmissionEvent::IdentityUnavailable { route, fallback, error } => json!({
                "kind": self.kind(),
                "route": &**route,
                "fallback": format!("{:?}", fallback),
                "error": error.to_string(),
            }),
            AdmissionEvent::Evicted { removed } => {
                json!({ "kind": self.kind(), "removed": removed })
            }
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { route, remaining } => {
                write!(f, "admitted route={} remaining={}", route, remaining)
            }
            AdmissionEvent::Rejected { route, cause, retry_after } => write!(
                f,
                "rejected route={} cause={} retry_after={:?}",
                route,
                cause.as_str(),
                retry_after
            ),
            AdmissionEvent::StoreUnavailable { route, policy, error } => write!(
                f,
                "store unavailable route={} policy={} error={}",
                route,
                policy.as_str(),
                error
            ),
            AdmissionEvent::IdentityUnavailable { route, fallback, error } => write!(
                f,
                "identity unavailable route={} fallback={:?} error={}",
                route, fallback, error
            ),
            AdmissionEvent::Evicted { removed } => write!(f, "evicted removed={}", removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_json_agree_on_kind() {
        let event = AdmissionEvent::Rejected {
            route: "/chat".into(),
            cause: RejectCause::Quota,
            retry_after: Duration::from_secs(50),
        };
        assert_eq!(event.kind(), "rejected");
        assert_eq!(event.route(), Some("/chat"));
        assert!(event.to_string().contains("cause=quota"));
        let json = event.to_json();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["retry_after_ms"], 50_000);
    }

    #[test]
    fn store_unavailable_names_policy() {
        let event = AdmissionEvent::StoreUnavailable {
            route: "/r".into(),
            policy: DegradationPolicy::FailOpen,
            error: StoreError::Timeout(Duration::from_millis(50)),
        };
        assert_eq!(event.to_json()["policy"], "fail_open");
        assert!(event.to_string().contains("timed out"));
    }

    #[test]
    fn evicted_has_no_route() {
        let event = AdmissionEvent::Evicted { removed: 3 };
        assert_eq!(event.route(), None);
        assert_eq!(event.to_json()["removed"], 3);
    }
}
