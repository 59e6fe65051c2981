//! Error types for admission control
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCause {
    /// The caller used up its quota for the current window.
    Quota,
    /// The counter store failed and the deployment is configured fail-closed.
    StoreUnavailable,
    /// No identity could be derived and the deployment rejects anonymous callers.
    IdentityUnavailable,
}

impl RejectCause {
    /// Stable lowercase label, used in response bodies and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCause::Quota => "quota",
            RejectCause::StoreUnavailable => "store_unavailable",
            RejectCause::IdentityUnavailable => "identity_unavailable",
        }
    }
}

/// The one rejection shape that reaches API callers. Carries a retry-after hint for every cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    /// Route the request was addressed to.
    pub route: Arc<str>,
    /// How long the caller should wait before retrying.
    pub retry_after: Duration,
    /// Quota of the rule that rejected the request, when a rule was involved.
    pub limit: Option<u32>,
    /// What triggered the rejection.
    pub cause: RejectCause,
}

impl QuotaExceeded {
    /// Rejection caused by an exhausted quota.
    pub fn quota(route: impl Into<Arc<str>>, limit: u32, retry_after: Duration) -> Self {
        Self { route: route.into(), retry_after, limit: Some(limit), cause: RejectCause::Quota }
    }

    /// Retry-after rounded up to whole seconds (never zero), as used by the `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded.max(1)
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            RejectCause::Quota => write!(
                f,
                "rate limit exceeded for route '{}' (limit {}); retry after {:?}",
                self.route,
                self.limit.unwrap_or_default(),
                self.retry_after
            ),
            RejectCause::StoreUnavailable => write!(
                f,
                "rate limiting unavailable for route '{}'; retry after {:?}",
                self.route, self.retry_after
            ),
            RejectCause::IdentityUnavailable => write!(
                f,
                "caller identity unavailable for route '{}'; retry after {:?}",
                self.route, self.retry_after
            ),
        }
    }
}

impl std::error::Error for QuotaExceeded {}

/// Failures deriving a [`ClientKey`](crate::identity::ClientKey) from a request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The request carries no peer address (e.g. built by a test harness).
    #[error("request has no peer address")]
    MissingPeerAddr,
    /// The configured header is absent or blank.
    #[error("header `{header}` is missing or empty")]
    MissingHeader {
        /// Header that was consulted.
        header: String,
    },
    /// The configured header is present but not usable as an identity.
    #[error("header `{header}` has an unusable value")]
    InvalidHeader {
        /// Header that was consulted.
        header: String,
    },
    /// A forwarded-for chain is shorter than the number of trusted proxies.
    #[error("header `{header}` lists {found} hops, fewer than the {trusted_hops} trusted proxies")]
    ShortForwardChain {
        /// Header that was consulted.
        header: String,
        /// Entries present in the header.
        found: usize,
        /// Proxies configured as trusted.
        trusted_hops: usize,
    },
}

/// Failures of a [`CounterStore`](crate::store::CounterStore).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store did not answer within the configured timeout.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    /// The store refuses new keys because it is at its entry cap.
    #[error("counter store at capacity ({entries} entries, max {max})")]
    CapacityExhausted {
        /// Entries held when the request arrived.
        entries: usize,
        /// Configured cap.
        max: usize,
    },
    /// The backend (network store, script, connection) failed.
    #[error("counter store backend error: {0}")]
    Backend(String),
}

/// The admission-control fault taxonomy.
///
/// [`RuleRegistry::resolve`](crate::rule::RuleRegistry::resolve) returns
/// [`AdmissionError::NoRuleConfigured`]. The engine itself never returns this type: it resolves
/// identity and store faults through configured policy and hands callers a [`QuotaExceeded`].
/// The remaining variants exist so code driving extractors and stores directly can lift their
/// errors with `?` into one type.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// No identity could be derived from the request.
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(#[from] IdentityError),
    /// The route has no registered rule.
    #[error("no rate-limit rule configured for route '{route}'")]
    NoRuleConfigured {
        /// Route that was looked up.
        route: String,
    },
    /// The caller is over its quota.
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),
    /// The counter store could not be consulted.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Errors parsing a limit expression such as `"5 per minute"`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitParseError {
    /// The expression does not have the `<count> per <unit>` shape.
    #[error("malformed limit expression '{0}'")]
    Malformed(String),
    /// The count is not a positive integer.
    #[error("invalid request count in limit expression '{0}'")]
    InvalidCount(String),
    /// The unit is not second, minute, hour or day.
    #[error("unknown time unit '{0}'")]
    UnknownUnit(String),
}

/// Startup validation failures. A deployment with any of these must not start.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// No degradation policy was chosen.
    #[error("degradation policy must be configured explicitly (fail_open or fail_closed)")]
    MissingDegradationPolicy,
    /// Unregistered routes fall back to a default rule, but none was given.
    #[error("unregistered routes use the default rule, but no default rule is configured")]
    MissingDefaultRule,
    /// Quota must be > 0.
    #[error("quota for route '{route}' must be > 0")]
    InvalidQuota {
        /// Offending route (`*` for the default rule).
        route: String,
    },
    /// Window must be at least one millisecond.
    #[error("window for route '{route}' must be at least 1ms (got {window:?})")]
    InvalidWindow {
        /// Offending route (`*` for the default rule).
        route: String,
        /// Value provided.
        window: Duration,
    },
    /// A limit expression failed to parse.
    #[error("invalid limit for route '{route}': {source}")]
    InvalidLimit {
        /// Offending route (`*` for the default rule).
        route: String,
        /// Parse failure.
        #[source]
        source: LimitParseError,
    },
    /// A rule was given an empty list of limits.
    #[error("route '{route}' has no limits")]
    NoLimits {
        /// Offending route (`*` for the default rule).
        route: String,
    },
    /// Route registered twice.
    #[error("route '{route}' registered more than once")]
    DuplicateRoute {
        /// Offending route.
        route: String,
    },
    /// Route id is empty.
    #[error("route id must not be empty")]
    EmptyRoute,
    /// A header name in the identity strategy is not a valid HTTP header name.
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    /// Store timeout must be > 0.
    #[error("store timeout must be > 0")]
    InvalidStoreTimeout,
    /// Eviction settings are unusable.
    #[error("invalid eviction settings: {0}")]
    InvalidEviction(String),
    /// A background sweeper was requested outside a tokio runtime.
    #[error("background sweeper requires a tokio runtime")]
    NoRuntime,
    /// The configuration source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Error returned by [`AdmissionService`](crate::layer::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionServiceError<E> {
    /// The request was not admitted; the inner service was not called.
    Rejected(QuotaExceeded),
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionServiceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(rejection) => write!(f, "{}", rejection),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionServiceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> AdmissionServiceError<E> {
    /// Check if the request was rejected by admission control.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Borrow the rejection if present.
    pub fn rejection(&self) -> Option<&QuotaExceeded> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn quota_exceeded_display_names_route_and_limit() {
        let err = QuotaExceeded::quota("/chat", 5, Duration::from_secs(50));
        let msg = err.to_string();
        assert!(msg.contains("/chat"));
        assert!(msg.contains("limit 5"));
        assert!(msg.contains("50s"));
    }

    #[test]
    fn retry_after_secs_rounds_up_and_is_never_zero() {
        let mut err = QuotaExceeded::quota("r", 1, Duration::from_millis(1_200));
        assert_eq!(err.retry_after_secs(), 2);
        err.retry_after = Duration::from_secs(3);
        assert_eq!(err.retry_after_secs(), 3);
        err.retry_after = Duration::ZERO;
        assert_eq!(err.retry_after_secs(), 1);
    }

    #[test]
    fn store_unavailable_display_differs_from_quota() {
        let err = QuotaExceeded {
            route: "r".into(),
            retry_after: Duration::from_secs(1),
            limit: None,
            cause: RejectCause::StoreUnavailable,
        };
        assert!(err.to_string().contains("unavailable"));
        assert_eq!(err.cause.as_str(), "store_unavailable");
    }

    #[test]
    fn admission_error_wraps_sources() {
        let err: AdmissionError = StoreError::Timeout(Duration::from_millis(50)).into();
        assert!(err.to_string().contains("timed out"));
        let err: AdmissionError = IdentityError::MissingPeerAddr.into();
        assert!(matches!(err, AdmissionError::IdentityUnavailable(_)));
    }

    #[test]
    fn direct_store_and_decision_errors_lift_with_question_mark() {
        fn drive(store: Result<u32, StoreError>, over: bool) -> Result<u32, AdmissionError> {
            let remaining = store?;
            if over {
                Err(QuotaExceeded::quota("/r", 1, Duration::from_secs(2)))?;
            }
            Ok(remaining)
        }

        assert_eq!(drive(Ok(3), false), Ok(3));
        assert!(matches!(
            drive(Err(StoreError::Backend("down".into())), false),
            Err(AdmissionError::StoreUnavailable(StoreError::Backend(_)))
        ));
        match drive(Ok(0), true) {
            Err(AdmissionError::QuotaExceeded(q)) => assert_eq!(q.cause, RejectCause::Quota),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn service_error_accessors() {
        let rejected: AdmissionServiceError<io::Error> =
            AdmissionServiceError::Rejected(QuotaExceeded::quota("r", 1, Duration::from_secs(1)));
        assert!(rejected.is_rejected());
        assert_eq!(rejected.rejection().map(|r| r.limit), Some(Some(1)));
        assert!(rejected.source().is_some());

        let inner = AdmissionServiceError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!inner.is_rejected());
        assert_eq!(inner.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn config_error_wraps_parse_error() {
        let err = ConfigError::InvalidLimit {
            route: "/x".into(),
            source: LimitParseError::UnknownUnit("fortnight".into()),
        };
        assert!(err.to_string().contains("fortnight"));
        assert!(err.source().is_some());
    }
}
