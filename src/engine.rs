//! Admission decision engine.
//!
//! Coordinates one check: resolve the route's rule, extract the caller's identity, record the
//! request in the counter store and turn the [`Decision`] into the caller-visible outcome. The
//! engine keeps no mutable state of its own, so one instance serves every request task.
//!
//! ```
//! use quotagate::{AdmissionEngine, ClientKey, DegradationPolicy, Limit, RouteRule, RuleRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rules = RuleRegistry::builder()
//!     .rule(RouteRule::parse("/chat", "5 per minute")?)
//!     .default_limit(Limit::per_minute(60))?
//!     .build()?;
//! let engine = AdmissionEngine::builder(rules)
//!     .degradation(DegradationPolicy::FailOpen)
//!     .build()?;
//!
//! let key = ClientKey::new("203.0.113.7").unwrap();
//! let admission = engine.check_key(&key, "/chat").await?;
//! assert_eq!(admission.decision().map(|d| d.remaining), Some(4));
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::decision::Decision;
use crate::degradation::{spawn_sweeper, DegradationPolicy, SweeperHandle};
use crate::error::{ConfigError, IdentityError, QuotaExceeded, RejectCause, StoreError};
use crate::identity::{
    ClientKey, IdentityExtractor, IdentityFallback, PeerAddrExtractor, RequestMeta,
};
use crate::rule::{Resolution, RouteRule, RuleRegistry};
use crate::store::{CounterStore, InMemoryCounterStore};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, TelemetrySink};
use http::{HeaderMap, Request};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default retry-after for rejections that are not quota based.
pub const DEFAULT_FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// A request that may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted against a rule.
    Limited(Decision),
    /// The route is not limited.
    Unlimited,
    /// The store was unavailable and the engine is fail-open; the request was not counted.
    Degraded,
}

impl Admission {
    /// The counting decision, when the request was counted.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Limited(decision) => Some(decision),
            Admission::Unlimited | Admission::Degraded => None,
        }
    }

    /// True when admitted without counting because the store failed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Admission::Degraded)
    }

    /// Write `X-RateLimit-*` headers for counted requests; no-op otherwise.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if let Admission::Limited(decision) = self {
            decision.apply_headers(headers);
        }
    }
}

#[derive(Debug)]
enum Target {
    Unlimited,
    Limited { rule: Arc<RouteRule>, identity: Result<ClientKey, IdentityError> },
}

/// The synchronous half of a check: rule resolved and identity extracted.
///
/// Owns everything it needs, so the asynchronous half ([`AdmissionEngine::admit`]) does not
/// borrow the request.
#[derive(Debug)]
pub struct PreparedCheck {
    route: Arc<str>,
    target: Target,
}

impl PreparedCheck {
    /// Route id the request is counted under.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Whether the route is unlimited.
    pub fn is_unlimited(&self) -> bool {
        matches!(self.target, Target::Unlimited)
    }
}

/// Admission decision engine.
pub struct AdmissionEngine<S: ?Sized = InMemoryCounterStore, K = NullSink> {
    rules: RuleRegistry,
    extractor: Arc<dyn IdentityExtractor>,
    identity_fallback: IdentityFallback,
    store: Arc<S>,
    degradation: DegradationPolicy,
    store_timeout: Duration,
    fallback_retry_after: Duration,
    clock: Arc<dyn Clock>,
    sink: K,
    sweeper: Option<SweeperHandle>,
}

impl<S: ?Sized, K> fmt::Debug for AdmissionEngine<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("rules", &self.rules)
            .field("extractor", &self.extractor)
            .field("identity_fallback", &self.identity_fallback)
            .field("degradation", &self.degradation)
            .field("store_timeout", &self.store_timeout)
            .field("fallback_retry_after", &self.fallback_retry_after)
            .field("sweeper", &self.sweeper.is_some())
            .finish_non_exhaustive()
    }
}

impl AdmissionEngine {
    /// Start building an engine over `rules`, with an in-memory store and no telemetry.
    pub fn builder(rules: RuleRegistry) -> AdmissionEngineBuilder {
        AdmissionEngineBuilder {
            rules,
            extractor: Arc::new(PeerAddrExtractor),
            identity_fallback: IdentityFallback::default(),
            store: Arc::new(InMemoryCounterStore::new()),
            degradation: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fallback_retry_after: DEFAULT_FALLBACK_RETRY_AFTER,
            clock: Arc::new(MonotonicClock::default()),
            sink: NullSink,
            sweep_interval: None,
        }
    }
}

impl<S, K> AdmissionEngine<S, K>
where
    S: CounterStore + ?Sized,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    /// Resolve the rule and extract the identity for `request`. Never suspends.
    pub fn prepare(&self, request: &RequestMeta<'_>) -> PreparedCheck {
        match self.rules.resolution(request.route()) {
            Resolution::Unlimited => {
                PreparedCheck { route: Arc::from(request.route()), target: Target::Unlimited }
            }
            Resolution::Limited(rule) => {
                let identity = rule.identity().unwrap_or(&self.extractor).extract(request);
                PreparedCheck {
                    route: rule.route_id().clone(),
                    target: Target::Limited { rule, identity },
                }
            }
        }
    }

    /// Finish a prepared check: apply the identity fallback, then record and decide.
    pub async fn admit(&self, check: PreparedCheck) -> Result<Admission, QuotaExceeded> {
        let (rule, identity) = match check.target {
            Target::Unlimited => return Ok(Admission::Unlimited),
            Target::Limited { rule, identity } => (rule, identity),
        };
        let key = match identity {
            Ok(key) => key,
            Err(error) => self.identity_unavailable(&rule, error).await?,
        };
        self.check_rule(&key, &rule).await
    }

    /// Check an incoming request.
    ///
    /// Route and peer are read from request extensions (see [`RequestMeta::from_request`]).
    pub fn check_request<B>(
        &self,
        request: &Request<B>,
    ) -> impl Future<Output = Result<Admission, QuotaExceeded>> + Send + '_
    where
        K: Sync,
    {
        self.check(&RequestMeta::from_request(request))
    }

    /// Check a request described by its metadata.
    pub fn check(
        &self,
        request: &RequestMeta<'_>,
    ) -> impl Future<Output = Result<Admission, QuotaExceeded>> + Send + '_
    where
        K: Sync,
    {
        let prepared = self.prepare(request);
        self.admit(prepared)
    }

    /// Check a request from an already-known caller.
    pub async fn check_key(
        &self,
        key: &ClientKey,
        route: &str,
    ) -> Result<Admission, QuotaExceeded> {
        match self.rules.resolution(route) {
            Resolution::Unlimited => Ok(Admission::Unlimited),
            Resolution::Limited(rule) => self.check_rule(key, &rule).await,
        }
    }

    async fn check_rule(
        &self,
        key: &ClientKey,
        rule: &RouteRule,
    ) -> Result<Admission, QuotaExceeded> {
        let now = self.clock.now_millis();
        let outcome = match tokio::time::timeout(
            self.store_timeout,
            self.store.record_and_check(key, rule, now),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };

        match outcome {
            Ok(decision) if decision.admitted => {
                self.emit(AdmissionEvent::Admitted {
                    route: rule.rule_id().clone(),
                    remaining: decision.remaining,
                })
                .await;
                Ok(Admission::Limited(decision))
            }
            Ok(decision) => {
                debug!(
                    target: "quotagate::engine",
                    route = %rule.route(),
                    client = %key,
                    retry_after_ms = decision.retry_after.as_millis() as u64,
                    "quota exceeded"
                );
                let rejection = QuotaExceeded::quota(
                    rule.route_id().clone(),
                    decision.limit,
                    decision.retry_after,
                );
                self.emit_rejected(rule, &rejection).await;
                Err(rejection)
            }
            Err(error) => self.degrade(rule, error).await,
        }
    }

    async fn degrade(
        &self,
        rule: &RouteRule,
        error: StoreError,
    ) -> Result<Admission, QuotaExceeded> {
        warn!(
            target: "quotagate::engine",
            route = %rule.route(),
            policy = self.degradation.as_str(),
            error = %error,
            "counter store unavailable"
        );
        self.emit(AdmissionEvent::StoreUnavailable {
            route: rule.rule_id().clone(),
            policy: self.degradation,
            error,
        })
        .await;
        match self.degradation {
            DegradationPolicy::FailOpen => Ok(Admission::Degraded),
            DegradationPolicy::FailClosed => {
                let rejection = self.fallback_rejection(rule, RejectCause::StoreUnavailable);
                self.emit_rejected(rule, &rejection).await;
                Err(rejection)
            }
        }
    }

    async fn identity_unavailable(
        &self,
        rule: &RouteRule,
        error: IdentityError,
    ) -> Result<ClientKey, QuotaExceeded> {
        warn!(
            target: "quotagate::engine",
            route = %rule.route(),
            fallback = ?self.identity_fallback,
            error = %error,
            "caller identity unavailable"
        );
        self.emit(AdmissionEvent::IdentityUnavailable {
            route: rule.rule_id().clone(),
            fallback: self.identity_fallback,
            error,
        })
        .await;
        match self.identity_fallback {
            IdentityFallback::SharedAnonymous => Ok(ClientKey::anonymous()),
            IdentityFallback::Reject => {
                let rejection = self.fallback_rejection(rule, RejectCause::IdentityUnavailable);
                self.emit_rejected(rule, &rejection).await;
                Err(rejection)
            }
        }
    }

    fn fallback_rejection(&self, rule: &RouteRule, cause: RejectCause) -> QuotaExceeded {
        QuotaExceeded {
            route: rule.route_id().clone(),
            retry_after: self.fallback_retry_after,
            limit: None,
            cause,
        }
    }

    /// Events are labelled by rule id so default-rule traffic shares one label.
    async fn emit_rejected(&self, rule: &RouteRule, rejection: &QuotaExceeded) {
        self.emit(AdmissionEvent::Rejected {
            route: rule.rule_id().clone(),
            cause: rejection.cause,
            retry_after: rejection.retry_after,
        })
        .await;
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    /// Sweep idle windows every `interval` on a background task, reporting to this engine's sink.
    ///
    /// Must be called from within a tokio runtime. For a sweeper owned by the engine, use
    /// [`AdmissionEngineBuilder::sweep_interval`] instead.
    ///
    /// # Errors
    /// [`ConfigError::InvalidEviction`] for a zero interval.
    pub fn spawn_sweeper(&self, interval: Duration) -> Result<SweeperHandle, ConfigError>
    where
        S: 'static,
    {
        spawn_sweeper(self.store.clone(), self.clock.clone(), interval, self.sink.clone())
    }
}

impl<S: ?Sized, K> AdmissionEngine<S, K> {
    /// Rules in effect.
    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Degradation policy in effect.
    pub fn degradation(&self) -> DegradationPolicy {
        self.degradation
    }

    /// Identity fallback in effect.
    pub fn identity_fallback(&self) -> IdentityFallback {
        self.identity_fallback
    }

    /// Bound on each store call.
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Telemetry sink.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Whether the engine runs its own background sweeper.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper.as_ref().is_some_and(SweeperHandle::is_running)
    }
}

/// Builder for [`AdmissionEngine`].
pub struct AdmissionEngineBuilder<S: ?Sized = InMemoryCounterStore, K = NullSink> {
    rules: RuleRegistry,
    extractor: Arc<dyn IdentityExtractor>,
    identity_fallback: IdentityFallback,
    store: Arc<S>,
    degradation: Option<DegradationPolicy>,
    store_timeout: Duration,
    fallback_retry_after: Duration,
    clock: Arc<dyn Clock>,
    sink: K,
    sweep_interval: Option<Duration>,
}

impl<S: ?Sized, K> fmt::Debug for AdmissionEngineBuilder<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEngineBuilder")
            .field("rules", &self.rules)
            .field("degradation", &self.degradation)
            .field("store_timeout", &self.store_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl<S: ?Sized, K> AdmissionEngineBuilder<S, K> {
    /// Engine-wide identity extractor; rules may override it.
    pub fn extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// What to do when no identity can be extracted.
    pub fn identity_fallback(mut self, fallback: IdentityFallback) -> Self {
        self.identity_fallback = fallback;
        self
    }

    /// Policy applied when the store fails. Required.
    pub fn degradation(mut self, policy: DegradationPolicy) -> Self {
        self.degradation = Some(policy);
        self
    }

    /// Bound on each store call; a timeout counts as the store being unavailable.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Retry-after handed out for identity and fail-closed store rejections.
    pub fn fallback_retry_after(mut self, retry_after: Duration) -> Self {
        self.fallback_retry_after = retry_after;
        self
    }

    /// Run a background sweeper every `interval`, owned by the engine and stopped with it.
    ///
    /// `build()` must then be called from within a tokio runtime.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Override the clock (tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use another counter store.
    pub fn store<S2: CounterStore>(self, store: S2) -> AdmissionEngineBuilder<S2, K> {
        self.shared_store(Arc::new(store))
    }

    /// Use a counter store that is also held elsewhere.
    pub fn shared_store<S2: CounterStore + ?Sized>(
        self,
        store: Arc<S2>,
    ) -> AdmissionEngineBuilder<S2, K> {
        AdmissionEngineBuilder {
            rules: self.rules,
            extractor: self.extractor,
            identity_fallback: self.identity_fallback,
            store,
            degradation: self.degradation,
            store_timeout: self.store_timeout,
            fallback_retry_after: self.fallback_retry_after,
            clock: self.clock,
            sink: self.sink,
            sweep_interval: self.sweep_interval,
        }
    }

    /// Send admission events to `sink`.
    pub fn sink<K2: TelemetrySink>(self, sink: K2) -> AdmissionEngineBuilder<S, K2> {
        AdmissionEngineBuilder {
            rules: self.rules,
            extractor: self.extractor,
            identity_fallback: self.identity_fallback,
            store: self.store,
            degradation: self.degradation,
            store_timeout: self.store_timeout,
            fallback_retry_after: self.fallback_retry_after,
            clock: self.clock,
            sink,
            sweep_interval: self.sweep_interval,
        }
    }
}

impl<S, K> AdmissionEngineBuilder<S, K>
where
    S: CounterStore + ?Sized + 'static,
    K: TelemetrySink,
    K::Future: Send + 'static,
{
    /// Validate and build.
    ///
    /// # Errors
    /// [`ConfigError::MissingDegradationPolicy`] if no policy was chosen,
    /// [`ConfigError::InvalidStoreTimeout`] for a zero timeout. With a sweep interval,
    /// [`ConfigError::InvalidEviction`] if it is zero and [`ConfigError::NoRuntime`] outside a
    /// tokio runtime.
    pub fn build(self) -> Result<AdmissionEngine<S, K>, ConfigError> {
        let degradation = self.degradation.ok_or(ConfigError::MissingDegradationPolicy)?;
        if self.store_timeout.is_zero() {
            return Err(ConfigError::InvalidStoreTimeout);
        }
        let sweeper = match self.sweep_interval {
            Some(interval) => {
                tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
                Some(spawn_sweeper(
                    self.store.clone(),
                    self.clock.clone(),
                    interval,
                    self.sink.clone(),
                )?)
            }
            None => None,
        };
        debug!(
            target: "quotagate::engine",
            routes = self.rules.len(),
            policy = degradation.as_str(),
            store_timeout_ms = self.store_timeout.as_millis() as u64,
            sweeper = sweeper.is_some(),
            "admission engine built"
        );
        Ok(AdmissionEngine {
            rules: self.rules,
            extractor: self.extractor,
            identity_fallback: self.identity_fallback,
            store: self.store,
            degradation,
            store_timeout: self.store_timeout,
            fallback_retry_after: self.fallback_retry_after,
            clock: self.clock,
            sink: self.sink,
            sweeper,
        })
    }
}
