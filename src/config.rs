//! Startup configuration.
//!
//! Loaded once, validated, then turned into a [`RuleRegistry`] and an [`AdmissionEngine`].
//! Sources, lowest priority first: an optional JSON/TOML file, then `QUOTAGATE_*` environment
//! variables (`__` separates nested keys, e.g. `QUOTAGATE_EVICTION__IDLE_MULTIPLE=5`).
//! Unknown keys from either source fail loading, so the `QUOTAGATE_` namespace is reserved.
//!
//! ```json
//! {
//!   "routes": {
//!     "/chat": "5 per minute",
//!     "/search": { "quota": 30, "window_secs": 60 },
//!     "/keys": { "limit": "10/second", "identity": { "kind": "header", "header": "x-api-key" } }
//!   },
//!   "default_limit": ["200 per day", "50 per hour"],
//!   "exempt": ["/health"],
//!   "degradation": "fail_open",
//!   "store_timeout_ms": 50,
//!   "eviction": { "sweep_interval_ms": 30000 }
//! }
//! ```
//!
//! With `eviction.sweep_interval_ms` set, [`AdmissionEngine::from_config`] starts a background
//! sweeper owned by the engine and must run inside a tokio runtime. Without it the in-memory
//! store sweeps inline every [`DEFAULT_SWEEP_EVERY`](crate::degradation::DEFAULT_SWEEP_EVERY)
//! calls unless `sweep_every` says otherwise.

use crate::degradation::{DegradationPolicy, EvictionPolicy};
use crate::engine::{AdmissionEngine, AdmissionEngineBuilder};
use crate::error::ConfigError;
use crate::identity::{IdentityFallback, IdentityStrategy};
use crate::rule::{Limit, RouteRule, RuleRegistry, UnregisteredRoutes, DEFAULT_ROUTE};
use crate::store::InMemoryCounterStore;
use ::config::Environment;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables read by [`AdmissionConfig::load`].
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// A quota per window, as an expression, as explicit fields, or a list of either.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LimitSpec {
    /// `"5 per minute"`, `"10/second"`, `"200 per day; 50 per hour"`.
    Expr(String),
    /// `{ "quota": 5, "window_secs": 60 }`.
    Explicit {
        /// Requests admitted per window.
        quota: u32,
        /// Window length in seconds.
        window_secs: u64,
    },
    /// Stacked limits, all enforced: `["200 per day", "50 per hour"]`.
    List(Vec<LimitSpec>),
}

impl LimitSpec {
    /// Resolve to the limits it names; `route` names the entry in errors.
    pub fn to_limits(&self, route: &str) -> Result<Vec<Limit>, ConfigError> {
        match self {
            LimitSpec::Expr(expr) => Limit::parse_many(expr)
                .map_err(|source| ConfigError::InvalidLimit { route: route.to_string(), source }),
            LimitSpec::Explicit { quota, window_secs } => {
                Ok(vec![Limit::new(*quota, Duration::from_secs(*window_secs))])
            }
            LimitSpec::List(specs) => {
                let mut limits = Vec::with_capacity(specs.len());
                for spec in specs {
                    limits.extend(spec.to_limits(route)?);
                }
                Ok(limits)
            }
        }
    }
}

/// One route entry: a bare limit, or a limit with its own identity strategy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RouteConfig {
    /// Limit only; the engine-wide identity strategy applies.
    Limit(LimitSpec),
    /// Limit plus a per-route identity strategy.
    Detailed {
        /// The limit.
        limit: LimitSpec,
        /// Overrides the engine-wide strategy for this route.
        #[serde(default)]
        identity: Option<IdentityStrategy>,
    },
}

impl RouteConfig {
    fn parts(&self) -> (&LimitSpec, Option<&IdentityStrategy>) {
        match self {
            RouteConfig::Limit(limit) => (limit, None),
            RouteConfig::Detailed { limit, identity } => (limit, identity.as_ref()),
        }
    }
}

/// Admission-control configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Route id to rule.
    pub routes: BTreeMap<String, RouteConfig>,
    /// Routes never limited.
    pub exempt: Vec<String>,
    /// Rule for unregistered routes.
    #[serde(alias = "default_limits")]
    pub default_limit: Option<LimitSpec>,
    /// Whether unregistered routes get the default rule or no limit.
    pub unregistered: UnregisteredRoutes,
    /// Engine-wide identity strategy.
    pub identity: IdentityStrategy,
    /// What to do when no identity can be extracted.
    pub identity_fallback: IdentityFallback,
    /// Required; startup fails without it.
    pub degradation: Option<DegradationPolicy>,
    /// Bound on each store call.
    pub store_timeout_ms: u64,
    /// Retry-after for identity and fail-closed rejections.
    pub fallback_retry_after_ms: u64,
    /// In-memory store eviction.
    pub eviction: EvictionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
            exempt: Vec::new(),
            default_limit: None,
            unregistered: UnregisteredRoutes::default(),
            identity: IdentityStrategy::default(),
            identity_fallback: IdentityFallback::default(),
            degradation: None,
            store_timeout_ms: 50,
            fallback_retry_after_ms: 1_000,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl AdmissionConfig {
    /// Load from an optional file plus `QUOTAGATE_*` environment variables.
    ///
    /// # Errors
    /// [`ConfigError::Load`] if the file is missing or unreadable, or the merged values do not
    /// deserialize. Nothing is validated here; see [`AdmissionConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__").try_parsing(true)
    }

    fn load_from(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder
            .add_source(env)
            .build()
            .map_err(|e| ConfigError::Load(format!("failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("failed to deserialize configuration: {}", e)))
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Build the rule registry.
    pub fn registry(&self) -> Result<RuleRegistry, ConfigError> {
        let mut builder = RuleRegistry::builder().unregistered(self.unregistered);
        for (route, entry) in &self.routes {
            let (limit, identity) = entry.parts();
            let mut rule = RouteRule::from_limits(route.as_str(), limit.to_limits(route)?)?;
            if let Some(strategy) = identity {
                rule = rule.with_identity(strategy.build()?);
            }
            builder = builder.rule(rule);
        }
        for route in &self.exempt {
            builder = builder.exempt(route.as_str());
        }
        if let Some(default) = &self.default_limit {
            builder = builder.default_limits(default.to_limits(DEFAULT_ROUTE)?)?;
        }
        builder.build()
    }

    /// Check everything a deployment needs before it may start. Starts no sweeper.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_builder()?.build().map(|_| ())
    }

    /// Engine builder with everything configured and an in-memory store.
    ///
    /// Replace the store or add a telemetry sink before calling `build()`. A configured
    /// `sweep_interval_ms` is carried over, so `build()` then spawns the engine's sweeper.
    pub fn engine_builder(&self) -> Result<AdmissionEngineBuilder, ConfigError> {
        let builder = self.base_builder()?;
        Ok(match self.eviction.sweep_interval() {
            Some(interval) => builder.sweep_interval(interval),
            None => builder,
        })
    }

    fn base_builder(&self) -> Result<AdmissionEngineBuilder, ConfigError> {
        if self.degradation.is_none() {
            return Err(ConfigError::MissingDegradationPolicy);
        }
        self.eviction.validate()?;
        let mut builder = AdmissionEngine::builder(self.registry()?)
            .extractor(self.identity.build()?)
            .identity_fallback(self.identity_fallback)
            .store_timeout(Duration::from_millis(self.store_timeout_ms))
            .fallback_retry_after(Duration::from_millis(self.fallback_retry_after_ms))
            .store(InMemoryCounterStore::with_eviction(self.eviction));
        if let Some(policy) = self.degradation {
            builder = builder.degradation(policy);
        }
        Ok(builder)
    }
}

impl AdmissionEngine {
    /// Build an engine with an in-memory store from validated configuration.
    ///
    /// Spawns the background sweeper when `eviction.sweep_interval_ms` is set.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        config.engine_builder()?.build()
    }
}
