//! Route rules and the immutable registry that resolves them.
//!
//! Rules are assembled once at startup with [`RuleRegistry::builder`] and frozen by `build()`.
//! Clones of a registry share the same rules, and nothing can change them afterwards, so
//! resolving a route twice always yields the same rule.

use crate::error::{AdmissionError, ConfigError, LimitParseError};
use crate::identity::IdentityExtractor;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Route id under which the default rule is reported.
pub const DEFAULT_ROUTE: &str = "*";

/// A quota per window, e.g. 5 requests per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limit {
    quota: u32,
    window: Duration,
}

impl Limit {
    /// Build a limit. Validity (quota > 0, window >= 1ms) is checked when it becomes a rule.
    pub const fn new(quota: u32, window: Duration) -> Self {
        Self { quota, window }
    }

    /// `quota` requests per second.
    pub const fn per_second(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(1))
    }

    /// `quota` requests per minute.
    pub const fn per_minute(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(60))
    }

    /// `quota` requests per hour.
    pub const fn per_hour(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(3_600))
    }

    /// `quota` requests per day.
    pub const fn per_day(quota: u32) -> Self {
        Self::new(quota, Duration::from_secs(86_400))
    }

    /// Requests admitted per window.
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in whole milliseconds (>= 1).
    pub fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    /// Parse a stacked expression such as `"200 per day; 50 per hour"`.
    ///
    /// Limits are separated by `;`, `,` or `|`.
    pub fn parse_many(s: &str) -> Result<Vec<Limit>, LimitParseError> {
        let limits = s
            .split([';', ',', '|'])
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Limit>, _>>()?;
        if limits.is_empty() {
            return Err(LimitParseError::Malformed(s.to_string()));
        }
        Ok(limits)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {:?}", self.quota, self.window)
    }
}

fn unit_seconds(unit: &str) -> Option<u64> {
    let singular = unit.strip_suffix('s').unwrap_or(unit);
    match singular {
        "second" | "sec" => Some(1),
        "minute" | "min" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        _ => None,
    }
}

/// Parses `"<count> per <unit>"`, `"<count>/<unit>"` and `"<count> per <n> <units>"`.
impl FromStr for Limit {
    type Err = LimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let (count, period) = text
            .split_once('/')
            .or_else(|| text.split_once(" per "))
            .ok_or_else(|| LimitParseError::Malformed(s.to_string()))?;

        let quota = count
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| LimitParseError::InvalidCount(s.to_string()))?;

        let parts: Vec<&str> = period.split_whitespace().collect();
        let (multiplier, unit) = match parts.as_slice() {
            [unit] => (1, *unit),
            [n, unit] => {
                let n = n
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| LimitParseError::Malformed(s.to_string()))?;
                (n, *unit)
            }
            _ => return Err(LimitParseError::Malformed(s.to_string())),
        };
        let secs =
            unit_seconds(unit).ok_or_else(|| LimitParseError::UnknownUnit(unit.to_string()))?;
        Ok(Limit::new(quota, Duration::from_secs(secs.saturating_mul(multiplier))))
    }
}

/// Immutable rate-limit rule for one route.
///
/// A rule carries one or more limits. A request is admitted only if every limit has room.
#[derive(Debug, Clone)]
pub struct RouteRule {
    route: Arc<str>,
    rule_id: Arc<str>,
    limits: Vec<Limit>,
    identity: Option<Arc<dyn IdentityExtractor>>,
}

impl PartialEq for RouteRule {
    fn eq(&self, other: &Self) -> bool {
        let same_identity = match (&self.identity, &other.identity) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.route == other.route
            && self.rule_id == other.rule_id
            && self.limits == other.limits
            && same_identity
    }
}

impl RouteRule {
    /// Validate and build a rule.
    ///
    /// # Errors
    /// Empty route, zero quota, or a window under one millisecond.
    pub fn new(
        route: impl Into<Arc<str>>,
        quota: u32,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        Self::from_limit(route, Limit::new(quota, window))
    }

    /// Build a rule from a [`Limit`].
    pub fn from_limit(route: impl Into<Arc<str>>, limit: Limit) -> Result<Self, ConfigError> {
        Self::from_limits(route, [limit])
    }

    /// Build a rule that enforces every limit in `limits` at once.
    ///
    /// # Errors
    /// Empty route, no limits, or any limit with a zero quota or a sub-millisecond window.
    pub fn from_limits(
        route: impl Into<Arc<str>>,
        limits: impl IntoIterator<Item = Limit>,
    ) -> Result<Self, ConfigError> {
        let route = route.into();
        if route.trim().is_empty() {
            return Err(ConfigError::EmptyRoute);
        }
        let limits: Vec<Limit> = limits.into_iter().collect();
        if limits.is_empty() {
            return Err(ConfigError::NoLimits { route: route.to_string() });
        }
        for limit in &limits {
            if limit.quota == 0 {
                return Err(ConfigError::InvalidQuota { route: route.to_string() });
            }
            if limit.window < Duration::from_millis(1) {
                return Err(ConfigError::InvalidWindow {
                    route: route.to_string(),
                    window: limit.window,
                });
            }
        }
        Ok(Self { rule_id: route.clone(), route, limits, identity: None })
    }

    /// Build a rule from a limit expression such as `"30 per minute"` or
    /// `"200 per day; 50 per hour"`.
    pub fn parse(route: impl Into<Arc<str>>, expr: &str) -> Result<Self, ConfigError> {
        let route = route.into();
        let limits = Limit::parse_many(expr)
            .map_err(|source| ConfigError::InvalidLimit { route: route.to_string(), source })?;
        Self::from_limits(route, limits)
    }

    /// Use a dedicated identity extractor for this route instead of the engine-wide one.
    pub fn with_identity(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.identity = Some(extractor);
        self
    }

    /// Route id the rule is keyed under.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Shared route id.
    pub fn route_id(&self) -> &Arc<str> {
        &self.route
    }

    /// Id of the rule that matched: the route for registered rules, [`DEFAULT_ROUTE`] for
    /// traffic counted under the default rule.
    pub fn rule_id(&self) -> &Arc<str> {
        &self.rule_id
    }

    /// Every limit, in the order given. Never empty.
    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    /// The first limit.
    pub fn limit(&self) -> Limit {
        self.limits[0]
    }

    /// Requests admitted per window of the first limit.
    pub fn quota(&self) -> u32 {
        self.limit().quota
    }

    /// Window length of the first limit.
    pub fn window(&self) -> Duration {
        self.limit().window
    }

    /// Window length of the first limit in whole milliseconds (>= 1).
    pub fn window_millis(&self) -> u64 {
        self.limit().window_millis()
    }

    /// Longest window among all limits, in milliseconds.
    pub fn longest_window_millis(&self) -> u64 {
        self.limits.iter().map(Limit::window_millis).max().unwrap_or(1)
    }

    /// Per-route identity override, if any.
    pub fn identity(&self) -> Option<&Arc<dyn IdentityExtractor>> {
        self.identity.as_ref()
    }

    /// Same rule, counted under another route id.
    fn rebound(&self, route: &str) -> Self {
        Self {
            route: Arc::from(route),
            rule_id: self.rule_id.clone(),
            limits: self.limits.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// How routes without a registered rule are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisteredRoutes {
    /// Apply the default rule, counted per route.
    #[default]
    Default,
    /// Do not limit them.
    Unlimited,
}

/// Result of resolving a route with fallbacks applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Requests are counted against this rule.
    Limited(Arc<RouteRule>),
    /// The route is not limited.
    Unlimited,
}

/// Frozen set of route rules.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    rules: Arc<HashMap<Arc<str>, Arc<RouteRule>>>,
    exempt: Arc<HashSet<Arc<str>>>,
    default_rule: Option<Arc<RouteRule>>,
    unregistered: UnregisteredRoutes,
}

impl RuleRegistry {
    /// Start assembling a registry.
    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// Exact lookup of a registered rule.
    ///
    /// # Errors
    /// [`AdmissionError::NoRuleConfigured`] when the route was never registered.
    pub fn resolve(&self, route: &str) -> Result<Arc<RouteRule>, AdmissionError> {
        self.rules
            .get(route)
            .cloned()
            .ok_or_else(|| AdmissionError::NoRuleConfigured { route: route.to_string() })
    }

    /// Resolve with exemptions and the unregistered-route fallback applied.
    pub fn resolution(&self, route: &str) -> Resolution {
        if self.exempt.contains(route) {
            return Resolution::Unlimited;
        }
        match self.resolve(route) {
            Ok(rule) => Resolution::Limited(rule),
            Err(_) => match (self.unregistered, &self.default_rule) {
                (UnregisteredRoutes::Default, Some(default)) => {
                    Resolution::Limited(Arc::new(default.rebound(route)))
                }
                _ => Resolution::Unlimited,
            },
        }
    }

    /// The default rule, if configured.
    pub fn default_rule(&self) -> Option<&Arc<RouteRule>> {
        self.default_rule.as_ref()
    }

    /// Unregistered-route policy.
    pub fn unregistered(&self) -> UnregisteredRoutes {
        self.unregistered
    }

    /// Whether the route is exempt from limiting.
    pub fn is_exempt(&self, route: &str) -> bool {
        self.exempt.contains(route)
    }

    /// Registered route ids, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.rules.keys().map(|r| &**r).collect();
        routes.sort_unstable();
        routes
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Builder for [`RuleRegistry`].
#[derive(Debug, Default)]
pub struct RuleRegistryBuilder {
    rules: Vec<RouteRule>,
    exempt: Vec<String>,
    default_rule: Option<RouteRule>,
    unregistered: UnregisteredRoutes,
}

impl RuleRegistryBuilder {
    /// Register a rule.
    pub fn rule(mut self, rule: RouteRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Register the same limit for several routes.
    pub fn shared_rule<I, R>(mut self, routes: I, limit: Limit) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Arc<str>>,
    {
        for route in routes {
            self.rules.push(RouteRule::from_limit(route, limit)?);
        }
        Ok(self)
    }

    /// Never limit `route`.
    pub fn exempt(mut self, route: impl Into<String>) -> Self {
        self.exempt.push(route.into());
        self
    }

    /// Rule applied to unregistered routes under [`UnregisteredRoutes::Default`].
    pub fn default_limit(self, limit: Limit) -> Result<Self, ConfigError> {
        self.default_limits([limit])
    }

    /// Stacked default rule, e.g. 200 per day and 50 per hour.
    pub fn default_limits(
        mut self,
        limits: impl IntoIterator<Item = Limit>,
    ) -> Result<Self, ConfigError> {
        self.default_rule = Some(RouteRule::from_limits(DEFAULT_ROUTE, limits)?);
        Ok(self)
    }

    /// Policy for unregistered routes.
    pub fn unregistered(mut self, policy: UnregisteredRoutes) -> Self {
        self.unregistered = policy;
        self
    }

    /// Validate and freeze.
    ///
    /// # Errors
    /// Duplicate routes, or [`UnregisteredRoutes::Default`] without a default rule.
    pub fn build(self) -> Result<RuleRegistry, ConfigError> {
        if self.unregistered == UnregisteredRoutes::Default && self.default_rule.is_none() {
            return Err(ConfigError::MissingDefaultRule);
        }
        let mut rules = HashMap::with_capacity(self.rules.len());
        for rule in self.rules {
            let route = rule.route.clone();
            if rules.insert(route.clone(), Arc::new(rule)).is_some() {
                return Err(ConfigError::DuplicateRoute { route: route.to_string() });
            }
        }
        let exempt: HashSet<Arc<str>> = self.exempt.into_iter().map(Arc::from).collect();
        debug!(
            target: "quotagate::rule",
            rules = rules.len(),
            exempt = exempt.len(),
            unregistered = ?self.unregistered,
            "rule registry built"
        );
        Ok(RuleRegistry {
            rules: Arc::new(rules),
            exempt: Arc::new(exempt),
            default_rule: self.default_rule.map(Arc::new),
            unregistered: self.unregistered,
        })
    }
}
