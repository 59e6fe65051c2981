//! Caller identification.
//!
//! An [`IdentityExtractor`] turns request metadata into a [`ClientKey`]. Extraction is a pure
//! function of the request: no I/O, no suspension. Which extractor runs is a deployment choice:
//!
//! - [`PeerAddrExtractor`] (default) keys by the immediate network peer. Callers behind one NAT
//!   share a budget.
//! - [`ForwardedForExtractor`] trusts a forwarded-for header, for deployments behind known proxies.
//! - [`HeaderKeyExtractor`] keys by an API-key header (hashed before use).

use crate::error::{ConfigError, IdentityError};
use http::{HeaderMap, HeaderName, Request};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

const ANONYMOUS: &str = "anonymous";

/// Opaque, non-empty caller identity. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    /// Build a key; returns `None` for empty or whitespace-only input.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(Arc::from(trimmed)))
        }
    }

    /// The single shared key used when identity is unavailable and the fallback is
    /// [`IdentityFallback::SharedAnonymous`].
    pub fn anonymous() -> Self {
        Self(Arc::from(ANONYMOUS))
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Peer address of the connection, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub SocketAddr);

/// Route identifier, inserted into request extensions by the router.
///
/// When absent, the request path is used as the route id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteId(pub Arc<str>);

impl RouteId {
    /// Wrap a route name.
    pub fn new(route: impl Into<Arc<str>>) -> Self {
        Self(route.into())
    }
}

/// The parts of a request identity extraction may look at.
#[derive(Debug, Clone)]
pub struct RequestMeta<'a> {
    route: &'a str,
    headers: &'a HeaderMap,
    peer: Option<SocketAddr>,
}

impl<'a> RequestMeta<'a> {
    /// Metadata for a request to `route` with no known peer.
    pub fn new(route: &'a str, headers: &'a HeaderMap) -> Self {
        Self { route, headers, peer: None }
    }

    /// Attach the peer address.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Read route, headers and peer from an `http::Request`.
    ///
    /// The peer comes from a [`PeerAddr`] extension, or a bare `SocketAddr` extension; the route
    /// from a [`RouteId`] extension, falling back to the URI path.
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        let extensions = request.extensions();
        let route = extensions
            .get::<RouteId>()
            .map(|id| &*id.0)
            .unwrap_or_else(|| request.uri().path());
        let peer = extensions
            .get::<PeerAddr>()
            .map(|p| p.0)
            .or_else(|| extensions.get::<SocketAddr>().copied());
        Self { route, headers: request.headers(), peer }
    }

    /// Route id the request addresses.
    pub fn route(&self) -> &'a str {
        self.route
    }

    /// Request headers.
    pub fn headers(&self) -> &'a HeaderMap {
        self.headers
    }

    /// Immediate network peer, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Strategy deriving a [`ClientKey`] from a request.
pub trait IdentityExtractor: Send + Sync + fmt::Debug {
    /// Derive the key, or report why none is available.
    fn extract(&self, request: &RequestMeta<'_>) -> Result<ClientKey, IdentityError>;
}

/// Fold IPv4-mapped IPv6 addresses onto IPv4 so one caller has one key.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

fn ip_key(ip: IpAddr) -> ClientKey {
    ClientKey(Arc::from(normalize_ip(ip).to_string()))
}

/// Keys callers by the immediate peer address, port dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddrExtractor;

impl IdentityExtractor for PeerAddrExtractor {
    fn extract(&self, request: &RequestMeta<'_>) -> Result<ClientKey, IdentityError> {
        request.peer().map(|addr| ip_key(addr.ip())).ok_or(IdentityError::MissingPeerAddr)
    }
}

/// Keys callers by a forwarded-for header written by trusted reverse proxies.
///
/// With `trusted_hops = n`, the n-th entry from the right is taken: every trusted proxy appends
/// the address it received the request from, so entries further left are caller-controlled.
#[derive(Debug, Clone)]
pub struct ForwardedForExtractor {
    header: HeaderName,
    trusted_hops: usize,
}

impl ForwardedForExtractor {
    /// Read `header`, trusting `trusted_hops` proxies (at least one).
    pub fn new(header: HeaderName, trusted_hops: usize) -> Self {
        Self { header, trusted_hops: trusted_hops.max(1) }
    }

    /// `X-Forwarded-For` behind a single trusted proxy.
    pub fn x_forwarded_for() -> Self {
        Self::new(HeaderName::from_static("x-forwarded-for"), 1)
    }

    fn parse_hop(raw: &str) -> Option<IpAddr> {
        raw.parse::<IpAddr>().ok().or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
    }
}

impl IdentityExtractor for ForwardedForExtractor {
    fn extract(&self, request: &RequestMeta<'_>) -> Result<ClientKey, IdentityError> {
        let header = self.header.as_str().to_string();
        // Repeated headers are one logical comma-separated list.
        let mut hops = Vec::new();
        for value in request.headers().get_all(&self.header) {
            let text = value
                .to_str()
                .map_err(|_| IdentityError::InvalidHeader { header: header.clone() })?;
            hops.extend(text.split(',').map(str::trim).filter(|h| !h.is_empty()));
        }
        if hops.is_empty() {
            return Err(IdentityError::MissingHeader { header });
        }
        if hops.len() < self.trusted_hops {
            return Err(IdentityError::ShortForwardChain {
                header,
                found: hops.len(),
                trusted_hops: self.trusted_hops,
            });
        }
        let hop = hops[hops.len() - self.trusted_hops];
        Self::parse_hop(hop).map(ip_key).ok_or(IdentityError::InvalidHeader { header })
    }
}

/// Keys callers by an API-key header. The value is SHA-256 hashed so no secret is retained.
#[derive(Debug, Clone)]
pub struct HeaderKeyExtractor {
    header: HeaderName,
}

impl HeaderKeyExtractor {
    /// Read the key from `header`.
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl IdentityExtractor for HeaderKeyExtractor {
    fn extract(&self, request: &RequestMeta<'_>) -> Result<ClientKey, IdentityError> {
        let header = self.header.as_str().to_string();
        let value = request
            .headers()
            .get(&self.header)
            .ok_or_else(|| IdentityError::MissingHeader { header: header.clone() })?;
        let text = value
            .to_str()
            .map_err(|_| IdentityError::InvalidHeader { header: header.clone() })?
            .trim();
        if text.is_empty() {
            return Err(IdentityError::MissingHeader { header });
        }
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Ok(ClientKey(Arc::from(format!("key:{:x}", hasher.finalize()))))
    }
}

/// What to do when a request yields no identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityFallback {
    /// Count the request against the single [`ClientKey::anonymous`] key.
    #[default]
    SharedAnonymous,
    /// Reject the request outright.
    Reject,
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_trusted_hops() -> usize {
    1
}

/// Configurable choice of extractor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// [`PeerAddrExtractor`].
    #[default]
    PeerAddress,
    /// [`ForwardedForExtractor`].
    ForwardedFor {
        /// Header to read.
        #[serde(default = "default_forwarded_header")]
        header: String,
        /// Number of trusted proxies in front of the service.
        #[serde(default = "default_trusted_hops")]
        trusted_hops: usize,
    },
    /// [`HeaderKeyExtractor`].
    Header {
        /// Header carrying the API key.
        header: String,
    },
}

impl IdentityStrategy {
    /// Instantiate the extractor.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidHeaderName`] for malformed header names.
    pub fn build(&self) -> Result<Arc<dyn IdentityExtractor>, ConfigError> {
        fn header_name(raw: &str) -> Result<HeaderName, ConfigError> {
            HeaderName::from_bytes(raw.trim().as_bytes())
                .map_err(|_| ConfigError::InvalidHeaderName(raw.to_string()))
        }
        Ok(match self {
            IdentityStrategy::PeerAddress => Arc::new(PeerAddrExtractor),
            IdentityStrategy::ForwardedFor { header, trusted_hops } => {
                Arc::new(ForwardedForExtractor::new(header_name(header)?, *trusted_hops))
            }
            IdentityStrategy::Header { header } => {
                Arc::new(HeaderKeyExtractor::new(header_name(header)?))
            }
        })
    }
}
