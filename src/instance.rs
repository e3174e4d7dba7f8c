//! Instance identities, handles and readiness state
//!
//! An instance is addressed only by its [`InstanceIdentity`]. Identities are
//! either caller-chosen (the raw request path for `/specific/...` routes) or
//! pool slot names of the form `lb-<i>`.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use serde::Serialize;
use std::fmt;

/// Body type of every response produced or forwarded by the gateway
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A fully buffered inbound request. Buffering makes the request cheap to
/// clone, so a forwarding attempt never consumes the caller's copy.
pub type InstanceRequest = Request<Bytes>;

/// Response returned by an instance or synthesized by the gateway
pub type InstanceResponse = Response<ProxyBody>;

/// Prefix of pool slot identities
const POOL_SLOT_PREFIX: &str = "lb-";

/// Stable key used to locate or create an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Identity of the pool slot `index`
    pub fn pool_slot(index: u32) -> Self {
        Self(format!("{}{}", POOL_SLOT_PREFIX, index))
    }

    /// Slot index if this identity names a pool slot
    pub fn slot_index(&self) -> Option<u32> {
        self.0.strip_prefix(POOL_SLOT_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceIdentity {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for InstanceIdentity {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Operational snapshot of one managed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceHandle {
    pub identity: InstanceIdentity,
    pub running: bool,
    /// Host port the instance's exposed port is reachable on (0 if none)
    pub port: u16,
}

/// Readiness of an instance as seen by its supervisor.
///
/// Held in memory only. A freshly created supervisor starts at `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    #[default]
    Unknown,
    /// `start()` has been issued for the current attempt
    Starting,
    /// Waiting on a network probe
    Probing,
    Ready,
    Unavailable,
}

/// Copy a buffered request: method, URI, version, headers and body.
/// Extensions are not carried over.
pub fn clone_request(request: &InstanceRequest) -> InstanceRequest {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// Wrap bytes in a [`ProxyBody`]
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// An empty [`ProxyBody`]
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
