//! Connection pool for instance HTTP connections
//!
//! Both runtimes reach their instances through loopback host ports. The pool
//! keeps connections to those ports alive across requests and translates
//! client failures into [`PlatformError`] kinds.

use crate::error::PlatformError;
use crate::instance::{InstanceRequest, InstanceResponse};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to instances
pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `127.0.0.1:<host_port>`.
    ///
    /// Only the path and query of the request URI are kept. The original
    /// authority is carried in the `Host` header when the request has none.
    pub async fn send(
        &self,
        req: &InstanceRequest,
        host_port: u16,
    ) -> Result<InstanceResponse, PlatformError> {
        let backend_req = build_backend_request(req, host_port)?;

        self.stats.record_request();
        trace!(port = host_port, uri = %backend_req.uri(), "Sending request to instance");

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(classify_client_error(&e));
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn build_backend_request(
    req: &InstanceRequest,
    host_port: u16,
) -> Result<Request<Full<Bytes>>, PlatformError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://127.0.0.1:{}{}", host_port, path);

    let mut builder = Request::builder()
        .method(req.method().clone())
        .uri(&uri)
        .version(hyper::Version::HTTP_11);

    for (key, value) in req.headers().iter() {
        builder = builder.header(key, value);
    }

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                builder = builder.header(HOST, value);
            }
        }
    }

    builder
        .body(Full::new(req.body().clone()))
        .map_err(|e| PlatformError::Unknown(format!("Request build error: {}", e)))
}

/// Map a client failure onto the closed error kinds
fn classify_client_error(err: &hyper_util::client::legacy::Error) -> PlatformError {
    if err.is_connect() {
        PlatformError::NotListening(err.to_string())
    } else {
        // Connection reset, closed mid-response, protocol errors
        PlatformError::ProxyUnreachable(err.to_string())
    }
}
