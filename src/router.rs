//! Path-based routing of gateway requests
//!
//! First match wins, prefixes are case-sensitive:
//!
//! | Path prefix   | Target                                      |
//! |---------------|---------------------------------------------|
//! | `/specific/`  | the instance named by the full request path |
//! | `/ls`         | status line from every pool slot            |
//! | `/lb`         | one pool slot picked at random              |
//! | anything else | static homepage                             |

use crate::error::{json_error_response, ErrorResponse, PlatformError, ProxyErrorCode};
use crate::instance::{full, InstanceIdentity, InstanceRequest, InstanceResponse};
use crate::loadbalancer::LoadBalancer;
use crate::supervisor::SupervisorRegistry;
use crate::template::serve_homepage;
use futures::future::join_all;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

const SPECIFIC_PREFIX: &str = "/specific/";
const LIST_PREFIX: &str = "/ls";
const BALANCED_PREFIX: &str = "/lb";

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Specific(InstanceIdentity),
    List,
    Balanced,
    Homepage,
}

impl Route {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with(SPECIFIC_PREFIX) {
            Route::Specific(InstanceIdentity::new(path))
        } else if path.starts_with(LIST_PREFIX) {
            Route::List
        } else if path.starts_with(BALANCED_PREFIX) {
            Route::Balanced
        } else {
            Route::Homepage
        }
    }
}

pub struct Router {
    registry: Arc<SupervisorRegistry>,
    balancer: LoadBalancer,
}

impl Router {
    pub fn new(registry: Arc<SupervisorRegistry>, balancer: LoadBalancer) -> Self {
        Self { registry, balancer }
    }

    /// Route one request. Unclassified failures become a 500.
    pub async fn route(&self, request: InstanceRequest) -> InstanceResponse {
        match self.dispatch(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(path = %request.uri().path(), error = %e, "Request failed");
                json_error_response(ProxyErrorCode::InternalError, e.to_string())
            }
        }
    }

    async fn dispatch(&self, request: &InstanceRequest) -> Result<InstanceResponse, PlatformError> {
        match Route::for_path(request.uri().path()) {
            Route::Specific(identity) => self.delegate(&identity, request).await,
            Route::List => Ok(self.list().await),
            Route::Balanced => match self.balancer.select() {
                Some(identity) => self.delegate(&identity, request).await,
                None => Ok(json_error_response(
                    ProxyErrorCode::NoCapacity,
                    "the load-balanced pool is empty",
                )),
            },
            Route::Homepage => Ok(serve_homepage()),
        }
    }

    async fn delegate(
        &self,
        identity: &InstanceIdentity,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, PlatformError> {
        debug!(identity = %identity, "Routing to instance");
        let supervisor = match self.registry.get(identity).await {
            Ok(supervisor) => supervisor,
            Err(PlatformError::NoCapacity(reason)) => {
                warn!(identity = %identity, reason = %reason, "No capacity to create instance");
                return Ok(ErrorResponse::new(
                    ProxyErrorCode::InstanceUnavailable,
                    format!("we could not provision a container here: {}", identity),
                )
                .with_identity(identity)
                .into_response());
            }
            Err(e) => return Err(e),
        };
        supervisor.on_request(request).await
    }

    /// Ask every pool slot for its status line, concurrently
    async fn list(&self) -> InstanceResponse {
        let lookups = self
            .balancer
            .enumerate()
            .into_iter()
            .enumerate()
            .map(|(index, identity)| async move {
                match self.status_line(&identity).await {
                    Ok(body) => format!("{}: {}", index, body),
                    Err(e) => format!("{}: error: {}", index, e),
                }
            });

        let lines = join_all(lookups).await;

        let mut response = Response::new(full(lines.join("\n")));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        response
    }

    async fn status_line(&self, identity: &InstanceIdentity) -> Result<String, PlatformError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Bytes::new())
            .map_err(|e| PlatformError::Unknown(e.to_string()))?;

        let response = self.delegate(identity, &request).await?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PlatformError::ProxyUnreachable(e.to_string()))?
            .to_bytes();

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
