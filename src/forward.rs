//! Single-attempt forwarding of a request to a ready instance

use crate::error::PlatformError;
use crate::instance::{clone_request, InstanceRequest, InstanceResponse};
use crate::runtime::Container;
use hyper::http::uri::{Scheme, Uri};
use tracing::debug;

/// Copy `request` with an `https` scheme rewritten to `http`
///
/// TLS ends at the gateway; the instance only speaks plain HTTP.
pub fn downgrade_request(request: &InstanceRequest) -> Result<InstanceRequest, PlatformError> {
    let mut forwarded = clone_request(request);

    if forwarded.uri().scheme() == Some(&Scheme::HTTPS) {
        let mut parts = forwarded.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        *forwarded.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| PlatformError::Unknown(format!("Invalid forwarded URI: {}", e)))?;
    }

    Ok(forwarded)
}

/// Forward `request` to `port` on `container`, exactly once
///
/// The caller's request is left untouched. A port that stops listening after
/// readiness is reported as [`PlatformError::ProxyUnreachable`].
pub async fn forward(
    container: &dyn Container,
    request: &InstanceRequest,
    port: u16,
) -> Result<InstanceResponse, PlatformError> {
    let forwarded = downgrade_request(request)?;

    container
        .fetch(port, &forwarded)
        .await
        .map_err(|e| match e {
            PlatformError::NotListening(reason) => {
                debug!(identity = %container.identity(), port, reason = %reason, "Instance stopped listening");
                PlatformError::ProxyUnreachable(reason)
            }
            other => other,
        })
}
