//! Bounded readiness polling
//!
//! Drives an instance from unknown to ready (or unavailable) by starting it
//! when it is down and probing its exposed port at a fixed delay.

use crate::config::ReadinessConfig;
use crate::error::PlatformError;
use crate::instance::{InstanceRequest, ReadinessState};
use crate::runtime::Container;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Method, Request};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Address every readiness probe is sent to. Only the path reaches the
/// instance; the authority travels in the `Host` header.
pub const PROBE_URL: &str = "http://10.0.0.1/";

/// Retry bounds of one readiness sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Outcome of a readiness sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unavailable,
}

pub fn probe_request() -> InstanceRequest {
    Request::builder()
        .method(Method::GET)
        .uri(PROBE_URL)
        .body(Bytes::new())
        .unwrap_or_else(|_| Request::new(Bytes::new()))
}

/// Probe once, draining the response body
pub async fn probe(container: &dyn Container, port: u16) -> Result<(), PlatformError> {
    let response = container.fetch(port, &probe_request()).await?;
    response
        .into_body()
        .collect()
        .await
        .map(|_| ())
        .map_err(|e| PlatformError::NotListening(format!("probe body: {}", e)))
}

/// Wait until `container` answers on `port`.
///
/// Fails only with an `Unknown` error; every other failure kind either
/// retries or ends the sequence with [`Readiness::Unavailable`].
/// `on_state` observes the `Starting` and `Probing` transitions.
pub async fn wait_until_ready(
    container: &dyn Container,
    port: u16,
    policy: ReadinessPolicy,
    mut on_state: impl FnMut(ReadinessState) + Send,
) -> Result<Readiness, PlatformError> {
    let identity = container.identity().clone();

    for attempt in 1..=policy.max_attempts {
        if !container.running() {
            on_state(ReadinessState::Starting);
            debug!(identity = %identity, attempt, "Starting instance");
            match container.start().await {
                Ok(()) => {}
                Err(PlatformError::NoCapacity(reason)) => {
                    warn!(identity = %identity, attempt, reason = %reason, "No capacity to start instance");
                    return Ok(Readiness::Unavailable);
                }
                Err(e @ PlatformError::Unknown(_)) => return Err(e),
                Err(e) => {
                    debug!(identity = %identity, attempt, error = %e, "Start not yet possible");
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                    continue;
                }
            }
        }

        on_state(ReadinessState::Probing);
        match probe(container, port).await {
            Ok(()) => {
                info!(identity = %identity, port, attempt, "Instance is ready");
                return Ok(Readiness::Ready);
            }
            Err(e) if e.is_transient() => {
                debug!(identity = %identity, port, attempt, error = %e, "Instance not listening yet");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.retry_delay).await;
                }
            }
            Err(PlatformError::NoCapacity(reason)) => {
                warn!(identity = %identity, attempt, reason = %reason, "No capacity while probing");
                return Ok(Readiness::Unavailable);
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        identity = %identity,
        attempts = policy.max_attempts,
        "Instance did not become ready"
    );
    Ok(Readiness::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{full, InstanceHandle, InstanceIdentity, InstanceResponse};
    use async_trait::async_trait;
    use hyper::Response;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted container: each probe pops the next outcome, repeating the last
    struct ScriptedContainer {
        identity: InstanceIdentity,
        running: AtomicBool,
        starts: AtomicU32,
        probes: AtomicU32,
        start_result: Option<PlatformError>,
        script: Mutex<VecDeque<Result<(), PlatformError>>>,
        last: Mutex<Result<(), PlatformError>>,
    }

    impl ScriptedContainer {
        fn new(script: Vec<Result<(), PlatformError>>) -> Self {
            let last = script.last().cloned().unwrap_or(Ok(()));
            Self {
                identity: InstanceIdentity::from("/specific/test"),
                running: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                start_result: None,
                script: Mutex::new(script.into()),
                last: Mutex::new(last),
            }
        }

        fn failing_start(mut self, error: PlatformError) -> Self {
            self.start_result = Some(error);
            self
        }
    }

    #[async_trait]
    impl Container for ScriptedContainer {
        fn identity(&self) -> &InstanceIdentity {
            &self.identity
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn handle(&self) -> InstanceHandle {
            InstanceHandle {
                identity: self.identity.clone(),
                running: self.running(),
                port: 8080,
            }
        }

        async fn start(&self) -> Result<(), PlatformError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(ref e) = self.start_result {
                return Err(e.clone());
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), PlatformError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn monitor(&self) {}

        async fn fetch(
            &self,
            _port: u16,
            _request: &InstanceRequest,
        ) -> Result<InstanceResponse, PlatformError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.last.lock().clone());
            next.map(|()| Response::new(full("ok")))
        }
    }

    fn not_listening() -> Result<(), PlatformError> {
        Err(PlatformError::NotListening("connection refused".into()))
    }

    fn policy() -> ReadinessPolicy {
        ReadinessPolicy::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_kth_probe() {
        let container = ScriptedContainer::new(vec![not_listening(), not_listening(), Ok(())]);

        let result = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap();

        assert_eq!(result, Readiness::Ready);
        assert_eq!(container.probes.load(Ordering::SeqCst), 3);
        assert_eq!(container.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_after_max_attempts() {
        let container = ScriptedContainer::new(vec![not_listening()]);

        let result = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap();

        assert_eq!(result, Readiness::Unavailable);
        assert_eq!(container.probes.load(Ordering::SeqCst), 20);
        assert_eq!(container.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_uses_retry_delay() {
        let container = ScriptedContainer::new(vec![not_listening()]);
        let policy = ReadinessPolicy {
            max_attempts: 4,
            retry_delay: Duration::from_millis(500),
        };

        let started = tokio::time::Instant::now();
        wait_until_ready(&container, 8080, policy, |_| {}).await.unwrap();

        // No sleep after the last attempt
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capacity_on_first_probe() {
        let container =
            ScriptedContainer::new(vec![Err(PlatformError::NoCapacity("full".into()))]);

        let result = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap();

        assert_eq!(result, Readiness::Unavailable);
        assert_eq!(container.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capacity_on_start() {
        let container = ScriptedContainer::new(vec![Ok(())])
            .failing_start(PlatformError::NoCapacity("full".into()));

        let result = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap();

        assert_eq!(result, Readiness::Unavailable);
        assert_eq!(container.starts.load(Ordering::SeqCst), 1);
        assert_eq!(container.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_propagates() {
        let container = ScriptedContainer::new(vec![Err(PlatformError::Unknown("boom".into()))]);

        let err = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap_err();

        assert_eq!(err, PlatformError::Unknown("boom".into()));
        assert_eq!(container.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_while_probing_is_retried() {
        let container = ScriptedContainer::new(vec![
            Err(PlatformError::ProxyUnreachable("reset".into())),
            Ok(()),
        ]);

        let result = wait_until_ready(&container, 8080, policy(), |_| {}).await.unwrap();

        assert_eq!(result, Readiness::Ready);
        assert_eq!(container.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_instance_is_not_started() {
        let container = ScriptedContainer::new(vec![Ok(())]);
        container.running.store(true, Ordering::SeqCst);

        let mut states = Vec::new();
        let result = wait_until_ready(&container, 8080, policy(), |s| states.push(s))
            .await
            .unwrap();

        assert_eq!(result, Readiness::Ready);
        assert_eq!(container.starts.load(Ordering::SeqCst), 0);
        assert_eq!(states, vec![ReadinessState::Probing]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_state_transitions() {
        let container = ScriptedContainer::new(vec![not_listening(), Ok(())]);

        let mut states = Vec::new();
        wait_until_ready(&container, 8080, policy(), |s| states.push(s))
            .await
            .unwrap();

        assert_eq!(
            states,
            vec![
                ReadinessState::Starting,
                ReadinessState::Probing,
                ReadinessState::Probing
            ]
        );
    }
}
