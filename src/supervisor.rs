//! Per-identity instance supervisors
//!
//! A supervisor owns one instance: it drives readiness, forwards requests,
//! keeps the diagnostic log and runs the periodic health check. Supervisors
//! are created lazily by [`SupervisorRegistry`], which runs [`on_init`]
//! behind a per-identity barrier so that nothing else reaches the
//! supervisor until initialization is done.
//!
//! [`on_init`]: InstanceSupervisor::on_init

use crate::config::Config;
use crate::db::Database;
use crate::diagnostics::{DiagnosticLog, LogEntry};
use crate::error::{ErrorResponse, PlatformError, ProxyErrorCode};
use crate::forward::forward;
use crate::healthcheck::{Alarm, AlarmTarget, RearmGuard};
use crate::instance::{InstanceIdentity, InstanceRequest, InstanceResponse, ReadinessState};
use crate::readiness::{probe, wait_until_ready, Readiness, ReadinessPolicy};
use crate::runtime::{Container, SharedRuntime};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};

/// Knobs shared by every supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Port every instance exposes
    pub open_port: u16,
    pub policy: ReadinessPolicy,
    pub health_interval: Duration,
    /// Start an exited instance again from the health check
    pub restart_on_exit: bool,
    /// Max wait for response headers from a ready instance
    pub request_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            open_port: config.pool.open_port,
            policy: ReadinessPolicy::from(&config.readiness),
            health_interval: config.health.interval(),
            restart_on_exit: config.health.restart_on_exit,
            request_timeout: config.server.request_timeout(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct InstanceSupervisor {
    identity: InstanceIdentity,
    container: Arc<dyn Container>,
    log: DiagnosticLog,
    settings: SupervisorSettings,
    state: Mutex<ReadinessState>,
    /// Serializes readiness sequences; forwarding never takes it
    readiness_gate: tokio::sync::Mutex<()>,
    alarm: Alarm,
    /// An exit watcher task is pending
    watching: AtomicBool,
}

impl InstanceSupervisor {
    pub fn new(
        container: Arc<dyn Container>,
        log: DiagnosticLog,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: container.identity().clone(),
            container,
            log,
            settings,
            state: Mutex::new(ReadinessState::Unknown),
            readiness_gate: tokio::sync::Mutex::new(()),
            alarm: Alarm::new(),
            watching: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.lock()
    }

    fn set_state(&self, state: ReadinessState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!(identity = %self.identity, from = ?*current, to = ?state, "Readiness state changed");
            *current = state;
        }
    }

    /// Move from `Ready` to `Unknown`; any other state is left alone
    fn invalidate(&self) -> bool {
        let mut current = self.state.lock();
        if *current == ReadinessState::Ready {
            *current = ReadinessState::Unknown;
            true
        } else {
            false
        }
    }

    /// Diagnostic log so far; empty if the store cannot be read
    pub fn logs(&self) -> Vec<LogEntry> {
        self.log.read_all().unwrap_or_else(|e| {
            warn!(identity = %self.identity, error = %e, "Failed to read diagnostic log");
            Vec::new()
        })
    }

    fn record(&self, message: &str, details: &[&dyn fmt::Display]) {
        if let Err(e) = self.log.append(message, details) {
            warn!(identity = %self.identity, error = %e, message, "Failed to append diagnostic log");
        }
    }

    pub fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    /// Clear the log, bring the instance up and arm the health alarm.
    ///
    /// An `Unknown` failure is recorded and returned; the alarm is not armed.
    pub async fn on_init(self: &Arc<Self>) -> Result<(), PlatformError> {
        if let Err(e) = self.log.clear() {
            warn!(identity = %self.identity, error = %e, "Failed to clear diagnostic log");
        }
        self.record("supervisor initialized", &[&self.identity]);
        info!(identity = %self.identity, "Initializing supervisor");

        if let Err(e) = self.ensure_ready().await {
            error!(identity = %self.identity, error = %e, "Supervisor initialization failed");
            return Err(e);
        }

        self.alarm
            .set(self.settings.health_interval, Arc::downgrade(self));
        Ok(())
    }

    /// Run a readiness sequence unless the instance is already ready.
    ///
    /// Concurrent callers wait for the sequence in progress and reuse its
    /// outcome when it ended in `Ready`.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<Readiness, PlatformError> {
        if self.state() == ReadinessState::Ready {
            return Ok(Readiness::Ready);
        }

        let _gate = self.readiness_gate.lock().await;
        if self.state() == ReadinessState::Ready {
            return Ok(Readiness::Ready);
        }

        self.record("waiting for instance", &[&self.settings.open_port]);
        let result = wait_until_ready(
            self.container.as_ref(),
            self.settings.open_port,
            self.settings.policy,
            |state| self.set_state(state),
        )
        .await;

        match result {
            Ok(Readiness::Ready) => {
                self.set_state(ReadinessState::Ready);
                self.record("instance ready", &[]);
                debug!(handle = ?self.container.handle(), "Instance ready");
                self.watch_exit();
            }
            Ok(Readiness::Unavailable) => {
                self.set_state(ReadinessState::Unavailable);
                self.record("instance unavailable", &[&self.settings.policy.max_attempts]);
            }
            Err(ref e) => {
                self.set_state(ReadinessState::Unknown);
                self.record("readiness failed", &[e]);
            }
        }

        result
    }

    /// Reset readiness when the running instance exits
    fn watch_exit(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let container = Arc::clone(&self.container);
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            container.monitor().await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            supervisor.watching.store(false, Ordering::SeqCst);
            if supervisor.invalidate() {
                info!(identity = %supervisor.identity, "Instance exited");
                supervisor.record("instance exited", &[]);
            }
        });
    }

    /// Serve one request for this instance.
    ///
    /// Classified failures become 400/504 responses. Only `Unknown` errors
    /// are returned as `Err`.
    pub async fn on_request(
        self: &Arc<Self>,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, PlatformError> {
        if self.state() != ReadinessState::Ready
            && self.ensure_ready().await? == Readiness::Unavailable
        {
            return Ok(ErrorResponse::new(
                ProxyErrorCode::InstanceUnavailable,
                format!("we could not provision a container here: {}", self.identity),
            )
            .with_identity(&self.identity)
            .into_response());
        }

        let forwarded = tokio::time::timeout(
            self.settings.request_timeout,
            forward(self.container.as_ref(), request, self.settings.open_port),
        )
        .await;

        match forwarded {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e @ (PlatformError::NoCapacity(_) | PlatformError::ProxyUnreachable(_)))) => {
                warn!(identity = %self.identity, error = %e, "Proxying to instance failed");
                self.invalidate();
                self.record("proxy failed", &[&e]);
                Ok(ErrorResponse::new(
                    ProxyErrorCode::for_forward_error(&e),
                    format!(
                        "we could not provision a container here (after checking): {}",
                        self.identity
                    ),
                )
                .with_identity(&self.identity)
                .with_logs(self.logs())
                .into_response())
            }
            Ok(Err(e)) => {
                error!(identity = %self.identity, error = %e, "Unexpected proxy error");
                self.record("proxy error", &[&e]);
                Err(e)
            }
            Err(_) => {
                warn!(
                    identity = %self.identity,
                    timeout_secs = self.settings.request_timeout.as_secs(),
                    "Instance did not respond in time"
                );
                self.record("request timed out", &[&self.settings.request_timeout.as_secs()]);
                Ok(ErrorResponse::new(
                    ProxyErrorCode::RequestTimeout,
                    format!("instance did not respond in time: {}", self.identity),
                )
                .with_identity(&self.identity)
                .into_response())
            }
        }
    }

    /// Observe the instance outside the request path
    pub async fn on_timer(self: &Arc<Self>) {
        if !self.container.running() {
            if self.invalidate() {
                info!(identity = %self.identity, "Health check found instance stopped");
                self.record("health check: instance not running", &[]);
            }
            // Unknown here means the instance was ready before it went away
            if self.settings.restart_on_exit && self.state() == ReadinessState::Unknown {
                info!(identity = %self.identity, "Restarting instance");
                if let Err(e) = self.ensure_ready().await {
                    error!(identity = %self.identity, error = %e, "Restart failed");
                }
            }
            return;
        }

        if self.state() != ReadinessState::Ready {
            trace!(identity = %self.identity, state = ?self.state(), "Health check skipped");
            return;
        }

        match probe(self.container.as_ref(), self.settings.open_port).await {
            Ok(()) => trace!(identity = %self.identity, "Health check passed"),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Health check failed");
                if self.invalidate() {
                    self.record("health check failed", &[&e]);
                }
            }
        }
    }

    /// Stop the health cycle
    pub fn shutdown(&self) {
        self.alarm.cancel();
    }
}

#[async_trait]
impl AlarmTarget for InstanceSupervisor {
    async fn on_alarm(self: Arc<Self>) {
        let _rearm = RearmGuard::new(&self.alarm, self.settings.health_interval, &self);
        self.on_timer().await;
    }
}

/// Get-or-create of supervisors by identity
pub struct SupervisorRegistry {
    runtime: SharedRuntime,
    db: Database,
    settings: SupervisorSettings,
    slots: DashMap<InstanceIdentity, Arc<OnceCell<Arc<InstanceSupervisor>>>>,
}

impl SupervisorRegistry {
    pub fn new(runtime: SharedRuntime, db: Database, settings: SupervisorSettings) -> Self {
        Self {
            runtime,
            db,
            settings,
            slots: DashMap::new(),
        }
    }

    /// Supervisor for `identity`, constructing and initializing it on first use.
    ///
    /// Callers racing on a new identity wait for the one initialization. If
    /// it fails, the slot stays empty and the next caller starts over.
    pub async fn get(
        &self,
        identity: &InstanceIdentity,
    ) -> Result<Arc<InstanceSupervisor>, PlatformError> {
        let slot = self.slots.entry(identity.clone()).or_default().clone();

        let supervisor = slot
            .get_or_try_init(|| async {
                debug!(identity = %identity, "Creating supervisor");
                let container = self.runtime.get(identity).await?;
                let log = DiagnosticLog::new(self.db.namespace(log_namespace(identity)));
                let supervisor = InstanceSupervisor::new(container, log, self.settings.clone());
                supervisor.on_init().await?;
                Ok::<_, PlatformError>(supervisor)
            })
            .await?;
        Ok(Arc::clone(supervisor))
    }

    /// Supervisors that finished initialization
    pub fn list(&self) -> Vec<Arc<InstanceSupervisor>> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    /// Cancel every health alarm and stop all instances
    pub async fn shutdown(&self) {
        for supervisor in self.list() {
            supervisor.shutdown();
        }
        self.runtime.stop_all().await;
    }
}

fn log_namespace(identity: &InstanceIdentity) -> String {
    format!("instance:{}", identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{full, InstanceHandle, InstanceResponse};
    use crate::readiness::PROBE_URL;
    use crate::runtime::ExitSignal;
    use hyper::body::Bytes;
    use hyper::{Request, Response, StatusCode};
    use std::sync::atomic::AtomicU32;

    /// Instance that listens as soon as it runs, unless told otherwise
    struct StubContainer {
        identity: InstanceIdentity,
        running: AtomicBool,
        listening: AtomicBool,
        exit: ExitSignal,
        probes: AtomicU32,
    }

    impl StubContainer {
        fn new(listening: bool) -> Arc<Self> {
            Arc::new(Self {
                identity: InstanceIdentity::from("/specific/stub"),
                running: AtomicBool::new(false),
                listening: AtomicBool::new(listening),
                exit: ExitSignal::new(),
                probes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Container for StubContainer {
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
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), PlatformError> {
            if self.running.swap(false, Ordering::SeqCst) {
                self.exit.notify();
            }
            Ok(())
        }

        async fn monitor(&self) {
            self.exit.wait(|| self.running()).await;
        }

        async fn fetch(
            &self,
            _port: u16,
            request: &InstanceRequest,
        ) -> Result<InstanceResponse, PlatformError> {
            if request.uri() == PROBE_URL {
                self.probes.fetch_add(1, Ordering::SeqCst);
            }
            if !self.listening.load(Ordering::SeqCst) {
                return Err(PlatformError::NotListening("refused".into()));
            }
            Ok(Response::new(full("stub")))
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            open_port: 8080,
            policy: ReadinessPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_millis(100),
            },
            health_interval: Duration::from_secs(1),
            restart_on_exit: false,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn supervisor(container: Arc<StubContainer>) -> Arc<InstanceSupervisor> {
        let db = Database::open_in_memory().unwrap();
        let log = DiagnosticLog::new(db.namespace("instance:/specific/stub"));
        InstanceSupervisor::new(container, log, settings())
    }

    fn request() -> InstanceRequest {
        Request::builder().uri("/specific/stub").body(Bytes::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_reaches_ready_and_arms_alarm() {
        let supervisor = supervisor(StubContainer::new(true));

        supervisor.on_init().await.unwrap();

        assert_eq!(supervisor.state(), ReadinessState::Ready);
        assert!(supervisor.alarm().is_armed());

        let messages: Vec<String> = supervisor.logs().into_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            vec![
                "supervisor initialized /specific/stub",
                "waiting for instance 8080",
                "instance ready"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_clears_previous_log() {
        let db = Database::open_in_memory().unwrap();
        let namespace = "instance:/specific/stub";
        DiagnosticLog::new(db.namespace(namespace))
            .append("left over", &[])
            .unwrap();

        let log = DiagnosticLog::new(db.namespace(namespace));
        let supervisor = InstanceSupervisor::new(StubContainer::new(true), log, settings());
        supervisor.on_init().await.unwrap();

        let logs = supervisor.logs();
        assert_eq!(logs[0].index, 0);
        assert!(logs.iter().all(|e| e.message != "left over"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_request_names_identity() {
        let container = StubContainer::new(false);
        let supervisor = supervisor(Arc::clone(&container));

        supervisor.on_init().await.unwrap();
        assert_eq!(supervisor.state(), ReadinessState::Unavailable);
        assert_eq!(container.probes.load(Ordering::SeqCst), 3);

        let response = supervisor.on_request(&request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(container.probes.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_skips_unavailable_instance() {
        let container = StubContainer::new(false);
        let supervisor = supervisor(Arc::clone(&container));
        supervisor.on_init().await.unwrap();

        supervisor.on_timer().await;

        assert_eq!(container.probes.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.state(), ReadinessState::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_keeps_ready_instance() {
        let container = StubContainer::new(true);
        let supervisor = supervisor(Arc::clone(&container));
        supervisor.on_init().await.unwrap();

        supervisor.on_timer().await;

        assert_eq!(container.probes.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.state(), ReadinessState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_rearms_after_each_check() {
        let container = StubContainer::new(true);
        let supervisor = supervisor(Arc::clone(&container));
        supervisor.on_init().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;

        // One probe during init, then one per elapsed interval
        assert_eq!(container.probes.load(Ordering::SeqCst), 4);
        assert!(supervisor.alarm().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_instance_is_invalidated() {
        let container = StubContainer::new(true);
        let supervisor = supervisor(Arc::clone(&container));
        supervisor.on_init().await.unwrap();

        container.stop().await.unwrap();
        supervisor.on_timer().await;

        assert_eq!(supervisor.state(), ReadinessState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_alarm() {
        let supervisor = supervisor(StubContainer::new(true));
        supervisor.on_init().await.unwrap();
        assert!(supervisor.alarm().is_armed());

        supervisor.shutdown();

        assert!(!supervisor.alarm().is_armed());
    }
}
