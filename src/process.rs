//! Local process runtime
//!
//! Each instance is a child process of the gateway. An instance is told its
//! listening port through `PORT`; the gateway maps the pool's open port onto
//! that host port when fetching.

use crate::config::RuntimeConfig;
use crate::error::PlatformError;
use crate::instance::{InstanceHandle, InstanceIdentity, InstanceRequest, InstanceResponse};
use crate::pool::ConnectionPool;
use crate::runtime::{CapacityGate, Container, ContainerRuntime, ExitSignal, PortAllocator};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Runs instances as local child processes
pub struct LocalRuntime {
    config: Arc<RuntimeConfig>,
    open_port: u16,
    pool: Arc<ConnectionPool>,
    capacity: Arc<CapacityGate>,
    ports: PortAllocator,
    containers: DashMap<InstanceIdentity, Arc<LocalContainer>>,
}

impl LocalRuntime {
    pub fn new(config: RuntimeConfig, open_port: u16, pool: Arc<ConnectionPool>) -> Self {
        Self {
            capacity: Arc::new(CapacityGate::new(config.max_instances)),
            ports: PortAllocator::new(config.host_port_start),
            config: Arc::new(config),
            open_port,
            pool,
            containers: DashMap::new(),
        }
    }

    /// Number of instances currently holding capacity
    pub fn running_count(&self) -> usize {
        self.capacity.in_use()
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn get(&self, identity: &InstanceIdentity) -> Result<Arc<dyn Container>, PlatformError> {
        let container = match self.containers.entry(identity.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let host_port = self.ports.allocate()?;
                debug!(identity = %identity, host_port, "Registered local instance");
                entry
                    .insert(Arc::new(LocalContainer {
                        identity: identity.clone(),
                        host_port,
                        open_port: self.open_port,
                        config: Arc::clone(&self.config),
                        pool: Arc::clone(&self.pool),
                        capacity: Arc::clone(&self.capacity),
                        running: Arc::new(AtomicBool::new(false)),
                        exits: Arc::new(ExitSignal::new()),
                        process: Mutex::new(None),
                    }))
                    .clone()
            }
        };
        Ok(container)
    }

    async fn stop_all(&self) {
        let containers: Vec<Arc<LocalContainer>> =
            self.containers.iter().map(|e| e.value().clone()).collect();
        for container in containers {
            if let Err(e) = container.stop().await {
                warn!(identity = %container.identity, error = %e, "Failed to stop instance");
            }
        }
    }
}

/// Control handles for a spawned child; the child itself is owned by its waiter task
struct RunningProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: oneshot::Receiver<()>,
}

/// One instance backed by a local child process
pub struct LocalContainer {
    identity: InstanceIdentity,
    host_port: u16,
    open_port: u16,
    config: Arc<RuntimeConfig>,
    pool: Arc<ConnectionPool>,
    capacity: Arc<CapacityGate>,
    running: Arc<AtomicBool>,
    exits: Arc<ExitSignal>,
    /// Serializes start and stop
    process: Mutex<Option<RunningProcess>>,
}

impl LocalContainer {
    fn spawn_child(&self) -> Result<Child, PlatformError> {
        let command = self.config.command.as_ref().ok_or_else(|| {
            PlatformError::Unknown("Local runtime requires 'command' field".to_string())
        })?;

        info!(identity = %self.identity, command = %command, port = self.host_port, "Starting local instance");

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", self.host_port.to_string());
        cmd.env("INSTANCE_ID", self.identity.as_str());

        cmd.spawn().map_err(|e| {
            PlatformError::Unknown(format!("Failed to spawn '{}': {}", command, e))
        })
    }

    /// Own the child until it exits or is killed, then publish the exit
    fn spawn_waiter(&self, mut child: Child, kill_rx: oneshot::Receiver<()>, exited_tx: oneshot::Sender<()>) {
        let identity = self.identity.clone();
        let running = Arc::clone(&self.running);
        let capacity = Arc::clone(&self.capacity);
        let exits = Arc::clone(&self.exits);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    warn!(identity = %identity, "Killing instance");
                    if let Err(e) = child.start_kill() {
                        warn!(identity = %identity, error = %e, "Failed to kill instance");
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => info!(identity = %identity, ?status, "Instance exited"),
                Err(e) => error!(identity = %identity, error = %e, "Error waiting for instance"),
            }

            running.store(false, Ordering::SeqCst);
            capacity.release();
            exits.notify();
            let _ = exited_tx.send(());
        });
    }
}

fn forward_output<R>(identity: InstanceIdentity, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "container", identity = %identity, stream, "{}", line);
        }
    });
}

#[async_trait]
impl Container for LocalContainer {
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
            port: self.host_port,
        }
    }

    async fn start(&self) -> Result<(), PlatformError> {
        let mut process = self.process.lock().await;
        if self.running() {
            return Ok(());
        }

        self.capacity.try_acquire()?;
        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                self.capacity.release();
                return Err(e);
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_output(self.identity.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.identity.clone(), "stderr", stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        self.running.store(true, Ordering::SeqCst);
        self.spawn_waiter(child, kill_rx, exited_tx);

        info!(identity = %self.identity, pid, "Instance process spawned");
        *process = Some(RunningProcess {
            pid,
            kill_tx: Some(kill_tx),
            exited_rx,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        let mut process = self.process.lock().await;
        let Some(mut child) = process.take() else {
            return Ok(());
        };
        if !self.running() {
            return Ok(());
        }

        let grace_period = self.config.stop_grace_period();

        if let Some(pid) = child.pid {
            info!(identity = %self.identity, pid, "Sending SIGTERM to instance");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                if let Some(kill_tx) = child.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
            }
        }

        match tokio::time::timeout(grace_period, &mut child.exited_rx).await {
            Ok(_) => {
                info!(identity = %self.identity, "Instance exited gracefully");
            }
            Err(_) => {
                warn!(
                    identity = %self.identity,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Some(kill_tx) = child.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
                let _ = child.exited_rx.await;
            }
        }

        Ok(())
    }

    async fn monitor(&self) {
        self.exits.wait(|| self.running()).await;
    }

    async fn fetch(
        &self,
        port: u16,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, PlatformError> {
        if port != self.open_port {
            return Err(PlatformError::Unknown(format!(
                "port {} is not exposed by {}",
                port, self.identity
            )));
        }
        if !self.running() {
            return Err(PlatformError::NotListening(format!(
                "{} is not running",
                self.identity
            )));
        }
        self.pool.send(request, self.host_port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use hyper::body::Bytes;
    use hyper::Request;
    use std::time::Duration;

    fn get_request(path: &str) -> InstanceRequest {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    fn test_runtime(config: RuntimeConfig) -> LocalRuntime {
        LocalRuntime::new(config, 8080, Arc::new(ConnectionPool::new(PoolConfig::default())))
    }

    fn sleep_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::local("sleep").with_args(vec!["60".to_string()]);
        config.stop_grace_period_secs = 1;
        config.max_instances = 2;
        config
    }

    #[tokio::test]
    async fn test_get_is_idempotent_per_identity() {
        let runtime = test_runtime(sleep_config());
        let a = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();
        let again = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();
        let b = runtime.get(&InstanceIdentity::from("lb-1")).await.unwrap();

        assert_eq!(a.handle().port, again.handle().port);
        assert_ne!(a.handle().port, b.handle().port);
        assert!(!a.running());
    }

    #[tokio::test]
    async fn test_start_and_stop_instance() {
        let runtime = test_runtime(sleep_config());
        let container = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();

        container.start().await.unwrap();
        assert!(container.running());
        assert_eq!(runtime.running_count(), 1);

        // Starting twice is a no-op
        container.start().await.unwrap();
        assert_eq!(runtime.running_count(), 1);

        container.stop().await.unwrap();
        assert!(!container.running());
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let runtime = test_runtime(sleep_config());
        for i in 0..2 {
            let c = runtime.get(&InstanceIdentity::pool_slot(i)).await.unwrap();
            c.start().await.unwrap();
        }

        let third = runtime.get(&InstanceIdentity::pool_slot(2)).await.unwrap();
        let err = third.start().await.unwrap_err();
        assert!(matches!(err, PlatformError::NoCapacity(_)));

        runtime.stop_all().await;
        assert_eq!(runtime.running_count(), 0);
        third.start().await.unwrap();
        runtime.stop_all().await;
    }

    #[tokio::test]
    async fn test_monitor_resolves_on_exit() {
        let config = RuntimeConfig::local("true");
        let runtime = test_runtime(config);
        let container = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();

        container.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), container.monitor())
            .await
            .unwrap();
        assert!(!container.running());
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unknown_and_releases_capacity() {
        let runtime = test_runtime(RuntimeConfig::local("/nonexistent/poolgate-instance"));
        let container = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();

        let err = container.start().await.unwrap_err();
        assert!(matches!(err, PlatformError::Unknown(_)));
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_stopped_instance_is_not_listening() {
        let runtime = test_runtime(sleep_config());
        let container = runtime.get(&InstanceIdentity::from("lb-0")).await.unwrap();

        let err = container.fetch(8080, &get_request("/")).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotListening(_)));

        let err = container.fetch(9999, &get_request("/")).await.unwrap_err();
        assert!(matches!(err, PlatformError::Unknown(_)));
    }
}
