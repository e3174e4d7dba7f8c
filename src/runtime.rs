//! Container runtime capabilities
//!
//! The supervisor only talks to instances through [`Container`] and finds
//! them through [`ContainerRuntime`]. Two implementations ship with the
//! crate: local child processes ([`crate::process`]) and Docker containers
//! ([`crate::docker`]).

use crate::config::{Config, RuntimeType};
use crate::docker::DockerRuntime;
use crate::error::PlatformError;
use crate::instance::{InstanceHandle, InstanceIdentity, InstanceRequest, InstanceResponse};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::LocalRuntime;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// One instance as seen by the core
#[async_trait]
pub trait Container: Send + Sync {
    fn identity(&self) -> &InstanceIdentity;

    fn running(&self) -> bool;

    fn handle(&self) -> InstanceHandle;

    /// Start the instance. Starting a running instance is a no-op.
    async fn start(&self) -> Result<(), PlatformError>;

    /// Stop the instance. Stopping a stopped instance is a no-op.
    async fn stop(&self) -> Result<(), PlatformError>;

    /// Resolve when the instance exits.
    ///
    /// Resolves immediately if the instance is not running.
    async fn monitor(&self);

    /// Send `request` to the instance's exposed `port`
    async fn fetch(
        &self,
        port: u16,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, PlatformError>;
}

/// Registry of instances with get-or-create by identity
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Get the instance for `identity`, creating its record if needed.
    ///
    /// Creating the record does not start anything.
    async fn get(&self, identity: &InstanceIdentity) -> Result<Arc<dyn Container>, PlatformError>;

    /// Stop every running instance
    async fn stop_all(&self);
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Build the runtime selected by the configuration
pub fn build_runtime(config: &Config) -> SharedRuntime {
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    }));

    match config.runtime.runtime_type {
        RuntimeType::Local => Arc::new(LocalRuntime::new(
            config.runtime.clone(),
            config.pool.open_port,
            pool,
        )),
        RuntimeType::Docker => Arc::new(DockerRuntime::new(
            config.runtime.clone(),
            config.pool.open_port,
            pool,
        )),
    }
}

/// Bounded count of running instances
#[derive(Debug)]
pub struct CapacityGate {
    in_use: AtomicUsize,
    max: usize,
}

impl CapacityGate {
    pub fn new(max: usize) -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve one slot, or fail with `NoCapacity` when all are taken
    pub fn try_acquire(&self) -> Result<(), PlatformError> {
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|n| PlatformError::NoCapacity(format!("{} of {} instances running", n, self.max)))
    }

    pub fn release(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Hands out one host port per instance record
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            next: AtomicU32::new(start as u32),
        }
    }

    pub fn allocate(&self) -> Result<u16, PlatformError> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port)
            .map_err(|_| PlatformError::NoCapacity("host port range exhausted".to_string()))
    }
}

/// Exit notifications for one instance
///
/// Every exit bumps a generation counter. Waiters subscribe before checking
/// whether the instance is running, so an exit between the check and the
/// wait is never missed.
#[derive(Debug)]
pub struct ExitSignal {
    tx: watch::Sender<u64>,
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Wait for the next exit unless `running` already reports false
    pub async fn wait(&self, running: impl Fn() -> bool) {
        let mut rx = self.tx.subscribe();
        if !running() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}
