//! In-memory container runtime for gateway tests

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use hyper::header::HeaderMap;
use hyper::{Response, Uri};
use parking_lot::Mutex;
use poolgate::db::Database;
use poolgate::error::PlatformError;
use poolgate::instance::{full, InstanceHandle, InstanceIdentity, InstanceRequest, InstanceResponse};
use poolgate::loadbalancer::LoadBalancer;
use poolgate::readiness::PROBE_URL;
use poolgate::router::Router;
use poolgate::runtime::{Container, ContainerRuntime, ExitSignal};
use poolgate::supervisor::{SupervisorRegistry, SupervisorSettings};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub const OPEN_PORT: u16 = 8080;

/// How a fake instance behaves after each start
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Probes answered with "not listening" after every start
    pub probes_before_ready: u32,
    /// Start attempts that fail with an unknown error before one succeeds
    pub start_failures: u32,
    pub body: String,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            probes_before_ready: 0,
            start_failures: 0,
            body: "ok".to_string(),
        }
    }
}

pub struct FakeContainer {
    identity: InstanceIdentity,
    running: AtomicBool,
    listening: AtomicBool,
    hang_requests: AtomicBool,
    exit: ExitSignal,
    pending_probes: AtomicU32,
    start_failures: AtomicU32,
    behavior: Behavior,
    request_error: Mutex<Option<PlatformError>>,
    last_request: Mutex<Option<(Uri, HeaderMap)>>,
    pub starts: AtomicU32,
    pub probes: AtomicU32,
    pub requests: AtomicU32,
}

impl FakeContainer {
    pub fn new(identity: InstanceIdentity, behavior: Behavior) -> Self {
        Self {
            identity,
            running: AtomicBool::new(false),
            listening: AtomicBool::new(true),
            hang_requests: AtomicBool::new(false),
            exit: ExitSignal::new(),
            pending_probes: AtomicU32::new(0),
            start_failures: AtomicU32::new(behavior.start_failures),
            behavior,
            request_error: Mutex::new(None),
            last_request: Mutex::new(None),
            starts: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            requests: AtomicU32::new(0),
        }
    }

    /// The process dies on its own
    pub fn crash(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.exit.notify();
        }
    }

    /// Keep running but stop answering anything
    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Fail forwarded (non-probe) requests with `error`
    pub fn fail_requests(&self, error: Option<PlatformError>) {
        *self.request_error.lock() = error;
    }

    /// Never answer forwarded (non-probe) requests
    pub fn hang_requests(&self) {
        self.hang_requests.store(true, Ordering::SeqCst);
    }

    pub fn last_request(&self) -> Option<(Uri, HeaderMap)> {
        self.last_request.lock().clone()
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Container for FakeContainer {
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
            port: OPEN_PORT,
        }
    }

    async fn start(&self) -> Result<(), PlatformError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.running() {
            return Ok(());
        }
        let failures = self.start_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.start_failures.store(failures - 1, Ordering::SeqCst);
            return Err(PlatformError::Unknown("image missing".to_string()));
        }
        self.pending_probes
            .store(self.behavior.probes_before_ready, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        self.crash();
        Ok(())
    }

    async fn monitor(&self) {
        self.exit.wait(|| self.running()).await;
    }

    async fn fetch(
        &self,
        port: u16,
        request: &InstanceRequest,
    ) -> Result<InstanceResponse, PlatformError> {
        if port != OPEN_PORT {
            return Err(PlatformError::Unknown(format!("port {} is not exposed", port)));
        }
        if !self.running() || !self.listening.load(Ordering::SeqCst) {
            return Err(PlatformError::NotListening("connection refused".to_string()));
        }

        if request.uri() == PROBE_URL {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let pending = self.pending_probes.load(Ordering::SeqCst);
            if pending > 0 {
                self.pending_probes.store(pending - 1, Ordering::SeqCst);
                return Err(PlatformError::NotListening("connection refused".to_string()));
            }
            return Ok(Response::new(full("")));
        }

        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some((request.uri().clone(), request.headers().clone()));

        if let Some(e) = self.request_error.lock().clone() {
            return Err(e);
        }
        if self.hang_requests.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Response::new(full(self.behavior.body.clone())))
    }
}

type BehaviorFn = dyn Fn(&InstanceIdentity) -> Behavior + Send + Sync;

pub struct FakeRuntime {
    containers: DashMap<InstanceIdentity, Arc<FakeContainer>>,
    behavior: Box<BehaviorFn>,
    gets: AtomicU32,
    get_error: Mutex<Option<PlatformError>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::with_behavior(|_| Behavior::default())
    }

    pub fn with_behavior(
        behavior: impl Fn(&InstanceIdentity) -> Behavior + Send + Sync + 'static,
    ) -> Self {
        Self {
            containers: DashMap::new(),
            behavior: Box::new(behavior),
            gets: AtomicU32::new(0),
            get_error: Mutex::new(None),
        }
    }

    /// Refuse to create or look up any instance with `error`
    pub fn fail_gets(&self, error: Option<PlatformError>) {
        *self.get_error.lock() = error;
    }

    pub fn container(&self, identity: &str) -> Arc<FakeContainer> {
        let identity = InstanceIdentity::from(identity);
        let entry = self
            .containers
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(FakeContainer::new(identity.clone(), (self.behavior)(&identity))));
        Arc::clone(entry.value())
    }

    pub fn created(&self) -> usize {
        self.containers.len()
    }

    pub fn gets(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn get(&self, identity: &InstanceIdentity) -> Result<Arc<dyn Container>, PlatformError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.get_error.lock().clone() {
            return Err(e);
        }
        let container: Arc<dyn Container> = self.container(identity.as_str());
        Ok(container)
    }

    async fn stop_all(&self) {
        for entry in self.containers.iter() {
            entry.value().crash();
        }
    }
}

pub struct Gateway {
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<SupervisorRegistry>,
    pub router: Arc<Router>,
}

pub fn gateway(runtime: FakeRuntime, pool_size: u32) -> Gateway {
    gateway_with_settings(runtime, pool_size, SupervisorSettings {
        open_port: OPEN_PORT,
        ..SupervisorSettings::default()
    })
}

pub fn gateway_with_settings(
    runtime: FakeRuntime,
    pool_size: u32,
    settings: SupervisorSettings,
) -> Gateway {
    let runtime = Arc::new(runtime);
    let db = Database::open_in_memory().unwrap();
    let registry = Arc::new(SupervisorRegistry::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        db,
        settings,
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        LoadBalancer::new(pool_size),
    ));
    Gateway {
        runtime,
        registry,
        router,
    }
}
