//! Docker runtime: one container per instance identity

use crate::config::{PullPolicy, RuntimeConfig};
use crate::error::PlatformError;
use crate::instance::{InstanceHandle, InstanceIdentity, InstanceRequest, InstanceResponse};
use crate::pool::ConnectionPool;
use crate::runtime::{CapacityGate, Container, ContainerRuntime, ExitSignal, PortAllocator};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Longest identity fragment embedded in a container name
const MAX_NAME_FRAGMENT: usize = 40;

/// Thin wrapper over the Docker API
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue;
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd, set DOCKER_HOST, or set runtime.docker_host.",
                e
            )
        })
    }

    /// Pull an image if the pull policy asks for it
    pub async fn pull_image_if_needed(
        &self,
        image: &str,
        policy: &PullPolicy,
    ) -> Result<(), PlatformError> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(PlatformError::Unknown(format!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        image
                    )));
                }
                false
            }
            PullPolicy::IfNotPresent => match self.client.inspect_image(image).await {
                Ok(_) => {
                    debug!(image, "Image exists locally, skipping pull");
                    false
                }
                Err(_) => true,
            },
        };

        if should_pull {
            info!(image, "Pulling Docker image");
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };

            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image, status, "Pull progress");
                        }
                        if let Some(error) = info.error {
                            return Err(PlatformError::Unknown(format!(
                                "Failed to pull image '{}': {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => return Err(classify_docker_error(&format!("pull '{}'", image), e)),
                }
            }

            info!(image, "Image pulled successfully");
        }

        Ok(())
    }

    /// Create and start a container, returning its id
    pub async fn start_container(&self, spec: &ContainerSpec<'_>) -> Result<String, PlatformError> {
        let config = spec.config;
        let image = config.image.as_ref().ok_or_else(|| {
            PlatformError::Unknown("Docker runtime requires 'image' field".to_string())
        })?;

        self.pull_image_if_needed(image, &config.pull_policy).await?;

        // A container left over from a previous gateway run holds the name
        let _ = self.remove_container(&spec.name).await;

        let mut env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", spec.open_port));
        env.push(format!("INSTANCE_ID={}", spec.identity));

        let port_key = format!("{}/tcp", spec.open_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: config.network.clone(),
            ..Default::default()
        };

        if let Some(ref memory) = config.memory {
            host_config.memory = Some(
                parse_memory_limit(memory).map_err(|e| PlatformError::Unknown(e.to_string()))?,
            );
        }
        if let Some(ref cpus) = config.cpus {
            let cpu_count: f64 = cpus
                .parse()
                .map_err(|_| PlatformError::Unknown(format!("Invalid CPU limit: {}", cpus)))?;
            // NanoCPUs is CPUs * 1e9
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let cmd = if config.args.is_empty() {
            None
        } else {
            Some(config.args.clone())
        };

        let container_config = Config {
            image: Some(image.to_string()),
            cmd,
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| classify_docker_error(&format!("create '{}'", spec.name), e))?;

        let container_id = response.id;
        info!(
            identity = %spec.identity,
            container_id,
            container_name = %spec.name,
            image,
            "Created Docker container"
        );

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove_container(&container_id).await;
            return Err(classify_docker_error(&format!("start '{}'", spec.name), e));
        }

        info!(identity = %spec.identity, container_id, "Started Docker container");
        Ok(container_id)
    }

    /// Stop a container gracefully
    pub async fn stop_container(&self, container_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!(container_id, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }

    /// Remove a container. Removal errors are logged, never returned.
    pub async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => debug!(container_id, "Removed Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container_id, "Container not found"),
            Err(e) => warn!(container_id, error = %e, "Failed to remove container"),
        }
        Ok(())
    }

    /// Resolve once the container is no longer running
    pub async fn wait_container(&self, container_id: &str) {
        let mut stream = self
            .client
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => {
                debug!(container_id, exit_code = response.status_code, "Container exited")
            }
            // Non-zero exits are reported as errors by the daemon
            Some(Err(e)) => debug!(container_id, error = %e, "Container wait ended"),
            None => debug!(container_id, "Container wait stream closed"),
        }
    }

    /// Stream container logs to tracing under the `container` target
    ///
    /// Returns a shutdown sender that stops the streaming task.
    pub fn stream_logs(&self, container_id: String, identity: InstanceIdentity) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: false,
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(identity = %identity, container_id, "Log streaming stopped");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => log_output(&identity, output),
                            Some(Err(e)) => {
                                warn!(identity = %identity, container_id, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(identity = %identity, container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

fn log_output(identity: &InstanceIdentity, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return,
    };

    let text = String::from_utf8_lossy(&message);
    let line = text.trim_end();
    if line.is_empty() {
        return;
    }

    if stream == "stderr" {
        warn!(target: "container", identity = %identity, stream, "{}", line);
    } else {
        info!(target: "container", identity = %identity, stream, "{}", line);
    }
}

/// Map a Docker API failure onto the closed error kinds
fn classify_docker_error(action: &str, err: bollard::errors::Error) -> PlatformError {
    if let bollard::errors::Error::DockerResponseServerError {
        status_code,
        ref message,
    } = err
    {
        let lower = message.to_lowercase();
        if status_code == 503
            || lower.contains("insufficient")
            || lower.contains("no resources")
            || lower.contains("no space left")
        {
            return PlatformError::NoCapacity(format!("{}: {}", action, message));
        }
    }
    PlatformError::Unknown(format!("Docker {} failed: {}", action, err))
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with("g") || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches("g");
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with("m") || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches("m");
        (num, 1024 * 1024i64)
    } else if limit.ends_with("k") || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches("k");
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Docker-safe container name for an instance
///
/// The host port is unique per instance record, so two identities that
/// sanitize to the same fragment still get distinct names.
fn container_name(prefix: &str, host_port: u16, identity: &InstanceIdentity) -> String {
    let fragment: String = identity
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let fragment = fragment.trim_matches('-');
    let fragment: String = fragment.chars().take(MAX_NAME_FRAGMENT).collect();

    if fragment.is_empty() {
        format!("{}-{}", prefix, host_port)
    } else {
        format!("{}-{}-{}", prefix, host_port, fragment)
    }
}

/// Everything needed to create one container
pub struct ContainerSpec<'a> {
    pub identity: &'a InstanceIdentity,
    pub name: String,
    pub open_port: u16,
    pub host_port: u16,
    pub config: &'a RuntimeConfig,
}

/// Wrapper to share DockerManager across tasks
pub type SharedDockerManager = Arc<DockerManager>;

/// Lazily connected Docker client shared by all containers of a runtime
#[derive(Clone)]
struct LazyDocker {
    cell: Arc<OnceCell<SharedDockerManager>>,
    docker_host: Option<String>,
}

impl LazyDocker {
    async fn get(&self) -> Result<SharedDockerManager, PlatformError> {
        self.cell
            .get_or_try_init(|| async {
                let manager = DockerManager::new(self.docker_host.as_deref()).await?;
                Ok::<_, anyhow::Error>(Arc::new(manager))
            })
            .await
            .cloned()
            .map_err(|e| PlatformError::Unknown(e.to_string()))
    }
}

/// Runs instances as Docker containers
pub struct DockerRuntime {
    config: Arc<RuntimeConfig>,
    open_port: u16,
    pool: Arc<ConnectionPool>,
    capacity: Arc<CapacityGate>,
    ports: PortAllocator,
    docker: LazyDocker,
    containers: DashMap<InstanceIdentity, Arc<DockerContainer>>,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig, open_port: u16, pool: Arc<ConnectionPool>) -> Self {
        Self {
            capacity: Arc::new(CapacityGate::new(config.max_instances)),
            ports: PortAllocator::new(config.host_port_start),
            docker: LazyDocker {
                cell: Arc::new(OnceCell::new()),
                docker_host: config.docker_host.clone(),
            },
            config: Arc::new(config),
            open_port,
            pool,
            containers: DashMap::new(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn get(&self, identity: &InstanceIdentity) -> Result<Arc<dyn Container>, PlatformError> {
        let container = match self.containers.entry(identity.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let host_port = self.ports.allocate()?;
                let name = container_name(&self.config.name_prefix, host_port, identity);
                debug!(identity = %identity, host_port, name, "Registered Docker instance");
                entry
                    .insert(Arc::new(DockerContainer {
                        identity: identity.clone(),
                        name,
                        host_port,
                        open_port: self.open_port,
                        config: Arc::clone(&self.config),
                        pool: Arc::clone(&self.pool),
                        capacity: Arc::clone(&self.capacity),
                        docker: self.docker.clone(),
                        running: Arc::new(AtomicBool::new(false)),
                        exits: Arc::new(ExitSignal::new()),
                        current: Mutex::new(None),
                    }))
                    .clone()
            }
        };
        Ok(container)
    }

    async fn stop_all(&self) {
        let containers: Vec<Arc<DockerContainer>> =
            self.containers.iter().map(|e| e.value().clone()).collect();
        for container in containers {
            if let Err(e) = container.stop().await {
                warn!(identity = %container.identity, error = %e, "Failed to stop instance");
            }
        }
    }
}

struct RunningContainer {
    id: String,
    log_shutdown: watch::Sender<bool>,
}

/// One instance backed by a Docker container
pub struct DockerContainer {
    identity: InstanceIdentity,
    name: String,
    host_port: u16,
    open_port: u16,
    config: Arc<RuntimeConfig>,
    pool: Arc<ConnectionPool>,
    capacity: Arc<CapacityGate>,
    docker: LazyDocker,
    running: Arc<AtomicBool>,
    exits: Arc<ExitSignal>,
    /// Serializes start and stop
    current: Mutex<Option<RunningContainer>>,
}

impl DockerContainer {
    fn spawn_waiter(&self, docker: SharedDockerManager, container_id: String) {
        let identity = self.identity.clone();
        let running = Arc::clone(&self.running);
        let capacity = Arc::clone(&self.capacity);
        let exits = Arc::clone(&self.exits);

        tokio::spawn(async move {
            docker.wait_container(&container_id).await;
            info!(identity = %identity, container_id, "Instance exited");
            running.store(false, Ordering::SeqCst);
            capacity.release();
            exits.notify();
        });
    }
}

#[async_trait]
impl Container for DockerContainer {
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
        let mut current = self.current.lock().await;
        if self.running() {
            return Ok(());
        }

        let docker = self.docker.get().await?;
        self.capacity.try_acquire()?;

        let spec = ContainerSpec {
            identity: &self.identity,
            name: self.name.clone(),
            open_port: self.open_port,
            host_port: self.host_port,
            config: &self.config,
        };
        let container_id = match docker.start_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.capacity.release();
                return Err(e);
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let log_shutdown = docker.stream_logs(container_id.clone(), self.identity.clone());
        self.spawn_waiter(Arc::clone(&docker), container_id.clone());

        *current = Some(RunningContainer {
            id: container_id,
            log_shutdown,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        let mut current = self.current.lock().await;
        let Some(container) = current.take() else {
            return Ok(());
        };
        let _ = container.log_shutdown.send(true);

        let docker = self.docker.get().await?;
        let grace_period = self.config.stop_grace_period();

        info!(identity = %self.identity, container_id = %container.id, "Stopping Docker container");
        if let Err(e) = docker.stop_container(&container.id, grace_period).await {
            warn!(identity = %self.identity, error = %e, "Error stopping container, forcing kill");
            let _ = docker.kill_container(&container.id).await;
        }
        let _ = docker.remove_container(&container.id).await;

        // Capacity is released by the waiter once the daemon reports the exit
        let _ = tokio::time::timeout(grace_period, self.exits.wait(|| self.running())).await;
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

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let id = InstanceIdentity::from("/specific/foo bar");
        assert_eq!(container_name("poolgate", 20001, &id), "poolgate-20001-specific-foo-bar");

        let slot = InstanceIdentity::pool_slot(3);
        assert_eq!(container_name("edge", 20000, &slot), "edge-20000-lb-3");

        let root = InstanceIdentity::from("/");
        assert_eq!(container_name("poolgate", 20002, &root), "poolgate-20002");
    }

    #[test]
    fn test_container_name_is_bounded() {
        let id = InstanceIdentity::new(format!("/specific/{}", "a".repeat(100)));
        let name = container_name("poolgate", 20000, &id);
        assert_eq!(name.len(), "poolgate-20000-".len() + MAX_NAME_FRAGMENT);
    }

    #[test]
    fn test_classify_docker_errors() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "insufficient memory to start container".to_string(),
        };
        assert!(matches!(
            classify_docker_error("start", err),
            PlatformError::NoCapacity(_)
        ));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image".to_string(),
        };
        assert!(matches!(
            classify_docker_error("create", err),
            PlatformError::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn test_get_registers_without_connecting() {
        let pool = Arc::new(ConnectionPool::new(crate::pool::PoolConfig::default()));
        let runtime = DockerRuntime::new(RuntimeConfig::docker("nginx:latest"), 8080, pool);

        let a = runtime.get(&InstanceIdentity::pool_slot(0)).await.unwrap();
        let b = runtime.get(&InstanceIdentity::pool_slot(1)).await.unwrap();
        assert!(!a.running());
        assert_eq!(a.handle().port, 20000);
        assert_eq!(b.handle().port, 20001);

        let req = hyper::Request::builder()
            .uri("/")
            .body(hyper::body::Bytes::new())
            .unwrap();
        let err = a.fetch(8080, &req).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotListening(_)));
    }
}
