use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Load-balanced pool
    #[serde(default)]
    pub pool: PoolSettings,

    /// Readiness retry policy
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Out-of-band health monitoring
    #[serde(default)]
    pub health: HealthConfig,

    /// Diagnostic log storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// How instances are run
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 443 when TLS enabled, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per instance port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a ready instance to respond, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port.unwrap_or(443)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Pool shape, fixed at deployment
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Port every instance exposes (default: 8080)
    #[serde(default = "default_open_port")]
    pub open_port: u16,

    /// Number of `lb-<i>` slots (default: 5)
    #[serde(default = "default_pool_size")]
    pub size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            open_port: default_open_port(),
            size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// Probes before an instance is declared unavailable (default: 20)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between probes in milliseconds (default: 500)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl ReadinessConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Interval between health alarms in milliseconds (default: 10000)
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Start an instance again when the alarm finds it exited (default: false)
    #[serde(default)]
    pub restart_on_exit: bool,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            restart_on_exit: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite database path (default: ./poolgate.db)
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Runtime type: local process or Docker container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Local process spawned directly (default)
    #[default]
    Local,
    /// Docker container managed via Docker API
    Docker,
}

/// Image pull policy for Docker instances
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// How instances are created
///
/// # Security Warning
///
/// For the local runtime, `command` and `args` allow arbitrary command execution.
/// For the Docker runtime, container images are pulled and run.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Runtime type: "local" (default) or "docker"
    #[serde(default, rename = "type")]
    pub runtime_type: RuntimeType,

    /// Upper bound on concurrently running instances (default: 32)
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// First host port handed out to instances (default: 20000)
    #[serde(default = "default_host_port_start")]
    pub host_port_start: u16,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 10)
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    // === Local process fields ===
    /// Command that starts one instance (local only)
    pub command: Option<String>,

    /// Arguments to pass to the command (local only)
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command (local only)
    pub working_dir: Option<String>,

    // === Docker-specific fields ===
    /// Docker image to run (required for the Docker runtime)
    pub image: Option<String>,

    /// Docker host URL (default: local socket)
    pub docker_host: Option<String>,

    /// Docker network to connect to (default: bridge)
    pub network: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Container name prefix (default: poolgate)
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    // === Common fields ===
    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RuntimeConfig {
    /// Local runtime running `command`
    pub fn local(command: &str) -> Self {
        Self {
            runtime_type: RuntimeType::Local,
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Docker runtime running `image`
    pub fn docker(image: &str) -> Self {
        Self {
            runtime_type: RuntimeType::Docker,
            image: Some(image.to_string()),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match self.runtime_type {
            RuntimeType::Local => {
                if self.command.is_none() {
                    errors.push("runtime: local runtime requires 'command' field".to_string());
                }
            }
            RuntimeType::Docker => {
                if self.image.is_none() {
                    errors.push("runtime: Docker runtime requires 'image' field".to_string());
                }
            }
        }

        if self.max_instances == 0 {
            errors.push("runtime: 'max_instances' must be at least 1".to_string());
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::default(),
            max_instances: default_max_instances(),
            host_port_start: default_host_port_start(),
            stop_grace_period_secs: default_stop_grace_period(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            image: None,
            docker_host: None,
            network: None,
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            name_prefix: default_name_prefix(),
            env: HashMap::new(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per instance
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30
}

fn default_open_port() -> u16 {
    8080
}

fn default_pool_size() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    20
}

fn default_retry_delay() -> u64 {
    500
}

fn default_health_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_storage_path() -> String {
    "./poolgate.db".to_string()
}

fn default_max_instances() -> usize {
    32
}

fn default_host_port_start() -> u16 {
    20_000
}

fn default_stop_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_name_prefix() -> String {
    "poolgate".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.pool.size == 0 {
            errors.push("pool: 'size' must be at least 1".to_string());
        }
        if self.pool.open_port == 0 {
            errors.push("pool: 'open_port' must be greater than 0".to_string());
        }
        if self.readiness.max_attempts == 0 {
            errors.push("readiness: 'max_attempts' must be at least 1".to_string());
        }
        self.runtime.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
