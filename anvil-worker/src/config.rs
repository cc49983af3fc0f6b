//! Worker configuration
//!
//! Defines every configurable parameter of an executor node: which backend
//! builds run on, where the stores live, and the ports the node serves.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which execution backend builds run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Container,
    Ssh,
    Local,
}

impl BackendKind {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "container" | "docker" | "podman" => Ok(BackendKind::Container),
            "ssh" => Ok(BackendKind::Ssh),
            "local" => Ok(BackendKind::Local),
            other => anyhow::bail!("unknown backend '{}'", other),
        }
    }
}

/// Remote shell target for the ssh backend
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: Option<PathBuf>,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Node identifier in the coordination store
    pub worker_id: String,

    /// Address the build API (submit, logs, kill) listens on
    pub bind_addr: SocketAddr,

    /// Port of the bootstrap file server
    pub service_port: u16,

    /// Address backends use to reach the bootstrap server
    pub loopback_ip: String,

    /// Directory served by the bootstrap server
    pub bootstrap_dir: PathBuf,

    pub backend: BackendKind,

    /// Container CLI (docker or podman)
    pub container_runtime: String,

    /// Image used when a build definition names none
    pub default_image: String,

    /// Root under which `.anvil/` and clone directories live on the backend
    pub workspace_prefix: String,

    pub ssh: Option<SshTarget>,

    /// Postgres URL; `None` keeps results in memory
    pub database_url: Option<String>,

    /// Consul-compatible KV endpoint; `None` keeps coordination in memory
    pub coordination_url: Option<String>,

    /// JSON credential file loaded at startup
    pub credentials_file: Option<PathBuf>,

    /// Postflight webhook target
    pub notify_webhook_url: Option<String>,

    /// Max builds this node runs at once
    pub max_parallel_builds: usize,

    /// How often log pumps re-poll a buffer with no new lines
    pub log_poll_interval: Duration,

    /// How long a kill waits for the build to acknowledge
    pub kill_wait: Duration,
}

impl Config {
    /// Creates a configuration with defaults for the given backend
    pub fn new(worker_id: String, backend: BackendKind) -> Self {
        let (loopback_ip, workspace_prefix) = match backend {
            BackendKind::Container => ("172.17.0.1", ""),
            BackendKind::Ssh | BackendKind::Local => ("127.0.0.1", "/tmp/anvil"),
        };

        Self {
            worker_id,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            service_port: 9091,
            loopback_ip: loopback_ip.to_string(),
            bootstrap_dir: PathBuf::from("/var/lib/anvil/bootstrap"),
            backend,
            container_runtime: "docker".to_string(),
            default_image: "docker.io/library/alpine:latest".to_string(),
            workspace_prefix: workspace_prefix.to_string(),
            ssh: None,
            database_url: None,
            coordination_url: None,
            credentials_file: None,
            notify_webhook_url: None,
            max_parallel_builds: 2,
            log_poll_interval: Duration::from_millis(100),
            kill_wait: Duration::from_secs(30),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - WORKER_ID (default: random UUID)
    /// - BACKEND: container | ssh | local (default: container)
    /// - WORKER_BIND_ADDR (default: 0.0.0.0:9090)
    /// - SERVICE_PORT (default: 9091)
    /// - LOOPBACK_IP, BOOTSTRAP_DIR, WORKSPACE_PREFIX
    /// - CONTAINER_RUNTIME (default: docker), DEFAULT_IMAGE
    /// - SSH_HOST, SSH_PORT (default: 22), SSH_USER (default: root), SSH_KEY_FILE
    /// - DATABASE_URL, COORDINATION_URL, CREDENTIALS_FILE, NOTIFY_WEBHOOK_URL
    /// - MAX_PARALLEL_BUILDS (default: 2)
    /// - LOG_POLL_INTERVAL_MS (default: 100)
    /// - KILL_WAIT_SECS (default: 30)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = env("WORKER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let backend = match env("BACKEND") {
            Some(s) => BackendKind::parse(&s)?,
            None => BackendKind::Container,
        };

        let mut config = Self::new(worker_id, backend);

        if let Some(addr) = env("WORKER_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid WORKER_BIND_ADDR '{}': {}", addr, e))?;
        }
        if let Some(port) = parsed::<u16>("SERVICE_PORT") {
            config.service_port = port;
        }
        if let Some(ip) = env("LOOPBACK_IP") {
            config.loopback_ip = ip;
        }
        if let Some(dir) = env("BOOTSTRAP_DIR") {
            config.bootstrap_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env("WORKSPACE_PREFIX") {
            config.workspace_prefix = prefix;
        }
        if let Some(runtime) = env("CONTAINER_RUNTIME") {
            config.container_runtime = runtime;
        }
        if let Some(image) = env("DEFAULT_IMAGE") {
            config.default_image = image;
        }

        config.ssh = env("SSH_HOST").map(|host| SshTarget {
            host,
            port: parsed::<u16>("SSH_PORT").unwrap_or(22),
            user: env("SSH_USER").unwrap_or_else(|| "root".to_string()),
            key_file: env("SSH_KEY_FILE").map(PathBuf::from),
        });

        config.database_url = env("DATABASE_URL");
        config.coordination_url = env("COORDINATION_URL");
        config.credentials_file = env("CREDENTIALS_FILE").map(PathBuf::from);
        config.notify_webhook_url = env("NOTIFY_WEBHOOK_URL");

        if let Some(n) = parsed::<usize>("MAX_PARALLEL_BUILDS") {
            config.max_parallel_builds = n;
        }
        if let Some(ms) = parsed::<u64>("LOG_POLL_INTERVAL_MS") {
            config.log_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>("KILL_WAIT_SECS") {
            config.kill_wait = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.max_parallel_builds == 0 {
            anyhow::bail!("max_parallel_builds must be greater than 0");
        }

        if self.log_poll_interval.is_zero() {
            anyhow::bail!("log_poll_interval must be greater than 0");
        }

        if self.backend == BackendKind::Ssh && self.ssh.is_none() {
            anyhow::bail!("ssh backend requires SSH_HOST");
        }

        if let Some(url) = &self.coordination_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("coordination_url must start with http:// or https://");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), BackendKind::Container)
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env(key).and_then(|s| s.parse::<T>().ok())
}
