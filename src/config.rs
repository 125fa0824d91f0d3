use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cluster::wire::MAX_RECORDS_PER_FRAME;
use crate::queue::{DEFAULT_CAPACITY, MIN_CAPACITY};
use crate::tailer::DEFAULT_HEADER_LINES;
use crate::tracer::event::EventKind;

/// Top-level configuration for the tcpagg agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tracing tool output files to tail.
    #[serde(default)]
    pub inputs: InputsConfig,

    /// Summary destination: "stdout", "stderr" or a file path.
    /// Default: "stdout".
    #[serde(default = "default_output")]
    pub output: String,

    /// Capacity of the summary queue. On the coordinator this bounds the
    /// number of merged summaries per cycle. Default: 10000.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Time between polling cycles. Default: 5s.
    #[serde(default = "default_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// Multi-node gather configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// External presentation process configuration.
    #[serde(default)]
    pub presentation: PresentationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Paths of the tracing tool outputs, one per event kind.
#[derive(Debug, Clone, Deserialize)]
pub struct InputsConfig {
    #[serde(default)]
    pub accept: Option<PathBuf>,
    #[serde(default)]
    pub connect: Option<PathBuf>,
    #[serde(default)]
    pub connlat: Option<PathBuf>,
    #[serde(default)]
    pub life: Option<PathBuf>,
    #[serde(default)]
    pub retrans: Option<PathBuf>,

    /// Lines skipped at the top of every input. Default: 2.
    #[serde(default = "default_header_lines")]
    pub header_lines: usize,
}

impl InputsConfig {
    /// Path configured for `kind`, if any.
    pub fn path(&self, kind: EventKind) -> Option<&Path> {
        match kind {
            EventKind::Accept => self.accept.as_deref(),
            EventKind::Connect => self.connect.as_deref(),
            EventKind::ConnLat => self.connlat.as_deref(),
            EventKind::Life => self.life.as_deref(),
            EventKind::Retrans => self.retrans.as_deref(),
        }
    }

    /// Configured inputs in polling order.
    pub fn sources(&self) -> Vec<(EventKind, &Path)> {
        EventKind::all()
            .iter()
            .filter_map(|kind| self.path(*kind).map(|p| (*kind, p)))
            .collect()
    }
}

/// Multi-node gather configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// This node's rank. Rank 0 is the coordinator. Default: 0.
    #[serde(default)]
    pub rank: u32,

    /// Number of participating nodes. Default: 1.
    #[serde(default = "default_world_size")]
    pub world_size: u32,

    /// Coordinator address workers connect to. Required on workers.
    #[serde(default)]
    pub coordinator_addr: Option<String>,

    /// Address the coordinator listens on. Default: "0.0.0.0:7420".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// How long to wait for the cluster to assemble. Default: 60s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// External presentation process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresentationConfig {
    /// Launch the presentation process after the first emit.
    #[serde(default)]
    pub enabled: bool,

    /// Program and leading arguments. `-f <output> -p <port>` is appended.
    #[serde(default = "default_presentation_command")]
    pub command: Vec<String>,

    /// Port passed to the presentation process. Default: 5000.
    #[serde(default = "default_presentation_port")]
    pub port: u16,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output() -> String {
    "stdout".to_string()
}

fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_header_lines() -> usize {
    DEFAULT_HEADER_LINES
}

fn default_world_size() -> u32 {
    1
}

fn default_listen_addr() -> String {
    "0.0.0.0:7420".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_presentation_command() -> Vec<String> {
    vec!["python3".to_string(), "backend.py".to_string()]
}

fn default_presentation_port() -> u16 {
    5000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            inputs: InputsConfig::default(),
            output: default_output(),
            buffer_capacity: default_buffer_capacity(),
            polling_interval: default_polling_interval(),
            cluster: ClusterConfig::default(),
            presentation: PresentationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            accept: None,
            connect: None,
            connlat: None,
            life: None,
            retrans: None,
            header_lines: default_header_lines(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: default_world_size(),
            coordinator_addr: None,
            listen_addr: default_listen_addr(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_presentation_command(),
            port: default_presentation_port(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.sources().is_empty() {
            bail!("at least one of inputs.accept, inputs.connect, inputs.connlat, inputs.life or inputs.retrans is required");
        }

        if self.output.is_empty() {
            bail!("output must not be empty");
        }

        if self.buffer_capacity < MIN_CAPACITY {
            bail!(
                "buffer_capacity must be at least {MIN_CAPACITY}, got {}",
                self.buffer_capacity
            );
        }

        // A node ships its whole queue in one records frame.
        if self.buffer_capacity > MAX_RECORDS_PER_FRAME {
            bail!(
                "buffer_capacity must be at most {MAX_RECORDS_PER_FRAME}, got {}",
                self.buffer_capacity
            );
        }

        if self.polling_interval.is_zero() {
            bail!("polling_interval must be positive");
        }

        self.cluster.validate()?;

        if self.presentation.enabled && self.presentation.command.is_empty() {
            bail!("presentation.command is required when presentation is enabled");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            bail!("cluster.world_size must be at least 1");
        }

        if self.rank >= self.world_size {
            bail!(
                "cluster.rank {} is outside 0..{}",
                self.rank,
                self.world_size
            );
        }

        if self.world_size > 1 {
            if self.rank == 0 && self.listen_addr.is_empty() {
                bail!("cluster.listen_addr is required on rank 0");
            }
            if self.rank != 0 && self.coordinator_addr.as_deref().unwrap_or("").is_empty() {
                bail!("cluster.coordinator_addr is required on worker ranks");
            }
            if self.connect_timeout.is_zero() {
                bail!("cluster.connect_timeout must be positive");
            }
        }

        Ok(())
    }
}
