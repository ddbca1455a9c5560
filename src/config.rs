use crate::coordinator::CoordinatorConfig;
use crate::device::PipelineConfig;
use crate::netif::AddressSource;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            pairs.push((key, value));
        }
    }
    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub pipeline: PipelineSettings,
    pub simulation: SimulationConfig,
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host_name: String,
    /// Interface the listen address is taken from; first routable one if unset.
    pub interface: Option<String>,
    /// Fixed listen address, disables interface lookup.
    pub listen_address: Option<String>,
    pub bind_host: String,
    pub bind_timeout_ms: u64,
    pub idle_poll_ms: u64,
    pub address_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub frame_wait_ms: u64,
    pub exposure_debounce_ms: u64,
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub cameras: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                host_name: gethostname::gethostname().to_string_lossy().into_owned(),
                interface: None,
                listen_address: None,
                bind_host: "0.0.0.0".to_string(),
                bind_timeout_ms: 5000,
                idle_poll_ms: 10,
                address_poll_secs: 5,
            },
            pipeline: PipelineSettings {
                queue_capacity: 5,
                frame_wait_ms: 200,
                exposure_debounce_ms: 200,
                compression_level: 1,
            },
            simulation: SimulationConfig { cameras: 1 },
            status_interval_secs: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // Network
        if let Some(name) = var("NDSI_HOST_NAME") {
            config.network.host_name = name;
        }
        if let Some(interface) = var("NDSI_INTERFACE") {
            config.network.interface = Some(interface);
        }
        if let Some(address) = var("NDSI_LISTEN_ADDRESS") {
            config.network.listen_address = Some(address);
        }
        if let Some(host) = var("NDSI_BIND_HOST") {
            config.network.bind_host = host;
        }
        if let Some(ms) = var("NDSI_BIND_TIMEOUT_MS")
            && let Ok(ms) = ms.parse()
        {
            config.network.bind_timeout_ms = ms;
        }
        if let Some(ms) = var("NDSI_IDLE_POLL_MS")
            && let Ok(ms) = ms.parse()
        {
            config.network.idle_poll_ms = ms;
        }
        if let Some(secs) = var("NDSI_ADDRESS_POLL_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.network.address_poll_secs = secs;
        }

        // Frame pipeline
        if let Some(capacity) = var("NDSI_QUEUE_CAPACITY")
            && let Ok(capacity) = capacity.parse()
        {
            config.pipeline.queue_capacity = capacity;
        }
        if let Some(ms) = var("NDSI_FRAME_WAIT_MS")
            && let Ok(ms) = ms.parse()
        {
            config.pipeline.frame_wait_ms = ms;
        }
        if let Some(ms) = var("NDSI_EXPOSURE_DEBOUNCE_MS")
            && let Ok(ms) = ms.parse()
        {
            config.pipeline.exposure_debounce_ms = ms;
        }
        if let Some(level) = var("NDSI_COMPRESSION_LEVEL")
            && let Ok(level) = level.parse()
        {
            config.pipeline.compression_level = level;
        }

        if let Some(count) = var("NDSI_SIMULATED_CAMERAS")
            && let Ok(count) = count.parse()
        {
            config.simulation.cameras = count;
        }
        if let Some(secs) = var("NDSI_STATUS_INTERVAL_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.status_interval_secs = secs;
        }

        config
    }

    pub fn address_source(&self) -> AddressSource {
        match &self.network.listen_address {
            Some(address) => AddressSource::Fixed(address.clone()),
            None => AddressSource::Interface(self.network.interface.clone()),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_timeout: Duration::from_millis(self.network.bind_timeout_ms),
            idle_poll: Duration::from_millis(self.network.idle_poll_ms.max(1)),
            frame_wait: Duration::from_millis(self.pipeline.frame_wait_ms),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.pipeline.queue_capacity,
            exposure_debounce: Duration::from_millis(self.pipeline.exposure_debounce_ms),
            compression_level: self.pipeline.compression_level,
        }
    }

    pub fn address_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network.address_poll_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

/// Command line overrides, applied on top of the environment.
#[derive(Debug, Parser)]
#[command(name = "ndsi-depth-bridge")]
#[command(about = "Expose attached depth cameras as NDSI sensors")]
pub struct Cli {
    /// Network interface to derive the listen address from
    #[arg(long, env = "NDSI_INTERFACE")]
    pub interface: Option<String>,

    /// Fixed address advertised in sensor URLs
    #[arg(long, env = "NDSI_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Host the sockets are bound on
    #[arg(long, env = "NDSI_BIND_HOST")]
    pub bind_host: Option<String>,

    /// Number of simulated cameras to attach
    #[arg(long, env = "NDSI_SIMULATED_CAMERAS")]
    pub simulated_cameras: Option<usize>,

    /// Seconds between status log lines
    #[arg(long, env = "NDSI_STATUS_INTERVAL_SECS")]
    pub status_interval: Option<u64>,
}

impl Cli {
    pub fn apply(self, config: &mut Config) {
        if let Some(interface) = self.interface {
            config.network.interface = Some(interface);
        }
        if let Some(address) = self.listen_address {
            config.network.listen_address = Some(address);
        }
        if let Some(host) = self.bind_host {
            config.network.bind_host = host;
        }
        if let Some(count) = self.simulated_cameras {
            config.simulation.cameras = count;
        }
        if let Some(secs) = self.status_interval {
            config.status_interval_secs = secs;
        }
    }
}
