//! Configuration module for NetMonitor.
//!
//! Process settings come from environment variables with sensible defaults.
//! The monitored endpoints live in a JSON snapshot file that can be reloaded
//! while the process runs.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::probe::{HttpConfig, IcmpConfig, Protocol, ProtocolConfig, TcpConfig, TestConfig, UdpConfig};

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_INTERVAL_SECONDS: f64 = 300.0;
pub const MAX_INTERVAL_SECONDS: f64 = 24.0 * 60.0 * 60.0;

/// Delay between a file event and the re-read, so editors finish writing.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the endpoint snapshot (default: "config.json")
    pub config_path: PathBuf,
    /// Path of the JSON-lines result log (default: "results.jsonl")
    pub results_path: PathBuf,
    /// Scheduled worker pool size (default: 10)
    pub workers: usize,
    /// Manual worker pool size (default: 4)
    pub manual_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            config_path: PathBuf::from("config.json"),
            results_path: PathBuf::from("results.jsonl"),
            workers: 10,
            manual_workers: 4,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETMONITOR_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETMONITOR_CONFIG_PATH`: endpoint snapshot path (default: "config.json")
    /// - `NETMONITOR_RESULTS_PATH`: result log path (default: "results.jsonl")
    /// - `NETMONITOR_WORKERS`: scheduled worker pool size (default: 10)
    /// - `NETMONITOR_MANUAL_WORKERS`: manual worker pool size (default: 4)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("NETMONITOR_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(path) = env::var("NETMONITOR_CONFIG_PATH") {
            cfg.config_path = PathBuf::from(path);
        }

        if let Ok(path) = env::var("NETMONITOR_RESULTS_PATH") {
            cfg.results_path = PathBuf::from(path);
        }

        if let Ok(workers) = env::var("NETMONITOR_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => cfg.workers = n,
                _ => warn!("Ignoring invalid NETMONITOR_WORKERS value {:?}", workers),
            }
        }

        if let Ok(workers) = env::var("NETMONITOR_MANUAL_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => cfg.manual_workers = n,
                _ => warn!("Ignoring invalid NETMONITOR_MANUAL_WORKERS value {:?}", workers),
            }
        }

        cfg
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Alert thresholds for a region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Average latency above this is a warning. 0 disables the check.
    pub latency_ms: u64,
    /// Availability below this is critical. 0 disables the check.
    pub availability_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            availability_percent: 99.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub test_interval_seconds: f64,
    pub data_retention_days: u32,
    pub notifications_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            test_interval_seconds: DEFAULT_INTERVAL_SECONDS,
            data_retention_days: 90,
            notifications_enabled: true,
        }
    }
}

/// A single network target under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identity. Derived as `{region}-{name}` when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    pub address: String,
    /// Timeout in milliseconds.
    #[serde(rename = "timeout", default)]
    pub timeout_ms: u64,
    /// Overrides the global test interval for this endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp: Option<IcmpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
    /// Owning region, filled in by [`Snapshot::normalize`].
    #[serde(skip)]
    pub region: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            protocol,
            address: address.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            interval_seconds: None,
            icmp: None,
            tcp: None,
            udp: None,
            http: None,
            region: String::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout_ms {
            0 => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// Effective interval in seconds, falling back to the global setting.
    pub fn interval(&self, settings: &Settings) -> f64 {
        self.interval_seconds.unwrap_or(settings.test_interval_seconds)
    }

    /// Protocol parameters; the block matching `protocol` wins, others are ignored.
    pub fn protocol_config(&self) -> ProtocolConfig {
        match self.protocol {
            Protocol::Icmp => ProtocolConfig::Icmp(self.icmp.clone().unwrap_or_default()),
            Protocol::Tcp => ProtocolConfig::Tcp(self.tcp.clone().unwrap_or_default()),
            Protocol::Udp => ProtocolConfig::Udp(self.udp.clone().unwrap_or_default()),
            Protocol::Http => ProtocolConfig::Http(self.http.clone().unwrap_or_default()),
        }
    }

    /// Fresh per-attempt parameters.
    pub fn test_config(&self) -> TestConfig {
        TestConfig::new(self.id.clone(), self.address.clone(), self.timeout(), self.protocol_config())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Region {
    pub endpoints: Vec<Endpoint>,
    pub thresholds: Thresholds,
}

/// Immutable view of the monitored topology. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub regions: BTreeMap<String, Region>,
    pub settings: Settings,
}

/// Snapshot handle shared by every reader; swapped atomically on reload.
pub type SharedSnapshot = Arc<ArcSwap<Snapshot>>;

impl Default for Snapshot {
    /// Single region probing Google DNS, written out when no file exists.
    fn default() -> Self {
        let mut google = Endpoint::new("Google DNS", Protocol::Icmp, "8.8.8.8");
        google.timeout_ms = 1000;

        let mut regions = BTreeMap::new();
        regions.insert(
            "Default".to_string(),
            Region {
                endpoints: vec![google],
                thresholds: Thresholds::default(),
            },
        );

        let mut snapshot = Self {
            regions,
            settings: Settings::default(),
        };
        snapshot.normalize();
        snapshot
    }
}

impl Snapshot {
    /// Load the snapshot at `path`. A missing file yields the default snapshot,
    /// which is also written out as a starting point.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, creating default config", path.display());
            let snapshot = Self::default();
            if let Err(e) = snapshot.save(path) {
                warn!("Failed to write default config to {}: {}", path.display(), e);
            }
            return Ok(snapshot);
        }
        Self::read(path)
    }

    /// Read and parse `path`, failing when it does not exist.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let mut snapshot: Snapshot = serde_json::from_str(data)?;
        snapshot.normalize();
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(io_err)
    }

    /// Fill in derived fields: region names, ids, default timeouts and intervals.
    pub fn normalize(&mut self) {
        if !(self.settings.test_interval_seconds >= 1.0) {
            self.settings.test_interval_seconds = DEFAULT_INTERVAL_SECONDS;
        }
        for (region_name, region) in self.regions.iter_mut() {
            for endpoint in region.endpoints.iter_mut() {
                endpoint.region = region_name.clone();
                if endpoint.id.is_empty() {
                    endpoint.id = format!("{}-{}", region_name, endpoint.name);
                }
                if endpoint.timeout_ms == 0 {
                    endpoint.timeout_ms = DEFAULT_TIMEOUT_MS;
                }
            }
        }
    }

    /// Structural checks: unique ids and intervals in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_interval(self.settings.test_interval_seconds)
            .map_err(|e| ConfigError::Invalid(format!("settings.test_interval_seconds: {e}")))?;

        let mut seen = HashSet::new();
        for endpoint in self.endpoints() {
            if !seen.insert(endpoint.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint id {:?}", endpoint.id)));
            }
            if let Some(interval) = endpoint.interval_seconds {
                check_interval(interval).map_err(|e| ConfigError::Invalid(format!("endpoint {}: {e}", endpoint.id)))?;
            }
        }
        Ok(())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.regions.values().flat_map(|r| r.endpoints.iter())
    }

    pub fn endpoint(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints().find(|e| e.id == id)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.get(name)
    }

    pub fn into_shared(self) -> SharedSnapshot {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

/// Intervals must be positive and at most one day.
pub fn check_interval(seconds: f64) -> Result<(), String> {
    if seconds.is_finite() && seconds > 0.0 && seconds <= MAX_INTERVAL_SECONDS {
        Ok(())
    } else {
        Err(format!("interval must be > 0 and <= {MAX_INTERVAL_SECONDS} seconds, got {seconds}"))
    }
}

/// Watches the snapshot file and delivers each successfully parsed reload.
///
/// The parent directory is watched so editors that replace the file by rename
/// are still noticed. Unparseable edits are logged and dropped.
pub struct SnapshotWatcher {
    _watcher: RecommendedWatcher,
}

impl SnapshotWatcher {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, mpsc::Receiver<Snapshot>), ConfigError> {
        let path = path.as_ref();
        let (tx, rx) = mpsc::channel(16);

        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| ConfigError::Invalid(format!("{} is not a file path", path.display())))?;
        let dir = match path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let dir = std::fs::canonicalize(&dir).map_err(|source| ConfigError::Io { path: dir, source })?;
        let target = dir.join(&file_name);

        let runtime_handle = tokio::runtime::Handle::current();
        let watched = target.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_access() || !event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                        return;
                    }
                    let tx = tx.clone();
                    let path = watched.clone();
                    runtime_handle.spawn(async move {
                        tokio::time::sleep(RELOAD_DEBOUNCE).await;
                        match tokio::task::spawn_blocking(move || Snapshot::read(&path)).await {
                            Ok(Ok(snapshot)) => {
                                if let Err(e) = tx.send(snapshot).await {
                                    warn!("Failed to deliver reloaded config: {}", e);
                                }
                            }
                            Ok(Err(e)) => error!("Ignoring config reload: {}", e),
                            Err(e) => error!("Config reload task failed: {}", e),
                        }
                    });
                }
                Err(e) => error!("File watcher error: {:?}", e),
            },
            Config::default(),
        )?;

        info!("Watching config file: {}", target.display());
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok((SnapshotWatcher { _watcher: watcher }, rx))
    }
}
