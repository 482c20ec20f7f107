//! Probe module for network monitoring.
//!
//! Supports ICMP, TCP, UDP and HTTP/HTTPS probes behind the shared [`Probe`]
//! contract. Every probe returns a [`TestResult`]; ordinary network failures are
//! reported through [`TestStatus`], never as errors.

mod http;
mod icmp;
mod registry;
mod tcp;
mod udp;

pub use http::*;
pub use icmp::*;
pub use registry::*;
pub use tcp::*;
pub use udp::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Probe error types.
///
/// Only configuration problems are errors; everything that happens on the wire
/// ends up in [`TestResult::status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("no probe registered for protocol {0}")]
    Unsupported(Protocol),
}

impl ProbeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProbeError::Validation(msg.into())
    }
}

/// Network protocol a probe speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "ICMP")]
    Icmp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "HTTP", alias = "HTTPS")]
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Icmp, Protocol::Tcp, Protocol::Udp, Protocol::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "ICMP",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Timeout,
    ConnectionRefused,
    InvalidConfig,
    NetworkUnreachable,
    Cancelled,
}

impl TestStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TestStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Success => "success",
            TestStatus::Timeout => "timeout",
            TestStatus::ConnectionRefused => "connection_refused",
            TestStatus::InvalidConfig => "invalid_config",
            TestStatus::NetworkUnreachable => "network_unreachable",
            TestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an ICMP probe with `count > 1` reports its round-trip time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RttReport {
    Last,
    #[default]
    Average,
}

/// ICMP echo parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    /// Number of echo requests sent within one deadline.
    pub count: u32,
    /// Echo payload size in bytes.
    pub packet_size: usize,
    pub ttl: u32,
    pub report: RttReport,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            count: 1,
            packet_size: 56,
            ttl: 64,
            report: RttReport::Average,
        }
    }
}

/// TCP connect parameters. Without `send_data`/`expect_response` only the
/// handshake is timed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub send_data: Option<String>,
    pub expect_response: bool,
    /// Substring that must appear in the first chunk read back.
    pub expected_data: Option<String>,
}

/// UDP parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub send_data: Option<String>,
    /// When false the service is silent by design and a successful send counts
    /// as success.
    pub expect_response: bool,
    pub response_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            send_data: None,
            expect_response: true,
            response_size: 1024,
        }
    }
}

/// HTTP/HTTPS request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub follow_redirects: bool,
    pub validate_tls: bool,
    /// Expected status code; 0 accepts any 2xx.
    pub expected_status: u16,
    pub body_contains: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            follow_redirects: true,
            validate_tls: true,
            expected_status: 0,
            body_contains: None,
        }
    }
}

/// Protocol-specific part of a [`TestConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolConfig {
    Icmp(IcmpConfig),
    Tcp(TcpConfig),
    Udp(UdpConfig),
    Http(HttpConfig),
}

impl ProtocolConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolConfig::Icmp(_) => Protocol::Icmp,
            ProtocolConfig::Tcp(_) => Protocol::Tcp,
            ProtocolConfig::Udp(_) => Protocol::Udp,
            ProtocolConfig::Http(_) => Protocol::Http,
        }
    }

    pub fn default_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Icmp => ProtocolConfig::Icmp(IcmpConfig::default()),
            Protocol::Tcp => ProtocolConfig::Tcp(TcpConfig::default()),
            Protocol::Udp => ProtocolConfig::Udp(UdpConfig::default()),
            Protocol::Http => ProtocolConfig::Http(HttpConfig::default()),
        }
    }
}

/// Parameters for one test attempt. Built fresh from an endpoint each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub endpoint_id: String,
    pub address: String,
    pub timeout: Duration,
    pub config: ProtocolConfig,
}

impl TestConfig {
    pub fn new(
        endpoint_id: impl Into<String>,
        address: impl Into<String>,
        timeout: Duration,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            address: address.into(),
            timeout,
            config,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol()
    }
}

/// Serde helpers that store a [`Duration`] as fractional milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}

/// The atomic output of a probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
    pub protocol: Protocol,
    /// Only meaningful when `status` is [`TestStatus::Success`].
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
}

impl TestResult {
    pub fn new(config: &TestConfig, timestamp: DateTime<Utc>, status: TestStatus) -> Self {
        Self {
            timestamp,
            endpoint_id: config.endpoint_id.clone(),
            protocol: config.protocol(),
            latency: Duration::ZERO,
            status,
            message: None,
            response_size: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_response_size(mut self, size: u64) -> Self {
        self.response_size = Some(size);
        self
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// A named timing phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DnsLookup,
    Connect,
    TlsHandshake,
    FirstByte,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// Append-only log of timing phases.
///
/// A disabled log ignores every record so scheduled runs pay nothing for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseLog {
    #[serde(skip)]
    enabled: bool,
    entries: Vec<PhaseTiming>,
}

impl PhaseLog {
    pub fn new() -> Self {
        Self {
            enabled: true,
            entries: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, phase: Phase, duration: Duration) {
        if self.enabled {
            self.entries.push(PhaseTiming { phase, duration });
        }
    }

    pub fn get(&self, phase: Phase) -> Option<Duration> {
        self.entries.iter().find(|e| e.phase == phase).map(|e| e.duration)
    }

    pub fn entries(&self) -> &[PhaseTiming] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A [`TestResult`] plus its phase log, produced by manual runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedTestResult {
    #[serde(flatten)]
    pub result: TestResult,
    pub phases: PhaseLog,
    #[serde(rename = "execution_time_ms", with = "duration_ms")]
    pub execution_time: Duration,
}

/// Per-invocation context: carries the cooperative cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct ProbeContext {
    cancel: CancellationToken,
}

impl ProbeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Shared contract implemented by every protocol probe.
///
/// Implementors provide [`Probe::validate`] and [`Probe::run`]; the provided
/// `execute*` methods add validation, the deadline and cancellation. Dropping
/// the `run` future must release every socket it holds.
#[async_trait]
pub trait Probe: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn protocol_name(&self) -> &'static str {
        self.protocol().as_str()
    }

    /// Check the configuration without performing any I/O.
    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError>;

    /// Perform the attempt. `deadline` is the instant the outer timeout fires;
    /// blocking helpers use it to bound their own waits.
    async fn run(&self, config: &TestConfig, deadline: Instant, phases: &mut PhaseLog) -> TestResult;

    async fn execute(&self, ctx: &ProbeContext, config: &TestConfig) -> TestResult {
        let mut phases = PhaseLog::disabled();
        self.execute_traced(ctx, config, &mut phases).await
    }

    async fn execute_detailed(&self, ctx: &ProbeContext, config: &TestConfig) -> DetailedTestResult {
        let started = std::time::Instant::now();
        let mut phases = PhaseLog::new();
        let result = self.execute_traced(ctx, config, &mut phases).await;
        DetailedTestResult {
            result,
            phases,
            execution_time: started.elapsed(),
        }
    }

    async fn execute_traced(
        &self,
        ctx: &ProbeContext,
        config: &TestConfig,
        phases: &mut PhaseLog,
    ) -> TestResult {
        let timestamp = Utc::now();

        if let Err(e) = self.validate(config) {
            return TestResult::new(config, timestamp, TestStatus::InvalidConfig).with_message(e.to_string());
        }

        let started = Instant::now();
        let deadline = started + config.timeout;

        // The run future is polled first so a probe that already finished keeps
        // its natural result even if cancellation fired in the same instant.
        tokio::select! {
            biased;
            outcome = tokio::time::timeout_at(deadline, self.run(config, deadline, phases)) => match outcome {
                Ok(mut result) => {
                    result.timestamp = timestamp;
                    result
                }
                Err(_) => TestResult::new(config, timestamp, TestStatus::Timeout)
                    .with_latency(started.elapsed())
                    .with_message(format!("no response within {:?}", config.timeout)),
            },
            _ = ctx.cancellation().cancelled() => {
                TestResult::new(config, timestamp, TestStatus::Cancelled)
                    .with_latency(started.elapsed())
                    .with_message("cancelled")
            }
        }
    }
}

/// Map an I/O failure onto the result status taxonomy.
pub(crate) fn classify_io_error(err: &io::Error) -> TestStatus {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => TestStatus::ConnectionRefused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TestStatus::Timeout,
        _ => TestStatus::NetworkUnreachable,
    }
}

/// Split `host:port` (or `[v6]:port`) and check the port range.
pub(crate) fn split_host_port(address: &str) -> Result<(String, u16), ProbeError> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProbeError::invalid(format!("unterminated IPv6 literal in {address:?}")))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ProbeError::invalid(format!("missing port in {address:?}")))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ProbeError::invalid(format!("invalid address {address:?} (expected host:port)")))?;
        if host.contains(':') {
            return Err(ProbeError::invalid(format!(
                "IPv6 address {address:?} must be written as [addr]:port"
            )));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(ProbeError::invalid("host cannot be empty"));
    }

    let port: u32 = port
        .parse()
        .map_err(|_| ProbeError::invalid(format!("invalid port number {port:?}")))?;
    if !(1..=65535).contains(&port) {
        return Err(ProbeError::invalid(format!("port must be between 1 and 65535, got {port}")));
    }

    Ok((host.to_string(), port as u16))
}

/// Common checks shared by every probe's `validate`.
pub(crate) fn validate_common(config: &TestConfig, expected: Protocol) -> Result<(), ProbeError> {
    if config.protocol() != expected {
        return Err(ProbeError::invalid(format!(
            "{} probe received a {} configuration",
            expected,
            config.protocol()
        )));
    }
    if config.address.trim().is_empty() {
        return Err(ProbeError::invalid(format!("address is required for {expected} test")));
    }
    if config.timeout.is_zero() {
        return Err(ProbeError::invalid("timeout must be greater than zero"));
    }
    Ok(())
}
