//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native echoes run on blocking sockets inside `spawn_blocking` for
//! sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant as StdInstant};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::process::Command;
use tokio::time::Instant;

use super::{
    validate_common, IcmpConfig, PhaseLog, Probe, ProbeError, Protocol, ProtocolConfig, RttReport, TestConfig,
    TestResult, TestStatus,
};

const MAX_PACKET_SIZE: usize = 65507;

/// Longest single blocking read. The echo thread checks for abandonment
/// between reads, so this bounds how long a socket outlives a cancelled probe.
const READ_SLICE: Duration = Duration::from_millis(100);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Why a ping attempt produced no round-trip time.
#[derive(Debug)]
enum PingError {
    Timeout,
    /// Destination/host/port unreachable reported by the network.
    Unreachable(String),
    Permission(String),
    Network(String),
}

impl PingError {
    fn into_result(self, config: &TestConfig, elapsed: Duration) -> TestResult {
        let now = Utc::now();
        match self {
            PingError::Timeout => TestResult::new(config, now, TestStatus::Timeout)
                .with_latency(elapsed)
                .with_message("no echo reply before deadline"),
            PingError::Unreachable(msg) => TestResult::new(config, now, TestStatus::ConnectionRefused).with_message(msg),
            PingError::Permission(msg) | PingError::Network(msg) => {
                TestResult::new(config, now, TestStatus::NetworkUnreachable).with_message(msg)
            }
        }
    }
}

/// ICMP echo probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpProbe;

fn icmp_config(config: &TestConfig) -> Option<&IcmpConfig> {
    match &config.config {
        ProtocolConfig::Icmp(cfg) => Some(cfg),
        _ => None,
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Icmp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Icmp)?;
        let cfg = icmp_config(config).ok_or_else(|| ProbeError::invalid("missing ICMP configuration"))?;

        if config.address.parse::<IpAddr>().is_err() && !is_hostname(&config.address) {
            return Err(ProbeError::invalid(format!(
                "invalid address {:?} (expected IP address or hostname without port)",
                config.address
            )));
        }
        if cfg.count == 0 {
            return Err(ProbeError::invalid("count must be at least 1"));
        }
        if cfg.packet_size > MAX_PACKET_SIZE {
            return Err(ProbeError::invalid(format!(
                "packet size must be between 0 and {MAX_PACKET_SIZE}"
            )));
        }
        if !(1..=255).contains(&cfg.ttl) {
            return Err(ProbeError::invalid("TTL must be between 1 and 255"));
        }
        Ok(())
    }

    async fn run(&self, config: &TestConfig, deadline: Instant, _phases: &mut PhaseLog) -> TestResult {
        let cfg = icmp_config(config).cloned().unwrap_or_default();
        let started = Instant::now();

        let outcome = run_ping(&config.address, &cfg, deadline).await;
        match outcome {
            Ok(rtt) => TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(rtt),
            Err(e) => {
                tracing::debug!("ICMP probe for {} failed: {:?}", config.address, e);
                e.into_result(config, started.elapsed())
            }
        }
    }
}

fn is_hostname(address: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?)*\.?$")
            .expect("hostname regex is valid")
    });
    address.len() <= 253 && re.is_match(address)
}

fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("ICMP probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

async fn run_ping(address: &str, cfg: &IcmpConfig, deadline: Instant) -> Result<Duration, PingError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;
        let budget = deadline.saturating_duration_since(Instant::now());
        let blocking_cfg = cfg.clone();

        // Dropping this future (deadline or cancellation) flags the blocking
        // thread, which then closes its socket within one read slice.
        let guard = AbandonOnDrop::new();
        let abandoned = guard.flag();
        let result = tokio::task::spawn_blocking(move || ping_blocking(ip, &blocking_cfg, budget, &abandoned))
            .await
            .map_err(|e| PingError::Network(format!("spawn_blocking failed: {}", e)))?;
        drop(guard);

        match result {
            Err(PingError::Permission(msg)) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            other => return other,
        }
    }

    run_ping_command(address, cfg, deadline).await
}

async fn resolve_address(address: &str) -> Result<IpAddr, PingError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| PingError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| PingError::Network(format!("no addresses found for {}", address)))
}

/// Sets a shared flag when dropped, telling the echo thread to give up.
struct AbandonOnDrop(Arc<AtomicBool>);

impl AbandonOnDrop {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Send `count` echoes one after another within `budget` and report the RTT.
fn ping_blocking(ip: IpAddr, cfg: &IcmpConfig, budget: Duration, abandoned: &AtomicBool) -> Result<Duration, PingError> {
    if abandoned.load(Ordering::SeqCst) {
        return Err(PingError::Timeout);
    }
    let started = StdInstant::now();
    let mut socket = EchoSocket::open(ip, cfg.ttl)?;
    let mut rtts = Vec::with_capacity(cfg.count as usize);

    for _ in 0..cfg.count {
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(PingError::Timeout);
        }
        rtts.push(socket.echo(cfg.packet_size, remaining, abandoned)?);
    }

    match cfg.report {
        RttReport::Last => rtts.last().copied().ok_or(PingError::Timeout),
        RttReport::Average => {
            let total: Duration = rtts.iter().sum();
            Ok(total / rtts.len().max(1) as u32)
        }
    }
}

struct EchoSocket {
    socket: Socket,
    ip: IpAddr,
    raw: bool,
}

impl EchoSocket {
    fn open(ip: IpAddr, ttl: u32) -> Result<Self, PingError> {
        let (domain, proto) = match ip {
            IpAddr::V4(_) => (Domain::IPV4, SockProtocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, SockProtocol::ICMPV6),
        };

        // Try RAW first (privileged), then DGRAM (unprivileged)
        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(proto)) {
            Ok(s) => (s, true),
            Err(_) => {
                let s = Socket::new(domain, Type::DGRAM, Some(proto)).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        PingError::Permission(format!("failed to create ICMP socket: {}", e))
                    } else {
                        PingError::Network(format!("failed to create ICMP socket: {}", e))
                    }
                })?;
                (s, false)
            }
        };

        let ttl_result = match ip {
            IpAddr::V4(_) => socket.set_ttl(ttl),
            IpAddr::V6(_) => socket.set_unicast_hops_v6(ttl),
        };
        if let Err(e) = ttl_result {
            tracing::debug!("ICMP probe: failed to set TTL {}: {}", ttl, e);
        }

        let dest = SocketAddr::new(ip, 0);
        socket
            .connect(&dest.into())
            .map_err(|e| PingError::Network(format!("failed to connect: {}", e)))?;

        Ok(Self { socket, ip, raw })
    }

    fn echo(&mut self, payload_size: usize, timeout: Duration, abandoned: &AtomicBool) -> Result<Duration, PingError> {
        let (identifier, sequence) = generate_ping_id();
        let packet = match self.ip {
            IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence, payload_size),
            IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence, payload_size),
        };

        self.socket
            .set_write_timeout(Some(timeout))
            .and_then(|_| self.socket.set_read_timeout(Some(timeout)))
            .map_err(|e| PingError::Network(format!("failed to set timeout: {}", e)))?;

        let start = StdInstant::now();
        self.socket.send(&packet).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => PingError::Permission(format!("permission denied: {}", e)),
            _ => PingError::Network(format!("failed to send: {}", e)),
        })?;

        // Receive until our reply arrives or the timeout expires
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() || abandoned.load(Ordering::SeqCst) {
                return Err(PingError::Timeout);
            }
            let _ = self.socket.set_read_timeout(Some(read_slice(remaining)));

            let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
                Err(e) => return Err(recv_error(e)),
            };
            // SAFETY: recv initialized the first `len` bytes of `buf`.
            let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            let elapsed = start.elapsed();
            match classify_reply(buf, self.ip.is_ipv4(), self.raw, identifier, sequence) {
                Reply::Echo => return Ok(elapsed),
                Reply::Unreachable(code) => {
                    return Err(PingError::Unreachable(format!("destination unreachable (code {})", code)))
                }
                Reply::Other => continue,
            }
        }
    }
}

fn read_slice(remaining: Duration) -> Duration {
    remaining.min(READ_SLICE)
}

fn recv_error(e: std::io::Error) -> PingError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => PingError::Unreachable(format!("destination unreachable: {}", e)),
        _ if e.to_string().to_lowercase().contains("unreachable") => {
            PingError::Unreachable(format!("destination unreachable: {}", e))
        }
        _ => PingError::Network(format!("failed to receive: {}", e)),
    }
}

#[derive(Debug, PartialEq)]
enum Reply {
    Echo,
    Unreachable(u8),
    Other,
}

/// Decide whether `buf` answers the echo `(identifier, sequence)`.
///
/// RAW IPv4 sockets deliver the IP header too. DGRAM sockets let the kernel
/// rewrite the identifier, so only the sequence is matched there.
fn classify_reply(buf: &[u8], ipv4: bool, raw: bool, identifier: u16, sequence: u16) -> Reply {
    let offset = if ipv4 && raw && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0f) as usize) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return Reply::Other;
    }

    let icmp = &buf[offset..];
    let (echo_reply, unreachable) = if ipv4 { (0u8, 3u8) } else { (129u8, 1u8) };
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    if icmp[0] == echo_reply && reply_seq == sequence && (!raw || reply_id == identifier) {
        return Reply::Echo;
    }

    if icmp[0] == unreachable {
        // Body carries the offending datagram: IP header (v4 only) then our echo header
        let inner = &icmp[8..];
        let inner_offset = if ipv4 && !inner.is_empty() {
            ((inner[0] & 0x0f) as usize) * 4
        } else if !ipv4 {
            40
        } else {
            0
        };
        if inner.len() >= inner_offset + 8 {
            let orig = &inner[inner_offset..];
            let orig_seq = u16::from_be_bytes([orig[6], orig[7]]);
            if orig_seq == sequence {
                return Reply::Unreachable(icmp[1]);
            }
        }
    }

    Reply::Other
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = echo_header(8, identifier, sequence, payload_size);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel computes the ICMPv6 checksum, so it is left as zero.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    echo_header(128, identifier, sequence, payload_size)
}

fn echo_header(kind: u8, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + payload_size];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
        .to_be_bytes();
    let n = payload_size.min(timestamp.len());
    packet[8..8 + n].copy_from_slice(&timestamp[..n]);
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, cfg: &IcmpConfig, deadline: Instant) -> Result<Duration, PingError> {
    let budget = deadline.saturating_duration_since(Instant::now());
    let wait_secs = budget.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &cfg.count.to_string(),
            "-W",
            &wait_secs.to_string(),
            "-s",
            &cfg.packet_size.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PingError::Network(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("Unreachable") || stderr.contains("Unreachable") {
            return Err(PingError::Unreachable(format!("ping reported unreachable: {}", stdout.trim())));
        }
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(PingError::Timeout);
        }
        return Err(PingError::Network(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout, cfg.report)
        .ok_or_else(|| PingError::Network(format!("failed to parse ping output: {}", stdout)))
}

/// Parse ping command output for the round-trip time.
fn parse_ping_output(output: &str, report: RttReport) -> Option<Duration> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    // Per-packet "time=X.XXX ms" (Linux, macOS)
    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid regex"));
    // Summary "rtt min/avg/max/mdev = ..." (Linux) or "round-trip min/avg/max/stddev = ..." (macOS)
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("valid regex")
    });

    let ms_to_duration = |s: &str| s.parse::<f64>().ok().map(|ms| Duration::from_secs_f64(ms / 1000.0));

    let samples: Vec<Duration> = per_packet
        .captures_iter(output)
        .filter_map(|c| c.name("val").and_then(|m| ms_to_duration(m.as_str())))
        .collect();

    match report {
        RttReport::Last => {
            if let Some(last) = samples.last() {
                return Some(*last);
            }
        }
        RttReport::Average => {
            if let Some(avg) = summary.captures(output).and_then(|c| c.get(2)) {
                return ms_to_duration(avg.as_str());
            }
        }
    }

    if samples.is_empty() {
        return summary
            .captures(output)
            .and_then(|c| c.get(2))
            .and_then(|m| ms_to_duration(m.as_str()));
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(address: &str, cfg: IcmpConfig) -> TestConfig {
        TestConfig::new("icmp", address, Duration::from_secs(1), ProtocolConfig::Icmp(cfg))
    }

    #[test]
    fn test_abandoned_echo_thread_gives_up() {
        let guard = AbandonOnDrop::new();
        let flag = guard.flag();
        assert!(!flag.load(Ordering::SeqCst));
        drop(guard);
        assert!(flag.load(Ordering::SeqCst));

        // Returns without opening a socket or waiting out the budget
        let started = StdInstant::now();
        let result = ping_blocking("127.0.0.1".parse().unwrap(), &IcmpConfig::default(), Duration::from_secs(30), &flag);
        assert!(matches!(result, Err(PingError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(read_slice(Duration::from_secs(5)), READ_SLICE);
        assert_eq!(read_slice(Duration::from_millis(20)), Duration::from_millis(20));
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001, 56);
        // A packet carrying its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001, 32);
        assert_eq!(packet.len(), 40);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_icmpv6_echo_request(1, 2, 0);
        assert_eq!(v6.len(), 8);
        assert_eq!(v6[0], 128);
    }

    #[test]
    fn test_classify_reply_dgram_ignores_identifier() {
        let mut reply = build_icmp_echo_request(0xAAAA, 7, 8);
        reply[0] = 0;
        assert_eq!(classify_reply(&reply, true, false, 0x1111, 7), Reply::Echo);
        assert_eq!(classify_reply(&reply, true, false, 0x1111, 8), Reply::Other);
        // RAW sockets must match the identifier as well
        assert_eq!(classify_reply(&reply, true, true, 0x1111, 7), Reply::Other);
    }

    #[test]
    fn test_classify_reply_unreachable() {
        let original = build_icmp_echo_request(0x0102, 9, 8);
        let mut ip_header = vec![0u8; 20];
        ip_header[0] = 0x45;
        let mut msg = vec![3u8, 1, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&ip_header);
        msg.extend_from_slice(&original[..8]);
        assert_eq!(classify_reply(&msg, true, false, 0x0102, 9), Reply::Unreachable(1));
    }

    #[test]
    fn test_validate() {
        let probe = IcmpProbe;
        assert!(probe.validate(&config("8.8.8.8", IcmpConfig::default())).is_ok());
        assert!(probe.validate(&config("dns.google", IcmpConfig::default())).is_ok());
        assert!(probe.validate(&config("::1", IcmpConfig::default())).is_ok());
        assert!(probe.validate(&config("8.8.8.8:53", IcmpConfig::default())).is_err());
        assert!(probe.validate(&config("", IcmpConfig::default())).is_err());

        let zero_count = IcmpConfig { count: 0, ..Default::default() };
        assert!(probe.validate(&config("8.8.8.8", zero_count)).is_err());
        let huge = IcmpConfig { packet_size: 70_000, ..Default::default() };
        assert!(probe.validate(&config("8.8.8.8", huge)).is_err());
        let bad_ttl = IcmpConfig { ttl: 0, ..Default::default() };
        assert!(probe.validate(&config("8.8.8.8", bad_ttl)).is_err());
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output, RttReport::Last).unwrap();
        assert!((latency.as_secs_f64() * 1000.0 - 12.345).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output, RttReport::Average).unwrap();
        assert!((latency.as_secs_f64() * 1000.0 - 17.906).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ping_output_report_modes() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=10.0 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=30.0 ms

--- 8.8.8.8 ping statistics ---
2 packets transmitted, 2 received, 0% packet loss, time 1001ms
rtt min/avg/max/mdev = 10.000/20.000/30.000/10.000 ms"#;
        let last = parse_ping_output(output, RttReport::Last).unwrap();
        assert_eq!(last, Duration::from_millis(30));
        let avg = parse_ping_output(output, RttReport::Average).unwrap();
        assert_eq!(avg, Duration::from_millis(20));
    }
}
