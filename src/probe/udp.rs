//! UDP request/response probe.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::tcp::resolve;
use super::{
    classify_io_error, split_host_port, validate_common, Phase, PhaseLog, Probe, ProbeError, Protocol, ProtocolConfig,
    TestConfig, TestResult, TestStatus, UdpConfig,
};

const DEFAULT_PAYLOAD: &str = "PING";
const MAX_DATAGRAM: usize = 65507;

/// Sends one datagram and, unless the service is silent, waits for a reply.
///
/// The socket stays unconnected and replies are filtered by source address, so
/// a closed port shows up as a timeout rather than an ICMP-driven refusal.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpProbe;

fn udp_config(config: &TestConfig) -> Option<&UdpConfig> {
    match &config.config {
        ProtocolConfig::Udp(cfg) => Some(cfg),
        _ => None,
    }
}

fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[async_trait]
impl Probe for UdpProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Udp)?;
        split_host_port(&config.address)?;
        let cfg = udp_config(config).ok_or_else(|| ProbeError::invalid("missing UDP configuration"))?;
        if cfg.expect_response && (cfg.response_size == 0 || cfg.response_size > MAX_DATAGRAM) {
            return Err(ProbeError::invalid(format!(
                "response_size must be between 1 and {MAX_DATAGRAM}"
            )));
        }
        if cfg.send_data.as_ref().is_some_and(|d| d.len() > MAX_DATAGRAM) {
            return Err(ProbeError::invalid("send_data does not fit in a single datagram"));
        }
        Ok(())
    }

    async fn run(&self, config: &TestConfig, _deadline: Instant, phases: &mut PhaseLog) -> TestResult {
        let cfg = udp_config(config).cloned().unwrap_or_default();
        let started = Instant::now();

        let target = match resolve(&config.address).await {
            Ok(addrs) => addrs[0],
            Err(e) => {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_message(format!("DNS resolution failed: {e}"));
            }
        };
        phases.record(Phase::DnsLookup, started.elapsed());

        let socket = match UdpSocket::bind(unspecified_for(&target)).await {
            Ok(socket) => socket,
            Err(e) => {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_message(format!("failed to bind socket: {e}"));
            }
        };

        let payload = cfg.send_data.as_deref().unwrap_or(DEFAULT_PAYLOAD);
        let sent_at = Instant::now();
        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
            return TestResult::new(config, Utc::now(), classify_io_error(&e))
                .with_latency(started.elapsed())
                .with_message(format!("send failed: {e}"));
        }

        if !cfg.expect_response {
            return TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(sent_at.elapsed());
        }

        let mut buf = vec![0u8; cfg.response_size];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) if from == target => {
                    let latency = sent_at.elapsed();
                    phases.record(Phase::FirstByte, latency);
                    return TestResult::new(config, Utc::now(), TestStatus::Success)
                        .with_latency(latency)
                        .with_response_size(n as u64);
                }
                Ok((_, from)) => {
                    tracing::debug!("UDP probe {} ignoring datagram from {}", config.endpoint_id, from);
                }
                Err(e) => {
                    return TestResult::new(config, Utc::now(), classify_io_error(&e))
                        .with_latency(started.elapsed())
                        .with_message(format!("receive failed: {e}"));
                }
            }
        }
    }
}
