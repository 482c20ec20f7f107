//! TCP connect probe.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{
    classify_io_error, split_host_port, validate_common, Phase, PhaseLog, Probe, ProbeError, Protocol, ProtocolConfig,
    TcpConfig, TestConfig, TestResult, TestStatus,
};

const READ_BUFFER_SIZE: usize = 4096;

/// Times the TCP three-way handshake, optionally followed by a request/response
/// exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

fn tcp_config(config: &TestConfig) -> Option<&TcpConfig> {
    match &config.config {
        ProtocolConfig::Tcp(cfg) => Some(cfg),
        _ => None,
    }
}

/// Resolve `address` and return every candidate socket address.
pub(crate) async fn resolve(address: &str) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {address}"),
        ));
    }
    Ok(addrs)
}

/// Connect to the first reachable address, remembering the most telling error.
pub(crate) async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("TCP connect to {} failed: {}", addr, e);
                // A refusal is a clearer answer than an unreachable fallback address
                let keep_previous = matches!(&last_err, Some(prev) if classify_io_error(prev) == TestStatus::ConnectionRefused);
                if !keep_previous {
                    last_err = Some(e);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")))
}

#[async_trait]
impl Probe for TcpProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Tcp)?;
        split_host_port(&config.address)?;
        let cfg = tcp_config(config).ok_or_else(|| ProbeError::invalid("missing TCP configuration"))?;
        if cfg.expected_data.is_some() && !cfg.expect_response {
            return Err(ProbeError::invalid("expected_data requires expect_response"));
        }
        Ok(())
    }

    async fn run(&self, config: &TestConfig, _deadline: Instant, phases: &mut PhaseLog) -> TestResult {
        let cfg = tcp_config(config).cloned().unwrap_or_default();
        let started = Instant::now();

        let addrs = match resolve(&config.address).await {
            Ok(addrs) => addrs,
            Err(e) => {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_message(format!("DNS resolution failed: {e}"));
            }
        };
        let resolved = Instant::now();
        phases.record(Phase::DnsLookup, resolved - started);

        let mut stream = match connect_any(&addrs).await {
            Ok(stream) => stream,
            Err(e) => {
                return TestResult::new(config, Utc::now(), classify_io_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("connect failed: {e}"));
            }
        };
        let connect_time = resolved.elapsed();
        phases.record(Phase::Connect, connect_time);

        if cfg.send_data.is_none() && !cfg.expect_response {
            return TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(connect_time);
        }

        let exchange_started = Instant::now();
        if let Some(data) = &cfg.send_data {
            if let Err(e) = stream.write_all(data.as_bytes()).await {
                return TestResult::new(config, Utc::now(), classify_io_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("send failed: {e}"));
            }
        }

        if !cfg.expect_response {
            return TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(resolved.elapsed());
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                return TestResult::new(config, Utc::now(), classify_io_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("read failed: {e}"));
            }
        };
        let first_byte = exchange_started.elapsed();
        phases.record(Phase::FirstByte, first_byte);
        let latency = connect_time + first_byte;

        if n == 0 {
            return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                .with_latency(latency)
                .with_message("connection closed before any response");
        }

        if let Some(expected) = &cfg.expected_data {
            let received = String::from_utf8_lossy(&buf[..n]);
            if !received.contains(expected.as_str()) {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_latency(latency)
                    .with_response_size(n as u64)
                    .with_message(format!("response mismatch: expected {expected:?}"));
            }
        }

        TestResult::new(config, Utc::now(), TestStatus::Success)
            .with_latency(latency)
            .with_response_size(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeContext;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(address: &str, cfg: TcpConfig) -> TestConfig {
        TestConfig::new("tcp-local", address, Duration::from_secs(2), ProtocolConfig::Tcp(cfg))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_validate() {
        let probe = TcpProbe;
        assert!(probe.validate(&config("localhost:22", TcpConfig::default())).is_ok());
        assert!(probe.validate(&config("[::1]:22", TcpConfig::default())).is_ok());
        assert!(probe.validate(&config("localhost", TcpConfig::default())).is_err());
        assert!(probe.validate(&config("localhost:0", TcpConfig::default())).is_err());

        let dangling = TcpConfig {
            expected_data: Some("OK".into()),
            ..Default::default()
        };
        assert!(probe.validate(&config("localhost:22", dangling)).is_err());
    }

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let cfg = config(&addr.to_string(), TcpConfig::default());
        let result = TcpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::Success, "{:?}", result.message);
        assert!(result.latency > Duration::ZERO);
        assert!(result.latency < cfg.timeout);
        assert_eq!(result.endpoint_id, "tcp-local");
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let port = closed_port().await;
        let cfg = config(&format!("127.0.0.1:{port}"), TcpConfig::default());
        let result = TcpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_request_response_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PING");
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let cfg = config(
            &addr.to_string(),
            TcpConfig {
                send_data: Some("PING".into()),
                expect_response: true,
                expected_data: Some("PONG".into()),
            },
        );
        let result = TcpProbe.execute_detailed(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.result.status, TestStatus::Success, "{:?}", result.result.message);
        assert_eq!(result.result.response_size, Some(7));
        assert!(result.phases.get(Phase::Connect).is_some());
        assert!(result.phases.get(Phase::FirstByte).is_some());
    }

    #[tokio::test]
    async fn test_response_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"HELLO").await.unwrap();
        });

        let cfg = config(
            &addr.to_string(),
            TcpConfig {
                send_data: None,
                expect_response: true,
                expected_data: Some("WORLD".into()),
            },
        );
        let result = TcpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::NetworkUnreachable);
        assert!(result.message.unwrap().contains("mismatch"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut cfg = config(
            &addr.to_string(),
            TcpConfig {
                send_data: Some("hi".into()),
                expect_response: true,
                expected_data: None,
            },
        );
        cfg.timeout = Duration::from_millis(200);
        let result = TcpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::Timeout);
    }
}
