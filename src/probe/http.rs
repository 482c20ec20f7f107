//! HTTP/HTTPS probe implementation.
//!
//! The request is driven in stages so each phase can be timed: DNS lookup,
//! a standalone TCP connect, then the request itself through a client pinned
//! to the resolved address.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Method, Url};
use tokio::time::Instant;

use super::tcp::{connect_any, resolve};
use super::{
    classify_io_error, validate_common, HttpConfig, Phase, PhaseLog, Probe, ProbeError, Protocol, ProtocolConfig,
    TestConfig, TestResult, TestStatus,
};

pub const USER_AGENT: &str = "NetworkMonitor/1.0";

const SUPPORTED_METHODS: [&str; 4] = ["GET", "HEAD", "POST", "PUT"];
const MAX_REDIRECTS: usize = 10;

/// HTTP/HTTPS request probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProbe;

fn http_config(config: &TestConfig) -> Option<&HttpConfig> {
    match &config.config {
        ProtocolConfig::Http(cfg) => Some(cfg),
        _ => None,
    }
}

fn parse_url(address: &str) -> Result<Url, ProbeError> {
    let url = Url::parse(address).map_err(|e| ProbeError::invalid(format!("invalid URL {address:?}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProbeError::invalid(format!(
            "unsupported URL scheme {:?} (expected http or https)",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProbeError::invalid(format!("URL {address:?} has no host")));
    }
    Ok(url)
}

fn parse_method(method: &str) -> Result<Method, ProbeError> {
    let upper = method.to_ascii_uppercase();
    if !SUPPORTED_METHODS.contains(&upper.as_str()) {
        return Err(ProbeError::invalid(format!("unsupported HTTP method {method:?}")));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|e| ProbeError::invalid(e.to_string()))
}

fn build_headers(cfg: &HttpConfig) -> Result<HeaderMap, ProbeError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &cfg.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProbeError::invalid(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProbeError::invalid(format!("invalid value for header {name}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// `host:port` with IPv6 literals bracketed.
fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Map a reqwest failure onto the status taxonomy, looking through the error
/// chain for the underlying I/O error.
fn classify_reqwest_error(err: &reqwest::Error) -> TestStatus {
    if err.is_timeout() {
        return TestStatus::Timeout;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return classify_io_error(io_err);
        }
        source = cause.source();
    }
    TestStatus::NetworkUnreachable
}

/// Times the stages of one request. Phases are kept locally and written to
/// the log in canonical order once the request finishes.
#[derive(Default)]
struct Timings {
    dns: Option<Duration>,
    connect: Option<Duration>,
    tls: Option<Duration>,
    first_byte: Option<Duration>,
    transfer: Option<Duration>,
}

impl Timings {
    fn flush(&self, phases: &mut PhaseLog) {
        let ordered = [
            (Phase::DnsLookup, self.dns),
            (Phase::Connect, self.connect),
            (Phase::TlsHandshake, self.tls),
            (Phase::FirstByte, self.first_byte),
            (Phase::Transfer, self.transfer),
        ];
        for (phase, duration) in ordered {
            if let Some(d) = duration {
                phases.record(phase, d);
            }
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Http)?;
        parse_url(&config.address)?;
        let cfg = http_config(config).ok_or_else(|| ProbeError::invalid("missing HTTP configuration"))?;
        parse_method(&cfg.method)?;
        build_headers(cfg)?;
        if cfg.expected_status != 0 && !(100..=599).contains(&cfg.expected_status) {
            return Err(ProbeError::invalid(format!(
                "expected_status must be 0 or a valid status code, got {}",
                cfg.expected_status
            )));
        }
        Ok(())
    }

    async fn run(&self, config: &TestConfig, deadline: Instant, phases: &mut PhaseLog) -> TestResult {
        let mut timings = Timings::default();
        let result = self.request(config, deadline, phases.is_enabled(), &mut timings).await;
        timings.flush(phases);
        result
    }
}

impl HttpProbe {
    async fn request(&self, config: &TestConfig, deadline: Instant, detailed: bool, timings: &mut Timings) -> TestResult {
        let invalid = |e: ProbeError| TestResult::new(config, Utc::now(), TestStatus::InvalidConfig).with_message(e.to_string());

        let cfg = match http_config(config) {
            Some(cfg) => cfg,
            None => return invalid(ProbeError::invalid("missing HTTP configuration")),
        };
        let url = match parse_url(&config.address) {
            Ok(url) => url,
            Err(e) => return invalid(e),
        };
        let (method, headers) = match (parse_method(&cfg.method), build_headers(cfg)) {
            (Ok(m), Ok(h)) => (m, h),
            (Err(e), _) | (_, Err(e)) => return invalid(e),
        };

        let started = Instant::now();
        let host = url.host_str().unwrap_or_default().trim_matches(&['[', ']'][..]).to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let addrs = match resolve(&host_port(&host, port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_message(format!("DNS resolution failed: {e}"));
            }
        };
        let dns_time = started.elapsed();
        timings.dns = Some(dns_time);

        let connect_started = Instant::now();
        match connect_any(&addrs).await {
            Ok(stream) => drop(stream),
            Err(e) => {
                return TestResult::new(config, Utc::now(), classify_io_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("connect failed: {e}"));
            }
        }
        let connect_time = connect_started.elapsed();
        timings.connect = Some(connect_time);

        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut builder = reqwest::Client::builder()
            .timeout(remaining)
            .user_agent(USER_AGENT)
            .redirect(if cfg.follow_redirects {
                redirect::Policy::limited(MAX_REDIRECTS)
            } else {
                redirect::Policy::none()
            })
            .danger_accept_invalid_certs(!cfg.validate_tls);
        if host.parse::<std::net::IpAddr>().is_err() {
            builder = builder.resolve(&host, addrs[0]);
        }
        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_message(format!("failed to build HTTP client: {e}"));
            }
        };

        let mut request = client.request(method, url.clone()).headers(headers);
        if let Some(body) = &cfg.body {
            request = request.body(body.clone());
        }

        let sent = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return TestResult::new(config, Utc::now(), classify_reqwest_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("request failed: {e}"));
            }
        };
        let first_byte = sent.elapsed();
        timings.first_byte = Some(first_byte);
        let status = response.status();

        let body_started = Instant::now();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return TestResult::new(config, Utc::now(), classify_reqwest_error(&e))
                    .with_latency(started.elapsed())
                    .with_message(format!("failed to read body: {e}"));
            }
        };
        let transfer = body_started.elapsed();
        timings.transfer = Some(transfer);
        let latency = dns_time + first_byte + transfer;

        if detailed && url.scheme() == "https" {
            timings.tls = estimate_tls(&client, &url, deadline, first_byte, connect_time).await;
        }

        let status_ok = if cfg.expected_status == 0 {
            status.is_success()
        } else {
            status.as_u16() == cfg.expected_status
        };
        if !status_ok {
            let expected = match cfg.expected_status {
                0 => "2xx".to_string(),
                code => code.to_string(),
            };
            return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                .with_latency(latency)
                .with_response_size(body.len() as u64)
                .with_message(format!("unexpected status {} (expected {expected})", status.as_u16()));
        }

        if let Some(needle) = &cfg.body_contains {
            if !String::from_utf8_lossy(&body).contains(needle.as_str()) {
                return TestResult::new(config, Utc::now(), TestStatus::NetworkUnreachable)
                    .with_latency(latency)
                    .with_response_size(body.len() as u64)
                    .with_message(format!("response body does not contain {needle:?}"));
            }
        }

        TestResult::new(config, Utc::now(), TestStatus::Success)
            .with_latency(latency)
            .with_response_size(body.len() as u64)
    }
}

/// Estimate the TLS handshake by repeating a HEAD over the pooled connection.
async fn estimate_tls(
    client: &reqwest::Client,
    url: &Url,
    deadline: Instant,
    fresh_first_byte: Duration,
    connect: Duration,
) -> Option<Duration> {
    let cutoff = deadline.checked_sub(Duration::from_millis(10))?;
    let started = Instant::now();
    let repeat = tokio::time::timeout_at(cutoff, client.head(url.clone()).send()).await.ok()?.ok()?;
    let warm_first_byte = started.elapsed();
    drop(repeat);

    fresh_first_byte
        .checked_sub(warm_first_byte)?
        .checked_sub(connect)
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeContext;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { "hello monitor" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .route(
                "/ua",
                get(|headers: axum::http::HeaderMap| async move {
                    headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn config(url: &str, cfg: HttpConfig) -> TestConfig {
        TestConfig::new("http-local", url, Duration::from_secs(2), ProtocolConfig::Http(cfg))
    }

    #[test]
    fn test_validate() {
        let probe = HttpProbe;
        assert!(probe.validate(&config("https://example.com/health", HttpConfig::default())).is_ok());
        assert!(probe.validate(&config("example.com", HttpConfig::default())).is_err());
        assert!(probe.validate(&config("ftp://example.com", HttpConfig::default())).is_err());

        let delete = HttpConfig {
            method: "DELETE".into(),
            ..Default::default()
        };
        assert!(probe.validate(&config("http://example.com", delete)).is_err());

        let mut bad_header = HttpConfig::default();
        bad_header.headers.insert("bad header".into(), "x".into());
        assert!(probe.validate(&config("http://example.com", bad_header)).is_err());
    }

    #[tokio::test]
    async fn test_get_success_with_phases() {
        let addr = serve().await;
        let cfg = config(&format!("http://{addr}/"), HttpConfig::default());
        let detailed = HttpProbe.execute_detailed(&ProbeContext::new(), &cfg).await;

        assert_eq!(detailed.result.status, TestStatus::Success, "{:?}", detailed.result.message);
        assert_eq!(detailed.result.response_size, Some("hello monitor".len() as u64));
        let phases: Vec<Phase> = detailed.phases.entries().iter().map(|p| p.phase).collect();
        assert_eq!(phases, vec![Phase::DnsLookup, Phase::Connect, Phase::FirstByte, Phase::Transfer]);
    }

    #[tokio::test]
    async fn test_scheduled_run_skips_phase_log() {
        let addr = serve().await;
        let cfg = config(&format!("http://{addr}/"), HttpConfig::default());
        let mut phases = PhaseLog::disabled();
        let result = HttpProbe.execute_traced(&ProbeContext::new(), &cfg, &mut phases).await;
        assert_eq!(result.status, TestStatus::Success);
        assert!(phases.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let addr = serve().await;
        let cfg = config(&format!("http://{addr}/missing"), HttpConfig::default());
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::NetworkUnreachable);
        assert!(result.message.unwrap().contains("404"));

        let expect_404 = HttpConfig {
            expected_status: 404,
            ..Default::default()
        };
        let cfg = config(&format!("http://{addr}/missing"), expect_404);
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::Success);
    }

    #[tokio::test]
    async fn test_body_predicate_and_user_agent() {
        let addr = serve().await;
        let cfg = config(
            &format!("http://{addr}/ua"),
            HttpConfig {
                body_contains: Some(USER_AGENT.into()),
                ..Default::default()
            },
        );
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::Success, "{:?}", result.message);

        let cfg = config(
            &format!("http://{addr}/"),
            HttpConfig {
                body_contains: Some("absent".into()),
                ..Default::default()
            },
        );
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::NetworkUnreachable);
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let addr = serve().await;
        let mut cfg = config(&format!("http://{addr}/slow"), HttpConfig::default());
        cfg.timeout = Duration::from_millis(300);
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::Timeout);
    }

    #[tokio::test]
    async fn test_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = config(&format!("http://{addr}/"), HttpConfig::default());
        let result = HttpProbe.execute(&ProbeContext::new(), &cfg).await;
        assert_eq!(result.status, TestStatus::ConnectionRefused);
    }
}
