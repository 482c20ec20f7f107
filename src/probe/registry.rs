//! Protocol → probe lookup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::{
    DetailedTestResult, HttpProbe, IcmpProbe, PhaseLog, Probe, ProbeContext, ProbeError, Protocol, TcpProbe,
    TestConfig, TestResult, TestStatus, UdpProbe,
};

/// Maps each protocol to the probe that speaks it.
///
/// Probes are stateless and shared, so one registry serves the scheduler and
/// the manual controller alike.
#[derive(Clone)]
pub struct ProbeRegistry {
    probes: HashMap<Protocol, Arc<dyn Probe>>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProbeRegistry {
    /// An empty registry. Every lookup fails until probes are registered.
    pub fn new() -> Self {
        Self { probes: HashMap::new() }
    }

    /// Registry with the built-in ICMP, TCP, UDP and HTTP probes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IcmpProbe));
        registry.register(Arc::new(TcpProbe));
        registry.register(Arc::new(UdpProbe));
        registry.register(Arc::new(HttpProbe));
        registry
    }

    /// Install `probe` for its protocol, replacing any previous one.
    pub fn register(&mut self, probe: Arc<dyn Probe>) -> &mut Self {
        self.probes.insert(probe.protocol(), probe);
        self
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Probe>> {
        self.probes.get(&protocol).cloned()
    }

    pub fn resolve(&self, protocol: Protocol) -> Result<Arc<dyn Probe>, ProbeError> {
        self.get(protocol).ok_or(ProbeError::Unsupported(protocol))
    }

    /// Validate `config` against its probe without touching the network.
    pub fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        self.resolve(config.protocol())?.validate(config)
    }

    pub async fn execute(&self, ctx: &ProbeContext, config: &TestConfig) -> TestResult {
        match self.resolve(config.protocol()) {
            Ok(probe) => probe.execute(ctx, config).await,
            Err(e) => unsupported(config, e),
        }
    }

    pub async fn execute_detailed(&self, ctx: &ProbeContext, config: &TestConfig) -> DetailedTestResult {
        match self.resolve(config.protocol()) {
            Ok(probe) => probe.execute_detailed(ctx, config).await,
            Err(e) => DetailedTestResult {
                result: unsupported(config, e),
                phases: PhaseLog::new(),
                execution_time: std::time::Duration::ZERO,
            },
        }
    }
}

fn unsupported(config: &TestConfig, err: ProbeError) -> TestResult {
    TestResult::new(config, Utc::now(), TestStatus::InvalidConfig).with_message(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProtocolConfig, UdpConfig};
    use std::time::Duration;

    #[test]
    fn test_defaults_cover_every_protocol() {
        let registry = ProbeRegistry::with_defaults();
        for protocol in Protocol::ALL {
            let probe = registry.get(protocol).unwrap();
            assert_eq!(probe.protocol(), protocol);
            assert_eq!(probe.protocol_name(), protocol.as_str());
        }
    }

    #[tokio::test]
    async fn test_missing_probe_yields_invalid_config() {
        let registry = ProbeRegistry::new();
        let config = TestConfig::new(
            "udp",
            "127.0.0.1:9",
            Duration::from_secs(1),
            ProtocolConfig::Udp(UdpConfig::default()),
        );
        assert_eq!(registry.validate(&config), Err(ProbeError::Unsupported(Protocol::Udp)));

        let result = registry.execute(&ProbeContext::new(), &config).await;
        assert_eq!(result.status, TestStatus::InvalidConfig);
        assert!(result.message.unwrap().contains("UDP"));
    }
}
