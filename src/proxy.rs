//! Upstream proxies and their calibrated latency profile.

use std::fmt;
use std::net::SocketAddr;

/// Expected latency of a genuine answer before calibration.
pub const DEFAULT_LEGIT_LATENCY_MS: u64 = 90;
/// Expected latency of a forged answer before calibration.
pub const DEFAULT_FAKE_LATENCY_MS: u64 = 30;

/// Transport used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        }
    }
}

/// Trust class of an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Inside a controlled network, trusted for internal-range answers.
    Internal,
    External,
}

/// Latency profile learned during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub enabled: bool,
    pub expected_legit_ms: u64,
    pub expected_fake_ms: u64,
}

impl Calibration {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            enabled: true,
            expected_legit_ms: DEFAULT_LEGIT_LATENCY_MS,
            expected_fake_ms: DEFAULT_FAKE_LATENCY_MS,
        }
    }
}

/// An upstream DNS server.
///
/// Identity is fixed at load time. Calibration is replaced wholesale by
/// [`Proxy::calibrated`] before any session reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub addr: SocketAddr,
    pub transport: Transport,
    pub trust: Trust,
    pub calibration: Calibration,
}

impl Proxy {
    pub fn new(addr: SocketAddr, transport: Transport, trust: Trust) -> Self {
        Self {
            addr,
            transport,
            trust,
            calibration: Calibration::default(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.trust == Trust::Internal
    }

    pub fn is_enabled(&self) -> bool {
        self.calibration.enabled
    }

    /// A copy of this proxy carrying `calibration`.
    pub fn calibrated(&self, calibration: Calibration) -> Self {
        Self {
            calibration,
            ..self.clone()
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trust = match self.trust {
            Trust::Internal => "internal",
            Trust::External => "external",
        };
        write!(f, "{}/{} ({})", self.addr, self.transport.as_str(), trust)
    }
}
