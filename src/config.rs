//! Server configuration.
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! server:
//!   ip: 127.0.0.1
//!   port: 5353
//!   query_timeout: 800
//!   init_timeout: 3000
//!   subnets_path: subnets.txt
//!   proxies:
//!     - { ip: 114.114.114.114, port: 53, tcp: false, internal: true }
//!     - { ip: 8.8.8.8, port: 53, tcp: true, internal: false }
//! domains:
//!   blocked: [www.google.com]
//!   non_blocked: [www.baidu.com]
//! ```

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::proxy::{Proxy, Transport, Trust};

fn default_init_timeout() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerSettings,
    pub domains: ProbeDomains,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub ip: IpAddr,
    pub port: u16,
    /// Per-query deadline in milliseconds.
    pub query_timeout: u64,
    /// Calibration window in milliseconds.
    #[serde(default = "default_init_timeout")]
    pub init_timeout: u64,
    pub subnets_path: PathBuf,
    pub proxies: Vec<ProxySettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub tcp: bool,
    #[serde(default)]
    pub internal: bool,
}

/// Domains used to probe proxies during calibration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeDomains {
    pub blocked: Vec<String>,
    pub non_blocked: Vec<String>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;

        info!(
            "configuration loaded from {}: {} proxies, {} blocked and {} non-blocked probe domains",
            path.display(),
            config.server.proxies.len(),
            config.domains.blocked.len(),
            config.domains.non_blocked.len()
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.proxies.is_empty() {
            return Err(Error::Config("there is no proxy to use".into()));
        }
        if self.domains.blocked.is_empty() {
            return Err(Error::Config("no blocked probe domain configured".into()));
        }
        if self.domains.non_blocked.is_empty() {
            return Err(Error::Config("no non-blocked probe domain configured".into()));
        }
        if self.server.query_timeout == 0 {
            return Err(Error::Config("server.query_timeout must be positive".into()));
        }
        if self.server.init_timeout == 0 {
            return Err(Error::Config("server.init_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.ip, self.server.port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.server.query_timeout)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.server.init_timeout)
    }

    /// Proxies with default, not yet calibrated, latency profiles.
    pub fn proxies(&self) -> Vec<Proxy> {
        self.server.proxies.iter().map(ProxySettings::to_proxy).collect()
    }
}

impl ProxySettings {
    pub fn to_proxy(&self) -> Proxy {
        let transport = if self.tcp { Transport::Tcp } else { Transport::Udp };
        let trust = if self.internal { Trust::Internal } else { Trust::External };

        Proxy::new(SocketAddr::new(self.ip, self.port), transport, trust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Calibration;

    const SAMPLE: &str = r#"
server:
  ip: 127.0.0.1
  port: 5353
  query_timeout: 800
  subnets_path: subnets.txt
  proxies:
    - { ip: 114.114.114.114, port: 53, tcp: false, internal: true }
    - { ip: 8.8.8.8, port: 53, tcp: true }
domains:
  blocked: [www.google.com, twitter.com]
  non_blocked: [www.baidu.com]
"#;

    #[test]
    fn parses_sample() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.bind_addr(), "127.0.0.1:5353".parse().unwrap());
        assert_eq!(config.query_timeout(), Duration::from_millis(800));
        assert_eq!(config.init_timeout(), Duration::from_millis(3000));
        assert_eq!(config.server.subnets_path, PathBuf::from("subnets.txt"));
        assert_eq!(config.domains.blocked, vec!["www.google.com", "twitter.com"]);
    }

    #[test]
    fn proxies_start_with_default_calibration() {
        let proxies = Config::parse(SAMPLE).unwrap().proxies();

        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].transport, Transport::Udp);
        assert_eq!(proxies[0].trust, Trust::Internal);
        assert_eq!(proxies[1].addr, "8.8.8.8:53".parse().unwrap());
        assert_eq!(proxies[1].transport, Transport::Tcp);
        assert_eq!(proxies[1].trust, Trust::External);
        assert_eq!(proxies[1].calibration, Calibration::default());
    }

    #[test]
    fn rejects_missing_proxies() {
        let yaml = SAMPLE.replace(
            "  proxies:\n    - { ip: 114.114.114.114, port: 53, tcp: false, internal: true }\n    - { ip: 8.8.8.8, port: 53, tcp: true }\n",
            "  proxies: []\n",
        );

        assert!(matches!(Config::parse(&yaml), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_probe_domains() {
        let yaml = SAMPLE.replace("non_blocked: [www.baidu.com]", "non_blocked: []");

        assert!(matches!(Config::parse(&yaml), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let yaml = SAMPLE.replace("query_timeout: 800", "query_timeout: 0");

        assert!(matches!(Config::parse(&yaml), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(Config::parse("server: ["), Err(Error::Yaml(_))));
    }

    #[test]
    fn rejects_invalid_proxy_address() {
        let yaml = SAMPLE.replace("8.8.8.8", "not-an-ip");

        assert!(matches!(Config::parse(&yaml), Err(Error::Yaml(_))));
    }
}
