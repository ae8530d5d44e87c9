//! Endpoint descriptor
//!
//! Parses the `host:port` strings used for the listening socket and the
//! metrics endpoint. Parsing only splits the string; the port is validated
//! when the endpoint is resolved to open a socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{BrokerError, Result};

/// A `host:port` pair, or nothing
///
/// Both parts absent means "not configured".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<String>,
    pub port: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port.into()),
        }
    }

    /// Parse an endpoint spec
    ///
    /// `None`, empty, or whitespace-only input yields an unconfigured
    /// endpoint. Input without a `:` is rejected. Otherwise the string is
    /// split on the first `:`; everything after it is the port.
    pub fn parse(spec: Option<&str>) -> Result<Self> {
        let Some(spec) = spec.filter(|s| !s.trim().is_empty()) else {
            return Ok(Self::default());
        };

        match spec.split_once(':') {
            Some((host, port)) => Ok(Self::new(host, port)),
            None => Err(BrokerError::invalid_config(format!(
                "invalid endpoint '{spec}': expected host:port"
            ))),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.host.is_some() || self.port.is_some()
    }

    /// Resolve to a socket address
    ///
    /// An empty host means all interfaces.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let (Some(host), Some(port)) = (&self.host, &self.port) else {
            return Err(BrokerError::invalid_config("endpoint not configured"));
        };

        let port: u16 = port
            .parse()
            .map_err(|_| BrokerError::invalid_config(format!("invalid port '{port}'")))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host.as_str() };

        let bind_failure = |source: io::Error| BrokerError::BindFailure {
            addr: format!("{host}:{port}"),
            source,
        };

        tokio::net::lookup_host((host, port))
            .await
            .map_err(bind_failure)?
            .next()
            .ok_or_else(|| {
                bind_failure(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })
    }
}

impl FromStr for Endpoint {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(Some(s))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.port) {
            (None, None) => write!(f, "<unconfigured>"),
            (host, port) => write!(
                f,
                "{}:{}",
                host.as_deref().unwrap_or(""),
                port.as_deref().unwrap_or("")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let endpoint = Endpoint::parse(Some("127.0.0.1:10000")).unwrap();

        assert_eq!(endpoint.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(endpoint.port.as_deref(), Some("10000"));
        assert!(endpoint.is_configured());
    }

    #[test]
    fn test_parse_absent_or_blank() {
        for spec in [None, Some(""), Some("   "), Some("\t\n")] {
            let endpoint = Endpoint::parse(spec).unwrap();
            assert_eq!(endpoint, Endpoint::default());
            assert!(!endpoint.is_configured());
        }
    }

    #[test]
    fn test_parse_missing_separator() {
        let result = Endpoint::parse(Some("badspec"));
        assert!(matches!(result, Err(BrokerError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_parse_splits_on_first_colon_only() {
        let endpoint: Endpoint = "::1:10000".parse().unwrap();

        assert_eq!(endpoint.host.as_deref(), Some(""));
        assert_eq!(endpoint.port.as_deref(), Some(":1:10000"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::new("localhost", "9431").to_string(), "localhost:9431");
        assert_eq!(Endpoint::default().to_string(), "<unconfigured>");
    }

    #[tokio::test]
    async fn test_resolve() {
        let addr = Endpoint::new("127.0.0.1", "10000").resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:10000".parse().unwrap());

        let any = Endpoint::new("", "0").resolve().await.unwrap();
        assert!(any.ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_port_and_unconfigured() {
        let bad_port = Endpoint::new("127.0.0.1", "http").resolve().await;
        assert!(matches!(bad_port, Err(BrokerError::InvalidConfiguration(_))));

        let ipv6_tail = "::1:10000".parse::<Endpoint>().unwrap().resolve().await;
        assert!(matches!(ipv6_tail, Err(BrokerError::InvalidConfiguration(_))));

        let unconfigured = Endpoint::default().resolve().await;
        assert!(matches!(unconfigured, Err(BrokerError::InvalidConfiguration(_))));
    }
}
