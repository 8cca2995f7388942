//! Result of a one-shot host reachability test, as consumed by the adapter

use super::blockage::{BlockageCode, DnsStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Outcome of the optional HTTP/3 probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Http3Status {
    /// Probe not run
    #[default]
    NotAttempted,
    /// HTTP/3 request succeeded
    Ok,
    /// HTTP/3 request failed
    Failed,
    /// HTTP/3 request timed out
    Timeout,
    /// Server does not offer HTTP/3
    NotSupported,
}

impl Http3Status {
    /// The probe ran
    pub fn attempted(self) -> bool {
        self != Self::NotAttempted
    }

    /// The probe ran and did not succeed, for a reason other than lack of support
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

/// Transport of the tested endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestTransport {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
}

/// One host-test record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTested {
    /// Tested host name
    #[serde(default)]
    pub hostname: Option<String>,
    /// Address actually connected to
    #[serde(default)]
    pub remote_ip: Option<IpAddr>,
    /// Tested port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tested transport
    #[serde(default)]
    pub transport: TestTransport,
    /// SNI sent in the TLS probe, `None` when none was sent
    #[serde(default)]
    pub sni: Option<String>,
    /// DNS resolved
    pub dns_ok: bool,
    /// TCP connected
    pub tcp_ok: bool,
    /// TLS handshake completed
    pub tls_ok: bool,
    /// DNS status detail
    #[serde(default)]
    pub dns_status: DnsStatus,
    /// Classified blockage, if any
    #[serde(default)]
    pub blockage: Option<BlockageCode>,
    /// TCP connect (or reset) latency
    #[serde(default)]
    pub tcp_latency_ms: Option<u64>,
    /// HTTP/3 probe outcome
    #[serde(default)]
    pub http3: Http3Status,
    /// HTTP status code from the plaintext probe
    #[serde(default)]
    pub http_status: Option<u16>,
    /// When the test ran
    pub tested_at: DateTime<Utc>,
}

fn default_port() -> u16 {
    443
}

impl HostTested {
    /// Empty record for `hostname` at `tested_at`, everything succeeding
    pub fn ok(hostname: &str, remote_ip: Option<IpAddr>, tested_at: DateTime<Utc>) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            remote_ip,
            port: 443,
            transport: TestTransport::Tcp,
            sni: Some(hostname.to_string()),
            dns_ok: true,
            tcp_ok: true,
            tls_ok: true,
            dns_status: DnsStatus::Ok,
            blockage: None,
            tcp_latency_ms: None,
            http3: Http3Status::NotAttempted,
            http_status: None,
            tested_at,
        }
    }

    /// Stable identity of the tested target: the remote IP, else
    /// `host:port:proto`, else `<unknown>`
    pub fn host_key(&self) -> String {
        if let Some(ip) = self.remote_ip {
            return ip.to_string();
        }
        match self.hostname.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) => {
                let proto = match self.transport {
                    TestTransport::Tcp => "tcp",
                    TestTransport::Udp => "udp",
                };
                format!("{}:{}:{}", host.to_ascii_lowercase(), self.port, proto)
            }
            None => "<unknown>".to_string(),
        }
    }

    /// No SNI was sent
    pub fn is_no_sni(&self) -> bool {
        self.sni.as_deref().map_or(true, |s| s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_prefers_ip() {
        let t = HostTested::ok("example.com", Some("93.184.216.34".parse().unwrap()), Utc::now());
        assert_eq!(t.host_key(), "93.184.216.34");
    }

    #[test]
    fn test_host_key_composite_fallback() {
        let mut t = HostTested::ok("Example.com", None, Utc::now());
        assert_eq!(t.host_key(), "example.com:443:tcp");
        t.hostname = None;
        assert_eq!(t.host_key(), "<unknown>");
    }

    #[test]
    fn test_deserialize_with_legacy_blockage() {
        let json = r#"{
            "hostname": "blocked.example",
            "remoteIp": "198.18.0.5",
            "dnsOk": true,
            "tcpOk": false,
            "tlsOk": false,
            "blockage": "TCP_TIMEOUT",
            "testedAt": "2026-01-01T00:00:00Z"
        }"#;
        let t: HostTested = serde_json::from_str(json).unwrap();
        assert_eq!(t.blockage, Some(BlockageCode::TcpConnectTimeout));
        assert_eq!(t.port, 443);
        assert!(t.is_no_sni());
    }
}
