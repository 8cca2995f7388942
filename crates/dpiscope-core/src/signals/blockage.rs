//! Closed set of blockage and DNS status codes.
//!
//! Host-test results arrive with textual codes. They are parsed once here,
//! legacy spellings included, and only the enum travels downstream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport/application-layer blockage reported by a host test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockageCode {
    /// TCP connect timed out
    #[serde(rename = "TCP_CONNECT_TIMEOUT", alias = "TCP_TIMEOUT")]
    TcpConnectTimeout,
    /// TCP connect timed out on repeated attempts
    #[serde(rename = "TCP_CONNECT_TIMEOUT_CONFIRMED", alias = "TCP_TIMEOUT_CONFIRMED")]
    TcpConnectTimeoutConfirmed,
    /// Connection reset during connect or handshake
    #[serde(rename = "TCP_CONNECTION_RESET", alias = "TCP_RST")]
    TcpConnectionReset,
    /// TLS handshake timed out
    #[serde(rename = "TLS_HANDSHAKE_TIMEOUT", alias = "TLS_TIMEOUT")]
    TlsHandshakeTimeout,
    /// TLS handshake failed authentication (often a substituted certificate)
    #[serde(rename = "TLS_AUTH_FAILURE", alias = "TLS_DPI")]
    TlsAuthFailure,
    /// RST injection confirmed by wire inspection
    #[serde(rename = "TCP_RST_INJECTION")]
    TcpRstInjection,
    /// Heavy retransmission on the connection
    #[serde(rename = "TCP_RETRY_HEAVY")]
    TcpRetryHeavy,
    /// HTTP redirect substituted by middlebox
    #[serde(rename = "HTTP_REDIRECT_DPI")]
    HttpRedirectDpi,
    /// HTTP request timed out
    #[serde(rename = "HTTP_TIMEOUT")]
    HttpTimeout,
    /// UDP traffic blocked
    #[serde(rename = "UDP_BLOCKAGE")]
    UdpBlockage,
    /// Port actively closed
    #[serde(rename = "PORT_CLOSED")]
    PortClosed,
    /// Resolved to a service-range fake address
    #[serde(rename = "FAKE_IP")]
    FakeIp,
    /// Other TCP failure
    #[serde(rename = "TCP_ERROR")]
    TcpError,
    /// Other TLS failure
    #[serde(rename = "TLS_ERROR")]
    TlsError,
}

impl BlockageCode {
    /// Every canonical code
    pub const ALL: [Self; 14] = [
        Self::TcpConnectTimeout,
        Self::TcpConnectTimeoutConfirmed,
        Self::TcpConnectionReset,
        Self::TlsHandshakeTimeout,
        Self::TlsAuthFailure,
        Self::TcpRstInjection,
        Self::TcpRetryHeavy,
        Self::HttpRedirectDpi,
        Self::HttpTimeout,
        Self::UdpBlockage,
        Self::PortClosed,
        Self::FakeIp,
        Self::TcpError,
        Self::TlsError,
    ];

    /// Canonical token
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TcpConnectTimeout => "TCP_CONNECT_TIMEOUT",
            Self::TcpConnectTimeoutConfirmed => "TCP_CONNECT_TIMEOUT_CONFIRMED",
            Self::TcpConnectionReset => "TCP_CONNECTION_RESET",
            Self::TlsHandshakeTimeout => "TLS_HANDSHAKE_TIMEOUT",
            Self::TlsAuthFailure => "TLS_AUTH_FAILURE",
            Self::TcpRstInjection => "TCP_RST_INJECTION",
            Self::TcpRetryHeavy => "TCP_RETRY_HEAVY",
            Self::HttpRedirectDpi => "HTTP_REDIRECT_DPI",
            Self::HttpTimeout => "HTTP_TIMEOUT",
            Self::UdpBlockage => "UDP_BLOCKAGE",
            Self::PortClosed => "PORT_CLOSED",
            Self::FakeIp => "FAKE_IP",
            Self::TcpError => "TCP_ERROR",
            Self::TlsError => "TLS_ERROR",
        }
    }

    /// Connect-level timeout of either flavor
    pub fn is_tcp_timeout(self) -> bool {
        matches!(self, Self::TcpConnectTimeout | Self::TcpConnectTimeoutConfirmed)
    }

    /// Reset of either flavor
    pub fn is_tcp_reset(self) -> bool {
        matches!(self, Self::TcpConnectionReset | Self::TcpRstInjection)
    }
}

impl fmt::Display for BlockageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown blockage token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown blockage code '{0}'")]
pub struct UnknownCode(pub String);

impl FromStr for BlockageCode {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase();
        let legacy = match token.as_str() {
            "TCP_TIMEOUT" => Some(Self::TcpConnectTimeout),
            "TCP_TIMEOUT_CONFIRMED" => Some(Self::TcpConnectTimeoutConfirmed),
            "TCP_RST" => Some(Self::TcpConnectionReset),
            "TLS_TIMEOUT" => Some(Self::TlsHandshakeTimeout),
            "TLS_DPI" => Some(Self::TlsAuthFailure),
            _ => None,
        };
        legacy
            .or_else(|| Self::ALL.into_iter().find(|c| c.as_str() == token))
            .ok_or(UnknownCode(s.to_string()))
    }
}

/// DNS resolution outcome reported by a host test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DnsStatus {
    /// Resolved normally
    #[default]
    Ok,
    /// Resolver refused or returned nothing
    DnsFiltered,
    /// Resolver returned a bogus / sinkhole answer
    DnsBogus,
    /// Resolution error
    DnsError,
    /// Resolved only via an alternative resolver
    DnsBypass,
}

impl DnsStatus {
    /// Any status other than a clean resolve
    pub fn is_failure(self) -> bool {
        matches!(self, Self::DnsFiltered | Self::DnsBogus | Self::DnsError)
    }
}

impl FromStr for DnsStatus {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" | "" => Ok(Self::Ok),
            "DNS_FILTERED" => Ok(Self::DnsFiltered),
            "DNS_BOGUS" => Ok(Self::DnsBogus),
            "DNS_ERROR" => Ok(Self::DnsError),
            "DNS_BYPASS" => Ok(Self::DnsBypass),
            _ => Err(UnknownCode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_aliases_parse_to_canonical() {
        assert_eq!("TCP_TIMEOUT".parse::<BlockageCode>(), Ok(BlockageCode::TcpConnectTimeout));
        assert_eq!("tcp_rst".parse::<BlockageCode>(), Ok(BlockageCode::TcpConnectionReset));
        assert_eq!("TLS_DPI".parse::<BlockageCode>(), Ok(BlockageCode::TlsAuthFailure));
        assert_eq!("TLS_TIMEOUT".parse::<BlockageCode>(), Ok(BlockageCode::TlsHandshakeTimeout));
        assert_eq!(
            "TCP_TIMEOUT_CONFIRMED".parse::<BlockageCode>(),
            Ok(BlockageCode::TcpConnectTimeoutConfirmed)
        );
    }

    #[test]
    fn test_canonical_tokens_parse() {
        for code in BlockageCode::ALL {
            assert_eq!(code.as_str().parse::<BlockageCode>(), Ok(code));
        }
        assert!("SOMETHING_ELSE".parse::<BlockageCode>().is_err());
    }

    #[test]
    fn test_serde_accepts_alias_and_writes_canonical() {
        let code: BlockageCode = serde_json::from_str("\"TCP_RST\"").unwrap();
        assert_eq!(code, BlockageCode::TcpConnectionReset);
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"TCP_CONNECTION_RESET\"");
    }

    #[test]
    fn test_dns_status() {
        assert_eq!("dns_bogus".parse::<DnsStatus>(), Ok(DnsStatus::DnsBogus));
        assert!(DnsStatus::DnsFiltered.is_failure());
        assert!(!DnsStatus::DnsBypass.is_failure());
    }
}
