//! Flow match predicates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        })
    }
}

/// Position in the TLS conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsStage {
    /// First client flight
    ClientHello,
    /// Rest of the handshake
    Handshake,
    /// Encrypted records
    ApplicationData,
    /// ClientHello without a server name
    NoSni,
}

impl fmt::Display for TlsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientHello => "ClientHello",
            Self::Handshake => "Handshake",
            Self::ApplicationData => "ApplicationData",
            Self::NoSni => "NoSni",
        })
    }
}

/// What a policy applies to. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCondition {
    /// Destination addresses as authored; empty means any
    pub dst_ip_set: Option<BTreeSet<String>>,
    /// Resolved IPv4 destinations used at packet time.
    /// `None` matches any address; an empty set matches nothing.
    #[serde(skip)]
    pub dst_ipv4_set: Option<HashSet<Ipv4Addr>>,
    /// Transport protocol
    pub proto: Option<FlowProtocol>,
    /// Destination port
    pub port: Option<u16>,
    /// TLS stage
    pub tls_stage: Option<TlsStage>,
    /// Exact host or `*.suffix`
    pub sni_pattern: Option<String>,
}

impl MatchCondition {
    /// Condition on protocol and port only
    pub fn proto_port(proto: FlowProtocol, port: u16) -> Self {
        Self {
            proto: Some(proto),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Restrict to the given IPv4 destinations at packet time
    #[must_use]
    pub fn with_ipv4_targets(mut self, targets: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.dst_ipv4_set = Some(targets.into_iter().collect());
        self
    }

    /// Restrict to an SNI pattern
    #[must_use]
    pub fn with_sni(mut self, pattern: impl Into<String>) -> Self {
        self.sni_pattern = Some(pattern.into());
        self
    }

    /// Restrict to a TLS stage
    #[must_use]
    pub fn with_tls_stage(mut self, stage: TlsStage) -> Self {
        self.tls_stage = Some(stage);
        self
    }

    /// Whether some flow could satisfy both conditions
    pub fn overlaps(&self, other: &Self) -> bool {
        fn disjoint<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x != y)
        }
        if disjoint(self.proto, other.proto)
            || disjoint(self.port, other.port)
            || disjoint(self.tls_stage, other.tls_stage)
        {
            return false;
        }
        ip_set_overlaps(self.dst_ip_set.as_ref(), other.dst_ip_set.as_ref())
            && ipv4_set_overlaps(self.dst_ipv4_set.as_ref(), other.dst_ipv4_set.as_ref())
            && sni_overlaps(self.sni_pattern.as_deref(), other.sni_pattern.as_deref())
    }

    /// Parse `dst_ip_set` into the packet-time IPv4 set.
    ///
    /// An absent or empty authored set leaves the condition matching any
    /// address. Entries that are not IPv4 literals are rejected.
    pub fn resolve_targets(&mut self) -> Result<(), String> {
        let Some(authored) = self.dst_ip_set.as_ref().filter(|set| !set.is_empty()) else {
            return Ok(());
        };
        let mut resolved = HashSet::with_capacity(authored.len());
        for entry in authored {
            let ip = entry
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| format!("'{entry}' is not an IPv4 address"))?;
            resolved.insert(ip);
        }
        self.dst_ipv4_set = Some(resolved);
        Ok(())
    }

    /// Whether the authored set still has to go through [`Self::resolve_targets`]
    pub fn needs_resolution(&self) -> bool {
        self.dst_ipv4_set.is_none() && self.dst_ip_set.as_ref().is_some_and(|set| !set.is_empty())
    }

    /// Destination check for a packet already known to be UDP/443.
    ///
    /// IPv6 destinations only match when no IPv4 selection is set. QUIC hides
    /// the server name, so a condition with an SNI pattern never matches here.
    pub fn matches_udp443(&self, dst: IpAddr) -> bool {
        self.matches_destination(dst) && self.matches_sni(None)
    }

    /// Destination and server-name check for a TCP packet whose protocol
    /// and port were already resolved through the graph index
    pub fn matches_tcp(&self, dst: IpAddr, sni: Option<&str>) -> bool {
        self.matches_destination(dst) && self.matches_sni(sni)
    }

    /// A wildcard pattern matches anything, including a missing name
    pub fn matches_sni(&self, sni: Option<&str>) -> bool {
        let pattern = match self.sni_pattern.as_deref().map(str::trim) {
            None | Some("") | Some("*") => return true,
            Some(p) => p,
        };
        let Some(sni) = sni.map(|s| s.trim().trim_end_matches('.')) else {
            return false;
        };
        if is_wildcard(pattern) {
            wildcard_matches(pattern, sni)
        } else {
            pattern.eq_ignore_ascii_case(sni)
        }
    }

    fn matches_destination(&self, dst: IpAddr) -> bool {
        match (dst, &self.dst_ipv4_set) {
            (_, None) => true,
            (IpAddr::V6(_), Some(_)) => false,
            (IpAddr::V4(v4), Some(set)) => set.contains(&v4),
        }
    }
}

impl fmt::Display for MatchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            Some(p) => write!(f, "{p}:")?,
            None => f.write_str("ANY:")?,
        }
        match self.port {
            Some(p) => write!(f, "{p}")?,
            None => f.write_str("*")?,
        }
        match self.tls_stage {
            Some(s) => write!(f, " tls={s}")?,
            None => f.write_str(" tls=*")?,
        }
        match self.sni_pattern.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => write!(f, " sni={s}")?,
            _ => f.write_str(" sni=*")?,
        }
        match &self.dst_ip_set {
            Some(set) if !set.is_empty() => write!(f, " ipset[{}]", set.len()),
            _ => f.write_str(" ipset[*]"),
        }
    }
}

fn ip_set_overlaps(a: Option<&BTreeSet<String>>, b: Option<&BTreeSet<String>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => a.iter().any(|ip| b.contains(ip)),
        _ => true,
    }
}

fn ipv4_set_overlaps(a: Option<&HashSet<Ipv4Addr>>, b: Option<&HashSet<Ipv4Addr>>) -> bool {
    match (a, b) {
        (Some(a), _) if a.is_empty() => false,
        (_, Some(b)) if b.is_empty() => false,
        (Some(a), Some(b)) => a.iter().any(|ip| b.contains(ip)),
        _ => true,
    }
}

fn is_wildcard(s: &str) -> bool {
    s.contains('*')
}

fn sni_overlaps(a: Option<&str>, b: Option<&str>) -> bool {
    let any = |s: Option<&str>| s.map_or(true, |s| s.trim().is_empty() || s == "*");
    if any(a) || any(b) {
        return true;
    }
    let (a, b) = (a.unwrap_or_default(), b.unwrap_or_default());
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    match (is_wildcard(a), is_wildcard(b)) {
        (true, false) => wildcard_matches(a, b),
        (false, true) => wildcard_matches(b, a),
        // Two different masks may still share hosts
        (true, true) => true,
        (false, false) => false,
    }
}

/// Only `*` and `*.suffix` are understood
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') && suffix.len() > 1 => {
            let (value, suffix) = (value.as_bytes(), suffix.as_bytes());
            value.len() >= suffix.len() && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        }
        _ => false,
    }
}
