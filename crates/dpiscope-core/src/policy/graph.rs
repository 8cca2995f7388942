//! Indexed policy lookup

use super::{FlowPolicy, FlowProtocol, TlsStage};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Coarse index key; `None` parts are wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphKey {
    /// Protocol
    pub proto: Option<FlowProtocol>,
    /// Port
    pub port: Option<u16>,
    /// TLS stage
    pub tls_stage: Option<TlsStage>,
}

impl GraphKey {
    /// Key from parts
    pub const fn new(proto: Option<FlowProtocol>, port: Option<u16>, tls_stage: Option<TlsStage>) -> Self {
        Self { proto, port, tls_stage }
    }

    /// `self` followed by progressively wider keys, ending at all-wildcard
    fn fallback_chain(self) -> [Self; 8] {
        let Self { proto, port, tls_stage: tls } = self;
        [
            self,
            Self::new(proto, port, None),
            Self::new(proto, None, tls),
            Self::new(None, port, tls),
            Self::new(proto, None, None),
            Self::new(None, port, None),
            Self::new(None, None, tls),
            Self::new(None, None, None),
        ]
    }
}

impl fmt::Display for GraphKey {
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
            Some(s) => write!(f, " tls={s}"),
            None => f.write_str(" tls=*"),
        }
    }
}

/// Compiled, immutable policy snapshot.
///
/// Policies are ordered by priority (descending) then id, and every index
/// bucket keeps that order, so the first match in a bucket is the winner.
#[derive(Debug, Clone, Default)]
pub struct DecisionGraph {
    policies: Vec<FlowPolicy>,
    index: HashMap<GraphKey, Vec<usize>>,
}

impl DecisionGraph {
    pub(super) fn build(mut policies: Vec<FlowPolicy>) -> Self {
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        let mut index: HashMap<GraphKey, Vec<usize>> = HashMap::new();
        for (i, p) in policies.iter().enumerate() {
            let c = &p.condition;
            index.entry(GraphKey::new(c.proto, c.port, c.tls_stage)).or_default().push(i);
        }
        Self { policies, index }
    }

    /// All policies in evaluation order
    pub fn policies(&self) -> &[FlowPolicy] {
        &self.policies
    }

    /// Number of policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// No policies at all
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Number of distinct index keys
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    fn bucket(&self, key: GraphKey) -> Option<impl Iterator<Item = &FlowPolicy>> {
        self.index.get(&key).map(|ids| ids.iter().map(|&i| &self.policies[i]))
    }

    /// Candidates for the most specific key that has any; empty when even
    /// the all-wildcard key has none
    pub fn candidates(
        &self,
        proto: Option<FlowProtocol>,
        port: Option<u16>,
        tls_stage: Option<TlsStage>,
    ) -> Vec<&FlowPolicy> {
        GraphKey::new(proto, port, tls_stage)
            .fallback_chain()
            .into_iter()
            .find_map(|k| self.bucket(k))
            .map(|bucket| bucket.collect())
            .unwrap_or_default()
    }

    /// First UDP/443 policy matching `dst`
    pub fn evaluate_udp443(&self, dst: IpAddr) -> Option<&FlowPolicy> {
        self.candidates(Some(FlowProtocol::Udp), Some(443), None)
            .into_iter()
            .find(|p| p.condition.matches_udp443(dst))
    }

    /// First policy for a TCP/443 packet at `stage` carrying `sni`.
    ///
    /// Unlike [`DecisionGraph::candidates`], every key of the fallback chain
    /// is searched in turn, so a `(Tcp, 443, *)` policy still applies when a
    /// `(Tcp, 443, ClientHello)` bucket exists but none of it matches `dst`.
    pub fn evaluate_tcp443_client_hello(
        &self,
        dst: IpAddr,
        stage: TlsStage,
        sni: Option<&str>,
    ) -> Option<&FlowPolicy> {
        let tcp = Some(FlowProtocol::Tcp);
        let port = Some(443);
        let tls = Some(stage);
        let keys = [
            GraphKey::new(tcp, port, tls),
            GraphKey::new(tcp, port, None),
            GraphKey::new(tcp, None, tls),
            GraphKey::new(tcp, None, None),
            GraphKey::new(None, port, tls),
            GraphKey::new(None, port, None),
            GraphKey::new(None, None, tls),
            GraphKey::new(None, None, None),
        ];
        keys.into_iter()
            .filter_map(|k| self.bucket(k))
            .flatten()
            .find(|p| p.condition.matches_tcp(dst, sni))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{compile, MatchCondition, PolicyAction};
    use std::net::Ipv4Addr;

    fn policy(id: &str, prio: i32, cond: MatchCondition, action: PolicyAction) -> FlowPolicy {
        FlowPolicy::new(id, cond, action).with_priority(prio)
    }

    // ====== Ordering Tests ======

    #[test]
    fn test_sorted_by_priority_then_id() {
        let g = compile(&[
            policy("b", 1, MatchCondition::proto_port(FlowProtocol::Tcp, 80), PolicyAction::Pass),
            policy("a", 1, MatchCondition::proto_port(FlowProtocol::Tcp, 81), PolicyAction::Pass),
            policy("z", 9, MatchCondition::proto_port(FlowProtocol::Tcp, 82), PolicyAction::Pass),
        ])
        .unwrap();
        let ids: Vec<&str> = g.policies().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["z", "a", "b"]);
    }

    // ====== Lookup Tests ======

    #[test]
    fn test_candidates_fall_back_to_wildcard() {
        let g = compile(&[policy("any", 0, MatchCondition::default(), PolicyAction::Pass)]).unwrap();
        let c = g.candidates(Some(FlowProtocol::Udp), Some(443), Some(TlsStage::ClientHello));
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].id, "any");

        let empty = DecisionGraph::default();
        assert!(empty.candidates(Some(FlowProtocol::Udp), Some(443), None).is_empty());
    }

    #[test]
    fn test_candidates_prefer_specific_key() {
        let g = compile(&[
            policy("udp", 0, MatchCondition::proto_port(FlowProtocol::Udp, 443), PolicyAction::drop_udp_443()),
            policy("any", 0, MatchCondition::default().with_sni("x.test"), PolicyAction::Pass),
        ]);
        assert!(g.is_err());

        let g = compile(&[
            policy("udp", 1, MatchCondition::proto_port(FlowProtocol::Udp, 443), PolicyAction::drop_udp_443()),
            policy("any", 0, MatchCondition::default(), PolicyAction::Pass),
        ])
        .unwrap();
        let c = g.candidates(Some(FlowProtocol::Udp), Some(443), None);
        assert_eq!(c.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["udp"]);
    }

    #[test]
    fn test_evaluate_udp443_respects_ip_selection() {
        let target = Ipv4Addr::new(203, 0, 113, 9);
        let g = compile(&[policy(
            "quic",
            5,
            MatchCondition::proto_port(FlowProtocol::Udp, 443).with_ipv4_targets([target]),
            PolicyAction::drop_udp_443(),
        )])
        .unwrap();

        assert_eq!(g.evaluate_udp443(IpAddr::V4(target)).map(|p| p.id.as_str()), Some("quic"));
        assert!(g.evaluate_udp443(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))).is_none());
        assert!(g.evaluate_udp443("2001:db8::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_evaluate_tcp443_walks_all_keys() {
        let target = Ipv4Addr::new(203, 0, 113, 9);
        let g = compile(&[
            policy(
                "hello-selective",
                5,
                MatchCondition::proto_port(FlowProtocol::Tcp, 443)
                    .with_tls_stage(TlsStage::ClientHello)
                    .with_ipv4_targets([target]),
                PolicyAction::strategy("fragment"),
            ),
            policy(
                "tcp443",
                1,
                MatchCondition::proto_port(FlowProtocol::Tcp, 443),
                PolicyAction::strategy("disorder"),
            ),
        ])
        .unwrap();

        let hit = g.evaluate_tcp443_client_hello(IpAddr::V4(target), TlsStage::ClientHello, None);
        assert_eq!(hit.map(|p| p.id.as_str()), Some("hello-selective"));
        let other = g.evaluate_tcp443_client_hello(IpAddr::V4(Ipv4Addr::LOCALHOST), TlsStage::ClientHello, None);
        assert_eq!(other.map(|p| p.id.as_str()), Some("tcp443"));
    }

    #[test]
    fn test_evaluate_tcp443_checks_sni() {
        let g = compile(&[
            policy(
                "video",
                5,
                MatchCondition::proto_port(FlowProtocol::Tcp, 443).with_sni("*.video.example"),
                PolicyAction::strategy("fragment"),
            ),
            policy(
                "tcp443",
                1,
                MatchCondition::proto_port(FlowProtocol::Tcp, 443),
                PolicyAction::strategy("disorder"),
            ),
        ])
        .unwrap();
        let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

        let hit = g.evaluate_tcp443_client_hello(dst, TlsStage::ClientHello, Some("cdn.video.example"));
        assert_eq!(hit.map(|p| p.id.as_str()), Some("video"));
        let miss = g.evaluate_tcp443_client_hello(dst, TlsStage::ClientHello, Some("news.example"));
        assert_eq!(miss.map(|p| p.id.as_str()), Some("tcp443"));
        let nameless = g.evaluate_tcp443_client_hello(dst, TlsStage::NoSni, None);
        assert_eq!(nameless.map(|p| p.id.as_str()), Some("tcp443"));
    }

    #[test]
    fn test_key_display() {
        let k = GraphKey::new(Some(FlowProtocol::Tcp), None, Some(TlsStage::NoSni));
        assert_eq!(k.to_string(), "TCP:* tls=NoSni");
    }
}
