//! Static diagnosis -> candidate strategies table

use super::{RiskLevel, StrategyId, StrategyParams};
use crate::diagnosis::DiagnosisId;
use serde_json::json;

/// Candidate before filtering and ranking
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyTemplate {
    /// Technique
    pub id: StrategyId,
    /// Strength
    pub base_priority: u32,
    /// Risk class
    pub risk: RiskLevel,
    /// Parameters passed through to the plan
    pub parameters: StrategyParams,
}

fn template(id: StrategyId, base_priority: u32, risk: RiskLevel) -> StrategyTemplate {
    StrategyTemplate {
        id,
        base_priority,
        risk,
        parameters: StrategyParams::new(),
    }
}

/// Fragment parameters pinned to the standard preset so the result does not
/// depend on whatever the operator configured before
fn standard_fragment(base_priority: u32) -> StrategyTemplate {
    let mut t = template(StrategyId::TlsFragment, base_priority, RiskLevel::Medium);
    t.parameters.insert("PresetName".into(), json!("Standard"));
    t.parameters.insert("TlsFragmentSizes".into(), json!([64]));
    t.parameters.insert("AutoAdjustAggressive".into(), json!(false));
    t
}

/// Ordered candidates for `diagnosis`. Only the id is consulted.
pub fn candidates_for(diagnosis: DiagnosisId) -> Vec<StrategyTemplate> {
    use RiskLevel::{High, Low, Medium};
    use StrategyId::{AggressiveFragment, BadChecksum, DropRst, HttpHostTricks, TlsDisorder, UseDoh};

    match diagnosis {
        DiagnosisId::Unknown => vec![standard_fragment(60)],
        DiagnosisId::DnsHijack => vec![template(UseDoh, 80, Low)],
        DiagnosisId::SilentDrop => vec![standard_fragment(90), template(DropRst, 50, Medium)],
        DiagnosisId::MultiLayerBlock => vec![
            template(UseDoh, 100, Low),
            template(TlsDisorder, 90, Medium),
            template(DropRst, 50, Medium),
        ],
        DiagnosisId::TlsInterference => vec![
            template(TlsDisorder, 90, Medium),
            standard_fragment(80),
            template(DropRst, 30, Medium),
        ],
        DiagnosisId::HttpRedirect => vec![template(HttpHostTricks, 85, Medium)],
        DiagnosisId::ActiveDpiEdge | DiagnosisId::StatefulDpi => vec![
            template(TlsDisorder, 90, Medium),
            standard_fragment(80),
            template(DropRst, 50, Medium),
            template(HttpHostTricks, 10, Medium),
            template(BadChecksum, 1, High),
            template(AggressiveFragment, 20, High),
        ],
        // QUIC fallback is expressed through the DropUdp443 assist flag only
        DiagnosisId::QuicInterference | DiagnosisId::NoBlockage => Vec::new(),
    }
}
