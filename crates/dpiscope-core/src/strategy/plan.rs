//! Plan identity and dominance

use super::{BypassPlan, StrategyId};
use std::collections::BTreeSet;

/// Canonical `A,B|U1|N0` form: strategy ids sorted by name, then the
/// DropUdp443 and AllowNoSni flags
pub fn plan_signature(plan: &BypassPlan) -> String {
    let ids: BTreeSet<&str> = plan
        .strategies
        .iter()
        .filter(|s| s.id != StrategyId::None)
        .map(|s| s.id.as_str())
        .collect();
    format!(
        "{}|U{}|N{}",
        ids.into_iter().collect::<Vec<_>>().join(","),
        u8::from(plan.drop_udp_443),
        u8::from(plan.allow_no_sni)
    )
}

/// Decides whether a new plan adds anything over the active one
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanSelector;

impl PlanSelector {
    /// Every action of `new` is already part of `active`. Empty action sets
    /// never dominate or get dominated.
    pub fn is_dominated(new: &BypassPlan, active: &BypassPlan) -> bool {
        is_subset(&actions_of_plan(new), &actions_of_plan(active))
    }

    /// Same check over signatures
    pub fn is_dominated_signature(new: &str, active: &str) -> bool {
        is_subset(&actions_of_signature(new), &actions_of_signature(active))
    }
}

fn actions_of_plan(plan: &BypassPlan) -> BTreeSet<String> {
    let mut set: BTreeSet<String> = plan
        .strategies
        .iter()
        .filter(|s| s.id != StrategyId::None)
        .map(|s| format!("s:{}", s.id.as_str().to_ascii_lowercase()))
        .collect();
    if plan.drop_udp_443 {
        set.insert("f:dropudp443".to_string());
    }
    if plan.allow_no_sni {
        set.insert("f:allownosni".to_string());
    }
    set
}

fn actions_of_signature(signature: &str) -> BTreeSet<String> {
    let mut parts = signature.trim().split('|').map(str::trim);
    let mut set: BTreeSet<String> = parts
        .next()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("s:{}", s.to_ascii_lowercase()))
        .collect();
    for flag in parts {
        if flag.len() < 2 || !flag.ends_with('1') {
            continue;
        }
        match flag.as_bytes()[0].to_ascii_uppercase() {
            b'U' => {
                set.insert("f:dropudp443".to_string());
            }
            b'N' => {
                set.insert("f:allownosni".to_string());
            }
            _ => {}
        }
    }
    set
}

fn is_subset(candidate: &BTreeSet<String>, active: &BTreeSet<String>) -> bool {
    !candidate.is_empty() && !active.is_empty() && candidate.is_subset(active)
}
