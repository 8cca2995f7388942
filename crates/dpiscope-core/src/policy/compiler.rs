//! Hard-conflict detection and compilation

use super::graph::DecisionGraph;
use super::FlowPolicy;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Conflict lines shown in the error message
const PREVIEW_LIMIT: usize = 5;

/// Two policies that make the outcome for some flow ambiguous
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConflict {
    /// First policy id
    pub policy_a: String,
    /// Second policy id
    pub policy_b: String,
    /// Human-readable explanation
    pub reason: String,
}

impl fmt::Display for PolicyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}: {}", self.policy_a, self.policy_b, self.reason)
    }
}

/// Compilation refused because of hard conflicts or unusable conditions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render(.conflicts, .invalid))]
pub struct PolicyCompilationError {
    /// Every conflicting pair, in detection order
    pub conflicts: Vec<PolicyConflict>,
    /// `policy-id: reason` for each condition that could not be resolved
    pub invalid: Vec<String>,
}

fn render(conflicts: &[PolicyConflict], invalid: &[String]) -> String {
    if !invalid.is_empty() {
        let mut lines = vec![format!("Policy compilation failed: invalid-conditions={}", invalid.len())];
        lines.extend(invalid.iter().take(PREVIEW_LIMIT).map(|c| format!("- {c}")));
        return lines.join("\n");
    }
    if conflicts.is_empty() {
        return "Policy compilation failed".to_string();
    }
    let mut lines = vec![format!("Policy compilation failed: hard-conflicts={}", conflicts.len())];
    lines.extend(conflicts.iter().take(PREVIEW_LIMIT).map(|c| format!("- {c}")));
    if conflicts.len() > PREVIEW_LIMIT {
        lines.push("- ...".to_string());
    }
    lines.join("\n")
}

/// Every pair with equal priority, overlapping match and non-equivalent
/// actions. Pairs with different priorities never conflict.
pub fn detect_hard_conflicts(policies: &[FlowPolicy]) -> Vec<PolicyConflict> {
    let mut conflicts = Vec::new();
    for (i, a) in policies.iter().enumerate() {
        for b in &policies[i + 1..] {
            if a.priority != b.priority
                || a.action.is_equivalent(&b.action)
                || !a.condition.overlaps(&b.condition)
            {
                continue;
            }
            conflicts.push(PolicyConflict {
                policy_a: a.id.clone(),
                policy_b: b.id.clone(),
                reason: format!(
                    "overlapping match at equal priority {}: {} VS {} (actions: {} vs {})",
                    a.priority, a.condition, b.condition, a.action, b.action
                ),
            });
        }
    }
    conflicts
}

/// Resolve authored destinations, validate and index a policy set
pub fn compile(policies: &[FlowPolicy]) -> Result<DecisionGraph, PolicyCompilationError> {
    let mut resolved = policies.to_vec();
    let invalid: Vec<String> = resolved
        .iter_mut()
        .filter(|p| p.condition.needs_resolution())
        .filter_map(|p| p.condition.resolve_targets().err().map(|e| format!("{}: {e}", p.id)))
        .collect();
    if !invalid.is_empty() {
        return Err(PolicyCompilationError {
            conflicts: Vec::new(),
            invalid,
        });
    }

    let conflicts = detect_hard_conflicts(&resolved);
    if !conflicts.is_empty() {
        return Err(PolicyCompilationError {
            conflicts,
            invalid: Vec::new(),
        });
    }
    let graph = DecisionGraph::build(resolved);
    debug!(policies = graph.len(), keys = graph.key_count(), "policy set compiled");
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FlowProtocol, MatchCondition, PolicyAction};

    fn udp443(id: &str, priority: i32, action: PolicyAction) -> FlowPolicy {
        FlowPolicy::new(id, MatchCondition::proto_port(FlowProtocol::Udp, 443), action).with_priority(priority)
    }

    #[test]
    fn test_equal_priority_different_action_conflicts() {
        let set = [udp443("a", 10, PolicyAction::drop_udp_443()), udp443("b", 10, PolicyAction::Pass)];
        let conflicts = detect_hard_conflicts(&set);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].policy_a, "a");
        assert_eq!(conflicts[0].policy_b, "b");
        assert!(conflicts[0].reason.contains("equal priority 10"));
        assert!(conflicts[0].reason.contains("(actions: STRATEGY:drop_udp_443 vs PASS)"));
    }

    #[test]
    fn test_different_priority_never_conflicts() {
        let set = [udp443("a", 10, PolicyAction::drop_udp_443()), udp443("b", 11, PolicyAction::Pass)];
        assert!(detect_hard_conflicts(&set).is_empty());
    }

    #[test]
    fn test_equivalent_actions_do_not_conflict() {
        let set = [
            udp443("a", 1, PolicyAction::strategy("DROP_UDP_443")),
            udp443("b", 1, PolicyAction::drop_udp_443()),
        ];
        assert!(compile(&set).is_ok());
    }

    #[test]
    fn test_error_message_preview_is_capped() {
        let set: Vec<FlowPolicy> = (0..4)
            .map(|i| udp443(&format!("p{i}"), 0, PolicyAction::strategy(format!("s{i}"))))
            .collect();
        let err = compile(&set).unwrap_err();
        assert_eq!(err.conflicts.len(), 6);

        let text = err.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Policy compilation failed: hard-conflicts=6");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[6], "- ...");
        assert!(lines[1].starts_with("- p0 <-> p1: "));
    }

    #[test]
    fn test_compile_resolves_authored_destinations() {
        let mut cond = MatchCondition::proto_port(FlowProtocol::Udp, 443);
        cond.dst_ip_set = Some(["203.0.113.9".to_string()].into());
        let graph = compile(&[FlowPolicy::new("one-host", cond, PolicyAction::drop_udp_443())]).unwrap();

        assert!(graph.evaluate_udp443("203.0.113.9".parse().unwrap()).is_some());
        assert!(graph.evaluate_udp443("1.1.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_compile_rejects_unparsable_destination() {
        let mut cond = MatchCondition::proto_port(FlowProtocol::Udp, 443);
        cond.dst_ip_set = Some(["203.0.113.999".to_string()].into());
        let err = compile(&[FlowPolicy::new("typo", cond, PolicyAction::drop_udp_443())]).unwrap_err();

        assert!(err.conflicts.is_empty());
        assert_eq!(err.invalid.len(), 1);
        assert!(err.invalid[0].starts_with("typo: "));
        assert!(err.to_string().contains("invalid-conditions=1"));
    }
}
