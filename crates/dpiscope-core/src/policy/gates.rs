//! Environment switches for policy-driven execution paths

use tracing::debug;

/// UDP/443 drop decided per destination by the decision graph
pub const ENV_UDP443: &str = "DPISCOPE_POLICY_DRIVEN_UDP443";
/// TCP/443 techniques decided by the decision graph
pub const ENV_TCP443: &str = "DPISCOPE_POLICY_DRIVEN_TCP443";
/// TCP/80 techniques decided by the decision graph
pub const ENV_TCP80: &str = "DPISCOPE_POLICY_DRIVEN_TCP80";
/// TTL-trick block decided by the decision graph
pub const ENV_TTLBLOCK: &str = "DPISCOPE_POLICY_DRIVEN_TTLBLOCK";

/// `1`, `true`, `yes`, `y` or `on`, trimmed and case-insensitive
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// Which execution paths consult the decision graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyGates {
    /// UDP/443 drop
    pub udp443: bool,
    /// TCP/443 techniques
    pub tcp443: bool,
    /// TCP/80 techniques
    pub tcp80: bool,
    /// TTL trick
    pub ttl_block: bool,
}

impl PolicyGates {
    /// Read every gate from the process environment.
    ///
    /// Unset or unreadable variables mean "off".
    pub fn from_env() -> Self {
        let gates = Self {
            udp443: env_flag(ENV_UDP443),
            tcp443: env_flag(ENV_TCP443),
            tcp80: env_flag(ENV_TCP80),
            ttl_block: env_flag(ENV_TTLBLOCK),
        };
        debug!(?gates, "policy gates");
        gates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "Y", "on", "On"] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["", "0", "false", "off", "enable", "2"] {
            assert!(!is_truthy(v), "{v}");
        }
    }

    #[test]
    fn test_unset_gates_are_off() {
        // Names nobody sets in CI
        assert!(!env_flag("DPISCOPE_TEST_GATE_THAT_IS_NEVER_SET"));
        assert_eq!(PolicyGates::default(), PolicyGates { udp443: false, tcp443: false, tcp80: false, ttl_block: false });
    }
}
