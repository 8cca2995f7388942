//! Capture filter expressions
//!
//! Builder for WinDivert-syntax filter strings plus the presets the traffic
//! engine opens its handle with. Building is plain string work, so it lives
//! outside the Windows-only module.

use crate::error::{PlatformError, Result};

/// Filter builder for WinDivert
///
/// # Example
///
/// ```rust
/// use dpiscope_platform::FilterBuilder;
///
/// let filter = FilterBuilder::new()
///     .inbound()
///     .tcp()
///     .src_port(443)
///     .build();
///
/// assert_eq!(filter, "inbound and tcp and tcp.SrcPort == 443");
/// ```
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    parts: Vec<FilterPart>,
}

#[derive(Debug, Clone)]
enum FilterPart {
    Term(String),
    Or,
    GroupStart,
    GroupEnd,
}

impl FilterBuilder {
    /// Create a new filter builder
    pub fn new() -> Self {
        Self::default()
    }

    fn term(mut self, term: impl Into<String>) -> Self {
        self.parts.push(FilterPart::Term(term.into()));
        self
    }

    /// Add "outbound" condition
    pub fn outbound(self) -> Self {
        self.term("outbound")
    }

    /// Add "inbound" condition
    pub fn inbound(self) -> Self {
        self.term("inbound")
    }

    /// Add "tcp" protocol filter
    pub fn tcp(self) -> Self {
        self.term("tcp")
    }

    /// Add "udp" protocol filter
    pub fn udp(self) -> Self {
        self.term("udp")
    }

    /// TCP destination port
    pub fn dst_port(self, port: u16) -> Self {
        self.term(format!("tcp.DstPort == {port}"))
    }

    /// TCP source port
    pub fn src_port(self, port: u16) -> Self {
        self.term(format!("tcp.SrcPort == {port}"))
    }

    /// UDP destination port
    pub fn udp_dst_port(self, port: u16) -> Self {
        self.term(format!("udp.DstPort == {port}"))
    }

    /// UDP source port
    pub fn udp_src_port(self, port: u16) -> Self {
        self.term(format!("udp.SrcPort == {port}"))
    }

    /// Add "or" operator
    pub fn or(mut self) -> Self {
        self.parts.push(FilterPart::Or);
        self
    }

    /// Start a group (open parenthesis)
    pub fn group_start(mut self) -> Self {
        self.parts.push(FilterPart::GroupStart);
        self
    }

    /// End a group (close parenthesis)
    pub fn group_end(mut self) -> Self {
        self.parts.push(FilterPart::GroupEnd);
        self
    }

    /// Build the filter string; adjacent terms are joined with "and"
    pub fn build(self) -> String {
        let mut result = String::new();
        let mut after_term = false;

        for part in self.parts {
            match part {
                FilterPart::Term(t) => {
                    if after_term {
                        result.push_str(" and ");
                    }
                    result.push_str(&t);
                    after_term = true;
                }
                FilterPart::Or => {
                    result.push_str(" or ");
                    after_term = false;
                }
                FilterPart::GroupStart => {
                    if after_term {
                        result.push_str(" and ");
                    }
                    result.push('(');
                    after_term = false;
                }
                FilterPart::GroupEnd => {
                    result.push(')');
                    after_term = true;
                }
            }
        }

        result
    }
}

/// Filters the traffic engine opens its handle with
pub struct FilterPresets;

impl FilterPresets {
    /// Every IP packet in both directions
    pub fn all_ip() -> String {
        "ip or ipv6".into()
    }

    /// Only what the bypass techniques and wire inspectors look at:
    /// outbound HTTP/HTTPS, inbound replies from those ports, and UDP/443
    /// in both directions.
    pub fn web_traffic() -> String {
        let outbound_tcp = FilterBuilder::new()
            .group_start()
            .outbound()
            .tcp()
            .group_start()
            .dst_port(80)
            .or()
            .dst_port(443)
            .group_end()
            .group_end()
            .build();
        let inbound_tcp = FilterBuilder::new()
            .group_start()
            .inbound()
            .tcp()
            .group_start()
            .src_port(80)
            .or()
            .src_port(443)
            .group_end()
            .group_end()
            .build();
        let quic = FilterBuilder::new()
            .group_start()
            .udp()
            .group_start()
            .udp_dst_port(443)
            .or()
            .udp_src_port(443)
            .group_end()
            .group_end()
            .build();
        format!("{outbound_tcp} or {inbound_tcp} or {quic}")
    }

    /// Look up a preset by name
    pub fn by_name(name: &str) -> Option<String> {
        match name.trim().to_ascii_lowercase().as_str() {
            "all" | "all-ip" => Some(Self::all_ip()),
            "web" | "web-traffic" => Some(Self::web_traffic()),
            _ => None,
        }
    }
}

/// Expand a preset name, or validate a raw filter expression
///
/// # Errors
/// Fails with [`PlatformError::InvalidFilter`] when `spec` is neither a
/// preset nor a structurally sound expression.
pub fn resolve_filter(spec: &str) -> Result<String> {
    if let Some(preset) = FilterPresets::by_name(spec) {
        return Ok(preset);
    }
    let expression = spec.trim();
    validate_filter(expression)?;
    Ok(expression.to_string())
}

/// Cheap structural check before handing a filter to the driver
///
/// The driver does the real parse; this catches empty strings, unbalanced
/// parentheses and dangling operators with a readable message.
pub fn validate_filter(filter: &str) -> Result<()> {
    let trimmed = filter.trim();
    if trimmed.is_empty() {
        return Err(PlatformError::InvalidFilter("Empty filter".into()));
    }

    let mut depth = 0i32;
    for c in trimmed.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(PlatformError::InvalidFilter("Unbalanced ')'".into()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PlatformError::InvalidFilter("Unclosed '('".into()));
    }

    let lower = trimmed.to_ascii_lowercase();
    let last = lower.split_whitespace().last().unwrap_or_default();
    if matches!(last, "and" | "or" | "not" | "==" | "!=") {
        return Err(PlatformError::InvalidFilter(format!("Dangling '{last}'")));
    }

    Ok(())
}
