//! System DNS / DoH seam

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`DnsController`] operations
pub type DnsFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Resolver pair with DoH templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsPreset {
    /// Display name
    pub name: &'static str,
    /// Primary resolver
    pub primary_ip: &'static str,
    /// DoH template for the primary
    pub primary_doh: &'static str,
    /// Secondary resolver
    pub secondary_ip: &'static str,
    /// DoH template for the secondary
    pub secondary_doh: &'static str,
}

/// Known presets; the first one is the fallback
pub const DNS_PRESETS: [DnsPreset; 4] = [
    DnsPreset {
        name: "Cloudflare",
        primary_ip: "1.1.1.1",
        primary_doh: "https://cloudflare-dns.com/dns-query",
        secondary_ip: "1.0.0.1",
        secondary_doh: "https://cloudflare-dns.com/dns-query",
    },
    DnsPreset {
        name: "Google",
        primary_ip: "8.8.8.8",
        primary_doh: "https://dns.google/dns-query",
        secondary_ip: "8.8.4.4",
        secondary_doh: "https://dns.google/dns-query",
    },
    DnsPreset {
        name: "Yandex",
        primary_ip: "77.88.8.8",
        primary_doh: "https://dns.yandex.ru/dns-query",
        secondary_ip: "77.88.8.1",
        secondary_doh: "https://dns.yandex.ru/dns-query",
    },
    DnsPreset {
        name: "Hybrid (CF + Yandex)",
        primary_ip: "1.1.1.1",
        primary_doh: "https://cloudflare-dns.com/dns-query",
        secondary_ip: "77.88.8.8",
        secondary_doh: "https://dns.yandex.ru/dns-query",
    },
];

impl DnsPreset {
    /// Preset by name, case-insensitive; unknown names get the first preset
    pub fn resolve(name: &str) -> Self {
        let name = name.trim();
        DNS_PRESETS
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .unwrap_or(DNS_PRESETS[0])
    }
}

/// Something that can switch the system resolver to DoH and back.
///
/// Both operations are system changes; the apply service only calls them
/// with explicit consent.
#[cfg_attr(test, mockall::automock)]
pub trait DnsController: Send + Sync {
    /// Point the system at `preset` with DoH
    fn enable_doh(&self, preset: &str) -> DnsFuture;

    /// Restore the resolver settings saved before the first change
    fn restore(&self) -> DnsFuture;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_preset() {
        assert_eq!(DnsPreset::resolve("google").primary_ip, "8.8.8.8");
        assert_eq!(DnsPreset::resolve(" Yandex ").secondary_ip, "77.88.8.1");
        assert_eq!(DnsPreset::resolve("nope").name, "Cloudflare");
    }
}
