//! HTTP redirect detection
//!
//! Buffers the head of plaintext HTTP responses (TCP source port 80) and
//! looks for a 3xx status with an absolute `Location`. Injected block pages
//! usually redirect to a small set of landing hosts, so the detector also
//! counts distinct redirect targets (by eTLD+1) inside a sliding window.

use super::flow::FlowKey;
use crate::config::InspectConfig;
use crate::error::Result;
use crate::intercept::{FilterContext, FilterVerdict, PacketFilter};
use crate::packet::{ports, Packet};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Normalize a host name: trim, drop trailing dots, lowercase, IDNA to ASCII.
pub fn normalize_host(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered.parse::<IpAddr>().is_ok() {
        return Some(lowered);
    }
    idna::domain_to_ascii(&lowered).ok().filter(|h| !h.is_empty())
}

/// Registrable-domain approximation: the last two labels. IP literals have none.
pub fn etld_plus_one(host: &str) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 | 1 => None,
        n => Some(format!("{}.{}", labels[n - 2], labels[n - 1])),
    }
}

/// Host of an absolute `http://` / `https://` URI
fn uri_host(location: &str) -> Option<(bool, String)> {
    let (https, rest) = if let Some(r) = strip_prefix_ci(location, "https://") {
        (true, r)
    } else {
        (false, strip_prefix_ci(location, "http://")?)
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = if let Some(v6) = host_port.strip_prefix('[') {
        v6.split(']').next()?
    } else {
        host_port.split(':').next()?
    };
    normalize_host(host).map(|h| (https, h))
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// One observed 3xx redirect
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRecord {
    /// Server that sent the response
    pub server: IpAddr,
    /// HTTP status code
    pub status: u16,
    /// Raw `Location` value
    pub location: String,
    /// Normalized target host
    pub target_host: String,
    /// eTLD+1 of the target, `None` for IP literals
    pub target_etld: Option<String>,
    /// Normalized `Host` of the request on the same flow, when seen
    pub request_host: Option<String>,
    /// Target uses `https://`
    pub to_https: bool,
    /// Monotonic observation time
    pub observed_at: Instant,
    /// Wall-clock observation time
    pub observed_at_utc: DateTime<Utc>,
}

impl RedirectRecord {
    /// Plain http→https upgrade within the same site, which is not interference
    pub fn is_same_site_upgrade(&self) -> bool {
        self.to_https
            && self.target_etld.is_some()
            && self
                .request_host
                .as_deref()
                .and_then(etld_plus_one)
                .is_some_and(|req| Some(req) == self.target_etld)
    }
}

#[derive(Debug, Default)]
struct FlowBuffer {
    request_host: Option<String>,
    response: Vec<u8>,
    done: bool,
    updated: Option<Instant>,
}

/// Redirect detector state
#[derive(Debug)]
pub struct RedirectDetector {
    flows: DashMap<FlowKey, FlowBuffer>,
    by_server: DashMap<IpAddr, RedirectRecord>,
    recent_targets: Mutex<VecDeque<(Instant, String)>>,
    buffer_bytes: usize,
    burst_window: Duration,
    retention: Duration,
}

impl RedirectDetector {
    /// Detector using the `[inspect]` tunables
    pub fn new(cfg: &InspectConfig) -> Self {
        Self {
            flows: DashMap::new(),
            by_server: DashMap::new(),
            recent_targets: Mutex::new(VecDeque::new()),
            buffer_bytes: cfg.redirect_buffer_bytes,
            burst_window: cfg.redirect_burst_window(),
            retention: cfg.redirect_retention(),
        }
    }

    /// Feed one packet; returns a record when a redirect completes parsing
    pub fn observe(&self, packet: &Packet, now: Instant) -> Option<RedirectRecord> {
        if !packet.is_tcp() || packet.payload_len() == 0 {
            return None;
        }
        let key = FlowKey::of(packet);

        if packet.is_outbound() && packet.dst_port == ports::HTTP {
            if packet.is_http_request() {
                let host = packet.extract_http_host().and_then(|h| {
                    let bare = h.split(':').next().unwrap_or_default().to_string();
                    normalize_host(&bare)
                });
                // Each request on a keep-alive flow gets its own response head
                let mut flow = self.flows.entry(key).or_default();
                flow.request_host = host;
                flow.response.clear();
                flow.done = false;
                flow.updated = Some(now);
            }
            return None;
        }
        if !packet.is_inbound() || packet.src_port != ports::HTTP {
            return None;
        }

        let (status, location, request_host) = {
            let mut flow = self.flows.entry(key).or_default();
            if flow.done {
                return None;
            }
            flow.updated = Some(now);
            let room = self.buffer_bytes.saturating_sub(flow.response.len());
            let payload = packet.payload();
            flow.response.extend_from_slice(&payload[..payload.len().min(room)]);

            let Some(parsed) = response_head(&flow.response).map(parse_redirect) else {
                if flow.response.len() >= self.buffer_bytes || !could_be_redirect(&flow.response) {
                    flow.done = true;
                }
                return None;
            };
            flow.done = true;
            let (status, location) = parsed?;
            (status, location, flow.request_host.clone())
        };

        let (to_https, target_host) = uri_host(&location)?;
        let record = RedirectRecord {
            server: packet.src_addr,
            status,
            location,
            target_etld: etld_plus_one(&target_host),
            target_host,
            request_host,
            to_https,
            observed_at: now,
            observed_at_utc: Utc::now(),
        };
        debug!(server = %record.server, status, target = %record.target_host, "HTTP redirect observed");

        if let Some(etld) = &record.target_etld {
            let mut recent = self.recent_targets.lock();
            recent.push_back((now, etld.clone()));
            while recent
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.retention)
            {
                recent.pop_front();
            }
        }
        self.by_server.insert(record.server, record.clone());
        Some(record)
    }

    /// Latest redirect from `server` within the retention window
    pub fn latest_for_ip(&self, server: IpAddr, now: Instant) -> Option<RedirectRecord> {
        let record = self.by_server.get(&server)?;
        (now.saturating_duration_since(record.observed_at) <= self.retention).then(|| record.clone())
    }

    /// Distinct redirect eTLD+1 targets inside the burst window
    pub fn burst_count(&self, now: Instant) -> usize {
        self.recent_targets
            .lock()
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.burst_window)
            .map(|(_, etld)| etld.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Drop idle flow buffers and expired records
    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.flows
            .retain(|_, f| f.updated.is_some_and(|at| now.saturating_duration_since(at) < idle));
        self.by_server
            .retain(|_, r| now.saturating_duration_since(r.observed_at) <= self.retention);
    }
}

/// Complete response head (status line + headers), if buffered
fn response_head(buf: &[u8]) -> Option<&[u8]> {
    let end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    Some(&buf[..end])
}

fn could_be_redirect(buf: &[u8]) -> bool {
    let n = buf.len().min(10);
    b"HTTP/1.1 3"[..n] == buf[..n] || b"HTTP/1.0 3"[..n] == buf[..n]
}

fn parse_redirect(head: &[u8]) -> Option<(u16, String)> {
    if !(head.starts_with(b"HTTP/1.1 3") || head.starts_with(b"HTTP/1.0 3")) {
        return None;
    }
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status: u16 = lines.next()?.split(' ').nth(1)?.parse().ok()?;
    let location = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("location").then(|| value.trim().to_string())
    })?;
    Some((status, location))
}

impl PacketFilter for RedirectDetector {
    fn name(&self) -> &str {
        "http-redirect-detector"
    }

    fn priority(&self) -> i32 {
        980
    }

    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict> {
        self.observe(packet, ctx.now());
        Ok(FilterVerdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, PacketBuilder};

    fn response(server: [u8; 4], body: &[u8]) -> Packet {
        let raw = PacketBuilder::tcp_v4()
            .src_ip_v4(server)
            .dst_ip_v4([10, 0, 0, 2])
            .src_port(80)
            .dst_port(50123)
            .payload(body)
            .build();
        Packet::from_bytes(&raw, Direction::Inbound).unwrap()
    }

    fn request(server: [u8; 4], host: &str) -> Packet {
        let body = format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n");
        let raw = PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4(server)
            .src_port(50123)
            .dst_port(80)
            .payload(body.as_bytes())
            .build();
        Packet::from_bytes(&raw, Direction::Outbound).unwrap()
    }

    // ====== Host Normalization Tests ======

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("  Example.COM. ").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("bücher.de").as_deref(), Some("xn--bcher-kva.de"));
        assert_eq!(normalize_host("   "), None);
    }

    #[test]
    fn test_etld_plus_one() {
        assert_eq!(etld_plus_one("warning.isp.example.net").as_deref(), Some("example.net"));
        assert_eq!(etld_plus_one("192.0.2.1"), None);
        assert_eq!(etld_plus_one("localhost"), None);
    }

    // ====== Redirect Parsing Tests ======

    #[test]
    fn test_redirect_detected() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        let pkt = response(
            [198, 51, 100, 1],
            b"HTTP/1.1 302 Found\r\nLocation: http://Block.Example.NET/page?x=1\r\nContent-Length: 0\r\n\r\n",
        );
        let record = det.observe(&pkt, now).unwrap();
        assert_eq!(record.status, 302);
        assert_eq!(record.target_host, "block.example.net");
        assert_eq!(record.target_etld.as_deref(), Some("example.net"));
        assert!(det.latest_for_ip("198.51.100.1".parse().unwrap(), now).is_some());
    }

    #[test]
    fn test_relative_location_ignored() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let pkt = response([198, 51, 100, 1], b"HTTP/1.1 301 Moved\r\nLocation: /login\r\n\r\n");
        assert!(det.observe(&pkt, Instant::now()).is_none());
    }

    #[test]
    fn test_non_redirect_status_ignored() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let pkt = response([198, 51, 100, 1], b"HTTP/1.1 200 OK\r\nLocation: http://x.example/\r\n\r\n");
        assert!(det.observe(&pkt, Instant::now()).is_none());
    }

    #[test]
    fn test_head_split_across_segments() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        assert!(det
            .observe(&response([198, 51, 100, 1], b"HTTP/1.0 307 Temp\r\nLoca"), now)
            .is_none());
        let record = det
            .observe(&response([198, 51, 100, 1], b"tion: https://portal.example.org/\r\n\r\n"), now)
            .unwrap();
        assert!(record.to_https);
    }

    #[test]
    fn test_same_site_upgrade_recognized() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        det.observe(&request([198, 51, 100, 1], "www.example.com"), now);
        let record = det
            .observe(
                &response([198, 51, 100, 1], b"HTTP/1.1 301 Moved\r\nLocation: https://example.com/\r\n\r\n"),
                now,
            )
            .unwrap();
        assert!(record.is_same_site_upgrade());
    }

    #[test]
    fn test_keep_alive_flow_rearmed_by_next_request() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        let server = [198, 51, 100, 1];

        det.observe(&request(server, "news.example.org"), now);
        assert!(det
            .observe(&response(server, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"), now)
            .is_none());
        // Same connection, second request answered by an injected redirect
        det.observe(&request(server, "news.example.org"), now);
        let record = det
            .observe(
                &response(server, b"HTTP/1.1 302 Found\r\nLocation: http://warning.isp.example.net/\r\n\r\n"),
                now,
            )
            .unwrap();
        assert_eq!(record.target_host, "warning.isp.example.net");
        assert_eq!(record.request_host.as_deref(), Some("news.example.org"));
    }

    #[test]
    fn test_finished_flow_ignores_trailing_segments() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        let server = [198, 51, 100, 1];
        assert!(det.observe(&response(server, b"HTTP/1.1 200 OK\r\n\r\n"), now).is_none());
        assert!(det
            .observe(&response(server, b"HTTP/1.1 302 Found\r\nLocation: http://x.example.net/\r\n\r\n"), now)
            .is_none());
    }

    // ====== Burst Tests ======

    #[test]
    fn test_burst_counts_distinct_etlds() {
        let det = RedirectDetector::new(&InspectConfig::default());
        let now = Instant::now();
        let targets = ["http://a.lander.example/", "http://b.lander.example/", "http://warn.other.test/"];
        for (i, target) in targets.iter().enumerate() {
            let body = format!("HTTP/1.1 302 Found\r\nLocation: {target}\r\n\r\n");
            let server = [198, 51, 100, u8::try_from(i + 1).unwrap()];
            det.observe(&response(server, body.as_bytes()), now);
        }
        assert_eq!(det.burst_count(now), 2);
        assert_eq!(det.burst_count(now + Duration::from_secs(601)), 0);
    }
}
