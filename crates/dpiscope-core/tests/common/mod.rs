//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::Utc;
use dpiscope_core::packet::{build_client_hello, PacketBuilder, TcpFlags};
use dpiscope_core::signals::{BlockageCode, HostTested};
use std::net::IpAddr;

/// Client address used by all fixtures
pub const CLIENT: [u8; 4] = [192, 168, 1, 10];
/// Server address used by all fixtures
pub const SERVER: [u8; 4] = [203, 0, 113, 7];

/// Server address as `IpAddr`
pub fn server_ip() -> IpAddr {
    IpAddr::from(SERVER)
}

/// Outbound TLS ClientHello for `sni`; an empty `sni` carries no usable name
pub fn client_hello_packet(sni: &str, src_port: u16) -> Vec<u8> {
    PacketBuilder::tcp_v4()
        .src_ip_v4(CLIENT)
        .dst_ip_v4(SERVER)
        .src_port(src_port)
        .dst_port(443)
        .ttl(128)
        .flags(TcpFlags::PSH | TcpFlags::ACK)
        .seq(1000)
        .payload(&build_client_hello(sni, &[7u8; 32]))
        .build()
}

/// Inbound TCP segment from the server
pub fn server_segment(flags: TcpFlags, ttl: u8, ip_id: u16, dst_port: u16) -> Vec<u8> {
    PacketBuilder::tcp_v4()
        .src_ip_v4(SERVER)
        .dst_ip_v4(CLIENT)
        .src_port(443)
        .dst_port(dst_port)
        .ttl(ttl)
        .ip_id(ip_id)
        .flags(flags)
        .build()
}

/// Outbound QUIC-sized UDP datagram to port 443
pub fn quic_datagram(src_port: u16) -> Vec<u8> {
    let mut payload = vec![0u8; 1200];
    payload[0] = 0xC3;
    payload[1..5].copy_from_slice(&[0, 0, 0, 1]);
    PacketBuilder::udp_v4()
        .src_ip_v4(CLIENT)
        .dst_ip_v4(SERVER)
        .src_port(src_port)
        .dst_port(443)
        .payload(&payload)
        .build()
}

/// Test result for a host that timed out on TCP connect
pub fn tcp_timeout(hostname: &str) -> HostTested {
    let mut tested = HostTested::ok(hostname, Some(server_ip()), Utc::now());
    tested.tcp_ok = false;
    tested.tls_ok = false;
    tested.blockage = Some(BlockageCode::TcpConnectTimeout);
    tested
}

/// Test result for a host reset after `latency_ms`
pub fn tcp_reset(hostname: &str, latency_ms: u64) -> HostTested {
    let mut tested = HostTested::ok(hostname, Some(server_ip()), Utc::now());
    tested.tcp_ok = false;
    tested.tls_ok = false;
    tested.blockage = Some(BlockageCode::TcpConnectionReset);
    tested.tcp_latency_ms = Some(latency_ms);
    tested
}
