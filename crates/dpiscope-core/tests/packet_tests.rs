//! Integration tests for packet module
//!
//! These tests verify end-to-end packet parsing and that hostile input
//! never panics the parser or the interception chain.

mod common;

use dpiscope_core::intercept::FilterChain;
use dpiscope_core::packet::*;
use proptest::prelude::*;
use std::time::Instant;

/// Test data: minimal valid IPv4 TCP SYN packet
fn create_tcp_syn_packet() -> Vec<u8> {
    vec![
        // IPv4 header (20 bytes)
        0x45, 0x00, 0x00, 0x28, // Version, IHL, DSCP, ECN, Total Length (40)
        0x00, 0x01, 0x00, 0x00, // Identification, Flags, Fragment Offset
        0x40, 0x06, 0x00, 0x00, // TTL (64), Protocol (TCP), Checksum
        0xC0, 0xA8, 0x01, 0x01, // Source IP: 192.168.1.1
        0xC0, 0xA8, 0x01, 0x02, // Dest IP: 192.168.1.2
        // TCP header (20 bytes)
        0x04, 0xD2, 0x01, 0xBB, // Src Port (1234), Dst Port (443)
        0x00, 0x00, 0x00, 0x01, // Sequence Number
        0x00, 0x00, 0x00, 0x00, // Acknowledgment Number
        0x50, 0x02, 0xFF, 0xFF, // Data Offset, SYN flag, Window Size
        0x00, 0x00, 0x00, 0x00, // Checksum, Urgent Pointer
    ]
}

/// Test data: HTTP GET request packet
fn create_http_get_packet() -> Vec<u8> {
    PacketBuilder::tcp_v4()
        .src_ip_v4([192, 168, 1, 1])
        .dst_ip_v4([192, 168, 1, 2])
        .src_port(1234)
        .dst_port(80)
        .flags(TcpFlags::PSH | TcpFlags::ACK)
        .payload(b"GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n")
        .build()
}

// ====== Parse Tests ======

#[test]
fn test_parse_tcp_syn() {
    let data = create_tcp_syn_packet();
    let packet = Packet::from_bytes(&data, Direction::Outbound).unwrap();

    assert!(packet.is_tcp());
    assert!(packet.is_syn());
    assert!(!packet.is_syn_ack());
    assert_eq!(packet.src_port, 1234);
    assert_eq!(packet.dst_port, 443);
    assert_eq!(packet.ttl, 64);
    assert_eq!(packet.ip_id, Some(1));
}

#[test]
fn test_parse_http_request() {
    let data = create_http_get_packet();
    let packet = Packet::from_bytes(&data, Direction::Outbound).unwrap();

    assert!(packet.is_http_request());
    assert_eq!(packet.extract_http_host().as_deref(), Some("example.com"));
}

#[test]
fn test_parse_tls_client_hello() {
    let data = common::client_hello_packet("video.example.com", 50000);
    let packet = Packet::from_bytes(&data, Direction::Outbound).unwrap();

    assert!(packet.is_tls_client_hello());
    assert_eq!(packet.extract_sni().as_deref(), Some("video.example.com"));
    assert_eq!(packet.remote_addr(), common::server_ip());
}

#[test]
fn test_client_hello_without_sni() {
    let data = common::client_hello_packet("", 50001);
    let packet = Packet::from_bytes(&data, Direction::Outbound).unwrap();

    assert!(packet.is_tls_client_hello());
    assert!(packet.extract_sni().is_none());
}

#[test]
fn test_truncated_packet_rejected() {
    let data = create_tcp_syn_packet();
    assert!(Packet::from_bytes(&data[..30], Direction::Outbound).is_err());
    assert!(Packet::from_bytes(&[], Direction::Inbound).is_err());
}

#[test]
fn test_tcp_flags() {
    let syn_ack = TcpFlags::from_byte(0x12);
    assert!(syn_ack.is_syn_ack());
    assert_eq!(syn_ack.to_byte(), 0x12);
    assert!(TcpFlags::from_byte(0x04).contains(TcpFlags::RST));
}

#[test]
fn test_protocol_detection() {
    assert_eq!(Protocol::from_u8(6), Protocol::Tcp);
    assert_eq!(Protocol::from_u8(17), Protocol::Udp);
    assert_eq!(Protocol::from_u8(0), Protocol::Other(0));
}

// ====== Robustness Tests ======

proptest! {
    #[test]
    fn test_parser_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1600)) {
        if let Ok(packet) = Packet::from_bytes(&data, Direction::Outbound) {
            let _ = packet.extract_sni();
            let _ = packet.extract_http_host();
            prop_assert!(packet.payload_len() <= packet.len());
        }
    }

    #[test]
    fn test_sni_extraction_never_panics(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = extract_sni(&data);
        let _ = is_tls_client_hello(&data);
        let _ = is_quic_initial(&data);
    }

    #[test]
    fn test_empty_chain_reinjects_input(data in proptest::collection::vec(any::<u8>(), 0..200)) {
        let chain = FilterChain::new();
        let out = chain.process_raw(&data, Direction::Outbound, Instant::now());
        prop_assert!(!out.dropped);
        prop_assert_eq!(out.packets.len(), 1);
    }

    #[test]
    fn test_mutated_client_hello_never_panics(idx in 0usize..400, byte in any::<u8>()) {
        let mut data = common::client_hello_packet("example.com", 40000);
        let i = idx % data.len();
        data[i] = byte;
        if let Ok(packet) = Packet::from_bytes(&data, Direction::Outbound) {
            let _ = packet.extract_sni();
        }
    }
}
