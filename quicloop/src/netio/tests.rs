//! Socket endpoint tests against the loopback interface.
//!
//! These tests bind real UDP sockets on ephemeral ports, so they can run in
//! parallel without coordination.

use super::config::*;
use super::endpoint::Endpoint;
use super::msg::*;
use super::socket::*;
use quicloop_x::Ecn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

fn default_opts() -> SocketOptions {
    SocketOptions {
        buffer_size: None,
        reuse_port: false,
    }
}

/// Poll `recv_msg` until a datagram arrives or the deadline passes.
fn recv_with_deadline(ep: &SocketEndpoint, buf: &mut [u8]) -> RecvMeta {
    let fd = ep.raw_fd().expect("endpoint is open");
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match recv_msg(fd, buf) {
            Ok(meta) => return meta,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no datagram received");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("recv_msg failed: {e}"),
        }
    }
}

// =============================================================================
// OPEN / CLOSE
// =============================================================================

#[test]
fn test_open_v4_yields_one_endpoint_with_ephemeral_port() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    assert_eq!(eps.len(), 1);
    assert_eq!(eps[0].family(), AddressFamily::V4);
    assert_ne!(eps[0].local_port(), 0);
    assert!(eps[0].is_open());
}

#[test]
fn test_open_v6_yields_one_endpoint_with_ephemeral_port() {
    let eps = open_endpoints(0, AddressFamily::V6, 4, &default_opts()).unwrap();
    assert_eq!(eps.len(), 1);
    assert_eq!(eps[0].family(), AddressFamily::V6);
    assert_ne!(eps[0].local_port(), 0);
}

#[test]
fn test_open_unspec_yields_v4_and_v6() {
    let eps = open_endpoints(0, AddressFamily::Unspec, 4, &default_opts()).unwrap();
    assert_eq!(eps.len(), 2);
    assert_eq!(eps[0].family(), AddressFamily::V4);
    assert_eq!(eps[1].family(), AddressFamily::V6);
    assert!(eps.iter().all(|ep| ep.local_port() != 0));
}

#[test]
fn test_open_unspec_rejects_when_over_capacity() {
    let err = open_endpoints(0, AddressFamily::Unspec, 1, &default_opts()).unwrap_err();
    assert!(matches!(
        err,
        crate::error::BindError::TooManyEndpoints {
            requested: 2,
            max: 1
        }
    ));
}

#[test]
fn test_open_port_in_use_fails_without_partial_result() {
    let first = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let port = first[0].local_port();

    // IPv4 bind collides, so the IPv6 endpoint must never be handed out.
    let err = open_endpoints(port, AddressFamily::Unspec, 4, &default_opts()).unwrap_err();
    assert!(matches!(err, crate::error::BindError::Bind { .. }));
}

#[test]
fn test_close_is_idempotent() {
    let mut eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let ep = &mut eps[0];
    ep.close();
    assert!(!ep.is_open());
    assert!(ep.raw_fd().is_none());
    ep.close();
    assert!(!ep.is_open());
}

#[test]
fn test_buffer_size_failure_is_not_fatal() {
    let opts = SocketOptions {
        buffer_size: Some(usize::MAX / 2),
        reuse_port: false,
    };
    let eps = open_endpoints(0, AddressFamily::V4, 4, &opts).unwrap();
    assert_eq!(eps.len(), 1);
}

#[test]
fn test_reuse_port_allows_second_bind() {
    let opts = SocketOptions {
        buffer_size: None,
        reuse_port: true,
    };
    let first = open_endpoint(0, AddressFamily::V4, &opts).unwrap();
    let second = open_endpoint(first.local_port(), AddressFamily::V4, &opts).unwrap();
    assert_eq!(first.local_port(), second.local_port());
}

#[test]
fn test_loopback_addr_per_family() {
    assert_eq!(
        loopback_addr(AddressFamily::V4, 4433),
        "127.0.0.1:4433".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(
        loopback_addr(AddressFamily::V6, 4433),
        "[::1]:4433".parse::<SocketAddr>().unwrap()
    );
}

// =============================================================================
// ANCILLARY DATA
// =============================================================================

#[test]
fn test_recv_reports_destination_and_interface() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let server = &eps[0];
    let target = loopback_addr(AddressFamily::V4, server.local_port());

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hello", target).unwrap();

    let mut buf = [0u8; DEFAULT_RECV_BUFFER_SIZE];
    let meta = recv_with_deadline(server, &mut buf);
    assert_eq!(meta.len, 5);
    assert_eq!(&buf[..meta.len], b"hello");
    assert_eq!(meta.peer, client.local_addr().unwrap());
    assert_eq!(meta.local_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert_ne!(meta.if_index, 0);
    assert_eq!(meta.ecn, Ecn::NotEct);
    assert!(!meta.truncated);
}

#[test]
fn test_recv_on_empty_socket_would_block() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let mut buf = [0u8; 64];
    let err = recv_msg(eps[0].raw_fd().unwrap(), &mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn test_send_with_local_address_reaches_peer() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let sender = &eps[0];
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();

    let meta = SendMeta {
        peer: receiver.local_addr().unwrap(),
        local: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, sender.local_port()))),
        if_index: 0,
        segment_size: 0,
    };
    let sent = send_msg(sender.raw_fd().unwrap(), b"pong", &meta).unwrap();
    assert_eq!(sent, 4);

    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 16];
    let (n, from) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from.port(), sender.local_port());
}

/// Lengths of the datagrams `receiver` gets until it goes quiet.
fn drain_lengths(receiver: &UdpSocket) -> Vec<usize> {
    receiver
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 2048];
    let mut lengths = Vec::new();
    while let Ok(n) = receiver.recv(&mut buf) {
        lengths.push(n);
    }
    lengths
}

fn send_segmented_with_source(family: AddressFamily, loopback: IpAddr) {
    let eps = open_endpoints(0, family, 4, &default_opts()).unwrap();
    let sender = &eps[0];
    let receiver = UdpSocket::bind(SocketAddr::new(loopback, 0)).unwrap();

    let meta = SendMeta {
        peer: receiver.local_addr().unwrap(),
        local: Some(SocketAddr::new(loopback, sender.local_port())),
        if_index: 0,
        segment_size: 100,
    };
    let sent = send_msg(sender.raw_fd().unwrap(), &[0x5a; 300], &meta).unwrap();
    assert_eq!(sent, 300);
    assert_eq!(drain_lengths(&receiver), vec![100, 100, 100]);
}

#[test]
fn test_segment_size_survives_source_address_v4() {
    if !gso_available() {
        return;
    }
    send_segmented_with_source(AddressFamily::V4, IpAddr::V4(Ipv4Addr::LOCALHOST));
}

#[test]
fn test_segment_size_survives_source_address_v6() {
    if !gso_available() {
        return;
    }
    send_segmented_with_source(AddressFamily::V6, IpAddr::V6(Ipv6Addr::LOCALHOST));
}

#[test]
fn test_recv_reports_ecn_marks_v4() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket2::SockRef::from(&client).set_tos(0x01).unwrap();
    client
        .send_to(b"marked", loopback_addr(AddressFamily::V4, eps[0].local_port()))
        .unwrap();

    let mut buf = [0u8; DEFAULT_RECV_BUFFER_SIZE];
    let meta = recv_with_deadline(&eps[0], &mut buf);
    assert_eq!(meta.ecn, Ecn::Ect1);
}

#[test]
fn test_recv_reports_ecn_marks_v6() {
    let eps = open_endpoints(0, AddressFamily::V6, 4, &default_opts()).unwrap();
    let client = UdpSocket::bind("[::1]:0").unwrap();
    socket2::SockRef::from(&client).set_tclass_v6(0x02).unwrap();
    client
        .send_to(b"marked", loopback_addr(AddressFamily::V6, eps[0].local_port()))
        .unwrap();

    let mut buf = [0u8; DEFAULT_RECV_BUFFER_SIZE];
    let meta = recv_with_deadline(&eps[0], &mut buf);
    assert_eq!(meta.ecn, Ecn::Ect0);
}

#[test]
fn test_recv_flags_truncated_datagram() {
    let eps = open_endpoints(0, AddressFamily::V4, 4, &default_opts()).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&[0u8; 2000], loopback_addr(AddressFamily::V4, eps[0].local_port()))
        .unwrap();

    let mut buf = [0u8; DEFAULT_RECV_BUFFER_SIZE];
    let meta = recv_with_deadline(&eps[0], &mut buf);
    assert!(meta.truncated);
    assert_eq!(meta.len, DEFAULT_RECV_BUFFER_SIZE);
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[test]
fn test_send_buffer_size_follows_gso_flag() {
    let mut config = NetIoConfig::default();
    if gso_available() {
        assert_eq!(config.send_buffer_size(), GSO_SEND_BUFFER_SIZE);
    }
    config.disable_gso = true;
    assert_eq!(config.send_buffer_size(), SEND_BUFFER_SIZE);
}

#[test]
fn test_netio_config_validation_collects_errors() {
    let config = NetIoConfig {
        workers: 0,
        max_endpoints: 1,
        recv_burst: 0,
        ..Default::default()
    };
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
}

#[test]
fn test_address_family_parsing() {
    assert_eq!("v4".parse::<AddressFamily>().unwrap(), AddressFamily::V4);
    assert_eq!("IPv6".parse::<AddressFamily>().unwrap(), AddressFamily::V6);
    assert_eq!("unspec".parse::<AddressFamily>().unwrap(), AddressFamily::Unspec);
    assert!("v5".parse::<AddressFamily>().is_err());
}
