//! Provisioning and flow steering tests against the software port.

use super::flow::{bind_address_for, install_flow_rules, FlowRule};
use super::frame::{build_udp_frame, FrameHeader};
use super::memory::MemoryPort;
use super::provision::*;
use super::*;
use crate::error::{ConfigError, DeviceError};
use quicloop_x::Ecn;
use std::net::IpAddr;
use std::sync::Arc;

fn server_config(queues: u16) -> NicConfig {
    NicConfig {
        queues,
        ..Default::default()
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// =============================================================================
// SERVER MODE
// =============================================================================

#[test]
fn test_server_provisions_every_queue_on_one_shared_pool() {
    let port = Arc::new(MemoryPort::builder().build());
    let provisioned = provision_server(port.clone(), &server_config(4)).unwrap();

    assert_eq!(provisioned.queue_count(), 4);
    assert_eq!(provisioned.pool.capacity(), 4 * 8192);
    for (i, q) in provisioned.queues.iter().enumerate() {
        assert_eq!(q.queue, i as u16);
        assert!(Arc::ptr_eq(&q.pool, &provisioned.pool));
        assert_eq!(q.staging.burst(), 32);
    }
    assert!(port.is_started());
}

#[test]
fn test_server_requests_fast_free_when_supported() {
    let port = Arc::new(MemoryPort::builder().fast_free_tx(true).build());
    provision_server(port.clone(), &server_config(2)).unwrap();
    let conf = port.port_conf().unwrap();
    assert!(conf.fast_free_tx);
    assert_eq!((conf.rx_queues, conf.tx_queues), (2, 2));

    let plain = Arc::new(MemoryPort::builder().fast_free_tx(false).build());
    provision_server(plain.clone(), &server_config(1)).unwrap();
    assert!(!plain.port_conf().unwrap().fast_free_tx);
}

#[test]
fn test_descriptors_are_clamped_to_device_limits() {
    let port = Arc::new(
        MemoryPort::builder()
            .descriptor_limits(DescLimits {
                min: 128,
                max: 512,
                align: 8,
            })
            .build(),
    );
    let config = NicConfig {
        rx_descriptors: 4096,
        tx_descriptors: 16,
        ..server_config(1)
    };
    let provisioned = provision_server(port.clone(), &config).unwrap();
    assert_eq!(provisioned.rx_descriptors, 512);
    assert_eq!(provisioned.tx_descriptors, 128);
    assert_eq!(port.descriptors(), Some((512, 128)));
}

#[test]
fn test_configure_failure_is_fatal() {
    let port = Arc::new(MemoryPort::builder().fail_configure().build());
    let err = provision_server(port.clone(), &server_config(2)).err().unwrap();
    assert!(matches!(err, DeviceError::Configure { queues: 2, .. }));
    assert!(!port.is_started());
}

#[test]
fn test_descriptor_failure_is_fatal() {
    let port = Arc::new(MemoryPort::builder().fail_descriptors().build());
    let err = provision_server(port, &server_config(1)).err().unwrap();
    assert!(matches!(err, DeviceError::Descriptors { .. }));
}

#[test]
fn test_queue_setup_failure_skips_only_that_queue() {
    let port = Arc::new(MemoryPort::builder().fail_rx_queue(1).build());
    let provisioned = provision_server(port.clone(), &server_config(3)).unwrap();

    let queues: Vec<u16> = provisioned.queues.iter().map(|q| q.queue).collect();
    assert_eq!(queues, vec![0, 2]);
    assert!(port.is_started());

    assert!(matches!(
        check_fleet(provisioned.queue_count(), 3, true),
        Err(ConfigError::PartialFleet {
            provisioned: 2,
            requested: 3
        })
    ));
    assert!(check_fleet(provisioned.queue_count(), 3, false).is_ok());
}

#[test]
fn test_start_failure_is_fatal() {
    let port = Arc::new(MemoryPort::builder().fail_start().build());
    let err = provision_server(port, &server_config(1)).err().unwrap();
    assert!(matches!(err, DeviceError::Start { port: 0, .. }));
}

// =============================================================================
// CLIENT MODE
// =============================================================================

#[test]
fn test_clients_get_private_pools() {
    let devices: Vec<Arc<dyn NicDevice>> = (0..3)
        .map(|id| Arc::new(MemoryPort::builder().port_id(id).build()) as Arc<dyn NicDevice>)
        .collect();
    let ports = provision_clients(devices, &server_config(3)).unwrap();

    assert_eq!(ports.len(), 3);
    assert_eq!(ports[0].pool.capacity(), 8192);
    assert!(!Arc::ptr_eq(&ports[0].pool, &ports[1].pool));
    assert!(ports.iter().all(|p| p.queue_count() == 1));
}

#[test]
fn test_client_pool_failure_skips_port() {
    let devices: Vec<Arc<dyn NicDevice>> = vec![
        Arc::new(MemoryPort::builder().port_id(0).build()),
        Arc::new(MemoryPort::builder().port_id(1).fail_pool().build()),
        Arc::new(MemoryPort::builder().port_id(2).build()),
    ];
    let ports = provision_clients(devices, &server_config(3)).unwrap();
    let ids: Vec<u16> = ports.iter().map(|p| p.device.port_id()).collect();
    assert_eq!(ids, vec![0, 2]);
}

#[test]
fn test_all_client_ports_failing_is_an_error() {
    let devices: Vec<Arc<dyn NicDevice>> =
        vec![Arc::new(MemoryPort::builder().fail_pool().build())];
    assert!(matches!(
        provision_clients(devices, &server_config(1)),
        Err(DeviceError::NoPorts)
    ));
}

// =============================================================================
// WORKER / QUEUE MATCHING
// =============================================================================

#[test]
fn test_workers_must_match_queues() {
    assert!(check_workers_match_queues(4, 4).is_ok());
    assert!(matches!(
        check_workers_match_queues(3, 4),
        Err(ConfigError::WorkerQueueMismatch {
            workers: 3,
            queues: 4
        })
    ));
}

// =============================================================================
// FLOW STEERING
// =============================================================================

#[test]
fn test_flow_rules_assign_bind_addresses_round_robin() {
    let port = Arc::new(MemoryPort::builder().build());
    provision_server(port.clone(), &server_config(5)).unwrap();
    let binds = [ip("10.0.0.1"), ip("10.0.0.2")];

    let rules = install_flow_rules(port.as_ref(), 5, &binds);
    assert_eq!(rules.len(), 5);
    for rule in &rules {
        assert_eq!(rule.dst, binds[rule.queue as usize % binds.len()]);
    }
    assert_eq!(port.flows(), rules);
}

#[test]
fn test_flow_validation_failure_skips_rule() {
    let port = Arc::new(MemoryPort::builder().reject_flow(1).fail_flow_creation(2).build());
    provision_server(port.clone(), &server_config(4)).unwrap();

    let rules = install_flow_rules(port.as_ref(), 4, &[ip("10.0.0.1")]);
    let queues: Vec<u16> = rules.iter().map(|r| r.queue).collect();
    assert_eq!(queues, vec![0, 3]);
    assert_eq!(port.flows().len(), 2);
}

#[test]
fn test_no_bind_addresses_installs_nothing() {
    let port = Arc::new(MemoryPort::builder().build());
    provision_server(port.clone(), &server_config(2)).unwrap();
    assert!(install_flow_rules(port.as_ref(), 2, &[]).is_empty());
    assert_eq!(bind_address_for(3, &[]), None);
}

#[test]
fn test_installed_rules_steer_frames() {
    let port = Arc::new(MemoryPort::builder().build());
    provision_server(port.clone(), &server_config(2)).unwrap();
    install_flow_rules(port.as_ref(), 2, &[ip("10.0.0.1"), ip("10.0.0.2")]);

    let header = FrameHeader {
        src_mac: [2, 0, 0, 0, 0, 9],
        dst_mac: port.mac_addr(),
        src: "10.0.9.9:5000".parse().unwrap(),
        dst: "10.0.0.2:4433".parse().unwrap(),
        ecn: Ecn::NotEct,
    };
    let mut frame = vec![0u8; 128];
    let len = build_udp_frame(&mut frame, &header, b"hi").unwrap();
    frame.truncate(len);

    assert_eq!(port.inject_steered(frame), 1);
    assert_eq!(port.pending_rx(1), 1);
    assert!(FlowRule {
        dst: ip("10.0.0.2"),
        queue: 1
    }
    .matches(ip("10.0.0.2")));
}

// =============================================================================
// DESCRIPTORS / STAGING
// =============================================================================

#[test]
fn test_desc_limits_clamp() {
    let lim = DescLimits {
        min: 64,
        max: 4096,
        align: 32,
    };
    assert_eq!(lim.clamp(10), 64);
    assert_eq!(lim.clamp(1000), 1024);
    assert_eq!(lim.clamp(1024), 1024);
    assert_eq!(lim.clamp(u16::MAX), 4096);

    let odd = DescLimits {
        min: 1,
        max: 100,
        align: 32,
    };
    assert_eq!(odd.clamp(99), 96);
}

#[test]
fn test_staging_flushes_when_full() {
    let port = MemoryPort::builder().build();
    let pool = PacketPool::new("stage", 8, 64).unwrap();
    port.setup_tx_queue(0, 64).unwrap();

    let mut staging = TxStaging::with_burst(2).unwrap();
    for _ in 0..3 {
        let mut buf = pool.acquire().unwrap();
        buf.fill_from(b"frame");
        assert_eq!(staging.push(&port, 0, buf), 0);
    }
    // Two frames went out when the third was staged.
    assert_eq!(port.transmitted(0).len(), 2);
    assert_eq!(staging.len(), 1);

    assert_eq!(staging.flush(&port, 0), (1, 0));
    assert_eq!(port.transmitted(0).len(), 3);
    assert_eq!(pool.available(), 8);
}
