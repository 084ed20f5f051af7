//! End-to-end packet loop tests over loopback sockets and the in-memory NIC.

use quicloop::config::NetworkConfig;
use quicloop::demo::EchoEngine;
use quicloop::netio::{AddressFamily, Endpoint, NetIoConfig};
use quicloop::nic::frame::{build_udp_frame, parse_udp_frame, FrameHeader};
use quicloop::nic::{provision_server, MemoryPort, NicConfig, NicDevice};
use quicloop::worker::{
    spawn_nic_workers, spawn_socket_workers, LoopParams, NicQueueTransport, PacketLoop,
    SocketTransport, Transport, WorkerId,
};
use quicloop_x::{
    ConnectionRef, Ecn, LoopEvent, LoopSignal, NoCallback, ProtocolEngine, RecvInfo, SendOutcome,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn netio_config() -> NetIoConfig {
    NetIoConfig {
        max_wake_delay_us: 20_000,
        ..Default::default()
    }
}

fn loop_params(config: &NetIoConfig, gso: bool) -> LoopParams {
    LoopParams::new(0, config, 0, gso)
}

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn echo_factory(_worker: WorkerId) -> anyhow::Result<(EchoEngine, NoCallback)> {
    Ok((EchoEngine::default(), NoCallback))
}

// =============================================================================
// SOCKETS
// =============================================================================

#[test]
fn test_unspec_loop_terminates_cleanly_on_first_receive() {
    let config = netio_config();
    let transport = SocketTransport::open(0, AddressFamily::Unspec, &config).unwrap();
    let endpoints = transport.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints.iter().all(|ep| ep.local_port() != 0));
    let port = endpoints.get(0).unwrap().local_port();
    let params = loop_params(&config, transport.supports_gso());

    let worker = thread::spawn(move || {
        let mut engine = EchoEngine::default();
        let mut events = Vec::new();
        let mut callback = |event: LoopEvent| {
            events.push(event);
            match event {
                LoopEvent::AfterReceive { .. } => LoopSignal::Terminate,
                _ => LoopSignal::Continue,
            }
        };
        let result = PacketLoop::new(transport, &mut engine, &mut callback, params, running()).run();
        (result.map_err(|e| e.status_code()), events)
    });

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"ping", ("127.0.0.1", port)).unwrap();

    let (result, events) = worker.join().unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(events[0], LoopEvent::Ready);
    assert_eq!(
        events[1],
        LoopEvent::PortUpdate(SocketAddr::from(([127, 0, 0, 1], port)))
    );
    assert_eq!(events.last(), Some(&LoopEvent::AfterReceive { bytes: 4 }));
}

#[test]
fn test_socket_loop_echoes_datagrams() {
    let config = netio_config();
    let transport = SocketTransport::open(0, AddressFamily::V4, &config).unwrap();
    let port = transport.endpoints().get(0).unwrap().local_port();
    let params = loop_params(&config, transport.supports_gso());

    let worker = thread::spawn(move || {
        let mut engine = EchoEngine::default();
        let mut callback = |event: LoopEvent| match event {
            LoopEvent::AfterSend { bytes } if bytes > 0 => LoopSignal::Terminate,
            _ => LoopSignal::Continue,
        };
        PacketLoop::new(transport, &mut engine, &mut callback, params, running())
            .run()
            .map_err(|e| e.status_code())
    });

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.send_to(b"hello loop", ("127.0.0.1", port)).unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello loop");
    assert_eq!(from.port(), port);
    assert_eq!(worker.join().unwrap(), Ok(()));
}

/// Asks for a NAT rebinding on its first send phase.
#[derive(Default)]
struct RebindingEngine {
    requested: bool,
}

impl ProtocolEngine for RebindingEngine {
    fn next_wake_delay(&mut self, _now: Instant, _max_delay: Duration) -> Duration {
        Duration::ZERO
    }

    fn submit_received(
        &mut self,
        _payload: &[u8],
        _info: &RecvInfo,
        _now: Instant,
    ) -> Option<ConnectionRef> {
        None
    }

    fn prepare_next_to_send(&mut self, _now: Instant, _buf: &mut [u8]) -> SendOutcome {
        if self.requested {
            SendOutcome::Idle
        } else {
            self.requested = true;
            SendOutcome::Signal(LoopSignal::SimulateNat)
        }
    }
}

#[test]
fn test_nat_rebinding_moves_to_a_new_port() {
    let config = netio_config();
    let transport = SocketTransport::open(0, AddressFamily::V4, &config).unwrap();
    let params = loop_params(&config, transport.supports_gso());

    let mut engine = RebindingEngine::default();
    let mut ports = Vec::new();
    let mut callback = |event: LoopEvent| {
        if let LoopEvent::PortUpdate(addr) = event {
            ports.push(addr.port());
            if ports.len() == 2 {
                return LoopSignal::Terminate;
            }
        }
        LoopSignal::Continue
    };

    let mut lp = PacketLoop::new(transport, &mut engine, &mut callback, params, running());
    assert!(lp.run().is_ok());
    assert_eq!(lp.transport().endpoints().len(), 1);
    assert_eq!(lp.transport().endpoints().open_count(), 0);
    drop(lp);

    assert_eq!(ports.len(), 2);
    assert_ne!(ports[0], ports[1]);
    assert!(ports.iter().all(|p| *p != 0));
}

#[test]
fn test_spawned_socket_workers_shut_down() {
    let network = NetworkConfig {
        port: 0,
        family: AddressFamily::V4,
        dest_if: 0,
    };
    let config = NetIoConfig {
        workers: 2,
        ..netio_config()
    };

    let handle = spawn_socket_workers(&network, &config, echo_factory).unwrap();
    assert_eq!(handle.worker_count(), 2);
    assert!(handle.registry().get(WorkerId(1)).unwrap().is_running());
    handle.shutdown();
}

#[test]
fn test_failed_spawn_stops_workers_already_running() {
    let port = UdpSocket::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port();
    let network = NetworkConfig {
        port,
        family: AddressFamily::V4,
        dest_if: 0,
    };
    let config = NetIoConfig {
        workers: 2,
        reuse_port: false,
        ..netio_config()
    };

    // Worker 1 cannot bind the port worker 0 already holds.
    let result = spawn_socket_workers(&network, &config, echo_factory);
    assert!(result.is_err());

    // Worker 0 was joined, so its socket is gone and the port is free again.
    let rebound = UdpSocket::bind(("0.0.0.0", port));
    assert!(rebound.is_ok());
}

// =============================================================================
// NIC QUEUES
// =============================================================================

fn nic_config(queues: u16) -> NicConfig {
    NicConfig {
        queues,
        local_ips: vec!["10.0.0.1".parse().unwrap()],
        spin_polls: 10,
        idle_sleep_us: 100,
        ..Default::default()
    }
}

fn udp_frame(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        src_mac: [0x02, 0, 0, 0, 0, 0x02],
        dst_mac: [0x02, 0, 0, 0, 0, 0x01],
        src: src.parse().unwrap(),
        dst: dst.parse().unwrap(),
        ecn: Ecn::Ect0,
    };
    let mut frame = vec![0u8; 128 + payload.len()];
    let len = build_udp_frame(&mut frame, &header, payload).unwrap();
    frame.truncate(len);
    frame
}

#[test]
fn test_nic_queue_loop_echoes_frames() {
    let port = Arc::new(MemoryPort::builder().build());
    let nic = nic_config(1);
    let netio = netio_config();
    let mut provisioned = provision_server(port.clone(), &nic).unwrap();
    let queue = provisioned.queues.remove(0);

    let transport =
        NicQueueTransport::open(queue, 4443, AddressFamily::V4, None, &nic, &netio).unwrap();
    let params = loop_params(&netio, transport.supports_gso());
    port.inject(0, udp_frame("10.0.0.2:5000", "10.0.0.1:4443", b"over the wire"));
    port.inject(0, udp_frame("10.0.0.2:5000", "10.0.0.1:9999", b"wrong port"));

    let mut engine = EchoEngine::default();
    let mut events = Vec::new();
    let mut callback = |event: LoopEvent| {
        events.push(event);
        match event {
            LoopEvent::AfterSend { bytes } if bytes > 0 => LoopSignal::Terminate,
            _ => LoopSignal::Continue,
        }
    };

    let result = PacketLoop::new(transport, &mut engine, &mut callback, params, running()).run();
    assert!(result.is_ok());
    assert_eq!(
        events[1],
        LoopEvent::PortUpdate(SocketAddr::from(([127, 0, 0, 1], 4443)))
    );
    assert_eq!(engine.echoed(), 1);

    let sent = port.transmitted(0);
    assert_eq!(sent.len(), 1);
    let parsed = parse_udp_frame(&sent[0]).unwrap();
    assert_eq!(parsed.src, "10.0.0.1:4443".parse().unwrap());
    assert_eq!(parsed.dst, "10.0.0.2:5000".parse().unwrap());
    assert_eq!(&sent[0][parsed.payload], b"over the wire");
}

#[test]
fn test_nic_workers_require_one_worker_per_queue() {
    let port = Arc::new(MemoryPort::builder().build());
    let nic = nic_config(2);
    let provisioned = provision_server(port, &nic).unwrap();
    let network = NetworkConfig::default();
    let netio = NetIoConfig {
        workers: 3,
        ..netio_config()
    };

    let err = spawn_nic_workers(vec![provisioned], &network, &netio, &nic, echo_factory)
        .err()
        .unwrap();
    assert!(err.to_string().contains("does not match queue count"));
}

#[test]
fn test_nic_workers_get_steering_addresses() {
    let port = Arc::new(MemoryPort::builder().build());
    let nic = NicConfig {
        flow_steering: true,
        bind_addresses: vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
        ..nic_config(2)
    };
    let device: Arc<dyn NicDevice> = port.clone();
    let provisioned = provision_server(device, &nic).unwrap();
    let network = NetworkConfig::default();
    let netio = NetIoConfig {
        workers: 2,
        ..netio_config()
    };

    let handle = spawn_nic_workers(vec![provisioned], &network, &netio, &nic, echo_factory).unwrap();
    let bound: Vec<_> = handle
        .registry()
        .assignments()
        .map(|a| (a.queue, a.bind_addr))
        .collect();
    assert_eq!(
        bound,
        vec![
            (0, Some("10.0.0.1".parse().unwrap())),
            (1, Some("10.0.0.2".parse().unwrap())),
        ]
    );
    handle.shutdown();
}
