use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use carrier::{
    CarrierConfig, CarrierError, Codec, ConnectionId, ConnectionState, Datagram, DatagramFlags,
    DatagramHeader, DisconnectReason, HeartbeatConfig, HeartbeatThread, InterfaceEvent, Message,
    MessageFlags, NetworkInterface, PROTOCOL_VERSION, PacketLossSimulation, Reliability,
    SYSTEM_CHANNEL, SimulatedDriver, SocketDriver, SystemMessage, UdpDriver,
};

struct Peer<D: SocketDriver = UdpDriver> {
    interface: NetworkInterface<D>,
    events: Vec<InterfaceEvent>,
}

impl<D: SocketDriver> Peer<D> {
    fn new(interface: NetworkInterface<D>) -> Self {
        Self {
            interface,
            events: Vec::new(),
        }
    }

    fn update(&mut self) {
        self.interface.update();
        self.events.extend(self.interface.drain_events());
    }

    fn addr(&self) -> SocketAddr {
        self.interface.local_addr()
    }

    fn connected_id(&self) -> Option<ConnectionId> {
        self.events.iter().find_map(|event| match event {
            InterfaceEvent::Connected { id, .. } => Some(*id),
            _ => None,
        })
    }

    fn messages(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                InterfaceEvent::Message { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.events.iter().find_map(|event| match event {
            InterfaceEvent::Disconnected { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    fn failure_reason(&self) -> Option<DisconnectReason> {
        self.events.iter().find_map(|event| match event {
            InterfaceEvent::ConnectionFailed { reason, .. } => Some(*reason),
            _ => None,
        })
    }
}

/// A bare socket that speaks the handshake by hand.
struct RawPeer {
    driver: UdpDriver,
    codec: Codec,
    sequence: u16,
    received: Vec<SystemMessage>,
}

impl RawPeer {
    fn bind() -> Self {
        Self {
            driver: UdpDriver::bind("127.0.0.1:0", &Default::default()).unwrap(),
            codec: Codec::default(),
            sequence: 0,
            received: Vec::new(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.driver.local_addr()
    }

    fn send_at(&mut self, to: SocketAddr, sequence: u16, message: &SystemMessage) {
        let mut datagram = Datagram::new(DatagramHeader::new(sequence, DatagramFlags::CONNECTING));
        let mut message = Message::new(SYSTEM_CHANNEL, MessageFlags::empty(), message.encode().unwrap());
        message.sequence = sequence;
        datagram.messages.push(message);
        let bytes = self.codec.encode(&datagram).unwrap();
        self.driver.send_to(&bytes, to).unwrap();
    }

    fn send(&mut self, to: SocketAddr, message: &SystemMessage) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.send_at(to, sequence, message);
    }

    fn receive(&mut self) {
        let mut buf = [0u8; 2048];
        while let Some((size, _)) = self.driver.recv_from(&mut buf).unwrap() {
            let Ok(datagram) = self.codec.decode(&buf[..size]) else {
                continue;
            };
            self.received.extend(
                datagram
                    .messages
                    .iter()
                    .filter(|m| m.channel == SYSTEM_CHANNEL)
                    .filter_map(|m| SystemMessage::decode(&m.payload).ok()),
            );
        }
    }

    fn find<T>(&self, pick: impl Fn(&SystemMessage) -> Option<T>) -> Option<T> {
        self.received.iter().find_map(pick)
    }
}

/// Updates `peer` and drains `raw` until `done` holds or `timeout` passes.
fn pump_raw<D: SocketDriver>(
    peer: &mut Peer<D>,
    raw: &mut RawPeer,
    timeout: Duration,
    done: impl Fn(&Peer<D>, &RawPeer) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        peer.update();
        raw.receive();
        if done(peer, raw) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn test_config() -> CarrierConfig {
    CarrierConfig {
        connection_timeout_ms: 1000,
        heartbeat_interval_ms: 100,
        disconnect_linger_ms: 100,
        ..Default::default()
    }
}

fn bind(config: CarrierConfig) -> Peer {
    Peer::new(NetworkInterface::bind("127.0.0.1:0", config).unwrap())
}

fn bind_lossy(config: CarrierConfig, loss_percent: f32, seed: u64) -> Peer<SimulatedDriver<UdpDriver>> {
    let driver = UdpDriver::bind("127.0.0.1:0", &config.driver).unwrap();
    let simulation = PacketLossSimulation {
        enabled: true,
        loss_percent,
        ..Default::default()
    };
    let driver = SimulatedDriver::with_seed(driver, simulation, seed);
    Peer::new(NetworkInterface::with_driver(driver, config).unwrap())
}

fn pump_until<A: SocketDriver, B: SocketDriver>(
    a: &mut Peer<A>,
    b: &mut Peer<B>,
    timeout: Duration,
    done: impl Fn(&Peer<A>, &Peer<B>) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        a.update();
        b.update();
        if done(a, b) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn handshake<A: SocketDriver, B: SocketDriver>(
    client: &mut Peer<A>,
    server: &mut Peer<B>,
) -> (ConnectionId, ConnectionId) {
    client.interface.connect(server.addr()).unwrap();
    assert!(
        pump_until(client, server, Duration::from_secs(10), |c, s| {
            c.connected_id().is_some() && s.connected_id().is_some()
        }),
        "handshake did not complete"
    );
    (client.connected_id().unwrap(), server.connected_id().unwrap())
}

#[test]
fn test_handshake_connects_both_sides() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());

    let (client_side, server_side) = handshake(&mut client, &mut server);

    assert!(matches!(
        server.events[0],
        InterfaceEvent::IncomingConnection { id, addr } if id == server_side && addr == client.addr()
    ));
    assert_eq!(server.interface.connected_count(), 1);
    assert_eq!(client.interface.connected_count(), 1);

    let connection = client.interface.connection(client_side).unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.addr(), server.addr());

    // The acceptance may have been overtaken by another datagram; wait for it.
    assert!(pump_until(&mut client, &mut server, Duration::from_secs(2), |c, _| {
        c.interface.connection(client_side).and_then(|c| c.remote_id()) == Some(server_side.0)
    }));
}

#[test]
fn test_reliable_messages_arrive_in_order() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    let (client_side, _) = handshake(&mut client, &mut server);

    let sent: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_le_bytes().to_vec()).collect();
    for payload in &sent {
        client
            .interface
            .send(client_side, 0, payload, Reliability::Reliable)
            .unwrap();
    }

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |_, s| {
        s.messages().len() >= sent.len()
    }));
    assert_eq!(server.messages(), sent);
}

#[test]
fn test_large_reliable_message_is_chunked() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    let (_, server_side) = handshake(&mut client, &mut server);

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    server
        .interface
        .send(server_side, 2, &payload, Reliability::Reliable)
        .unwrap();

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, _| {
        !c.messages().is_empty()
    }));
    assert_eq!(client.messages(), vec![payload]);
    assert!(matches!(
        client.events.last(),
        Some(InterfaceEvent::Message { channel: 2, .. })
    ));
}

#[test]
fn test_send_validation() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());

    let pending = client.interface.connect(server.addr()).unwrap();
    assert!(matches!(
        client.interface.send(pending, 0, b"early", Reliability::Reliable),
        Err(CarrierError::NotConnected {
            state: ConnectionState::Connecting,
            ..
        })
    ));
    assert!(matches!(
        client.interface.connect(server.addr()),
        Err(CarrierError::AlreadyConnected(_))
    ));

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, _| {
        c.connected_id().is_some()
    }));

    assert!(matches!(
        client.interface.send(pending, 3, b"system", Reliability::Reliable),
        Err(CarrierError::InvalidChannel(3))
    ));
    assert!(matches!(
        client.interface.send(ConnectionId(999), 0, b"nobody", Reliability::Reliable),
        Err(CarrierError::UnknownConnection(_))
    ));
    assert!(matches!(
        client.interface.send(pending, 0, &[0; 2000], Reliability::Unreliable),
        Err(CarrierError::PayloadTooLarge { .. })
    ));
}

#[test]
fn test_server_full_denies_connection() {
    let mut server = bind(CarrierConfig {
        max_connections: 1,
        ..test_config()
    });
    let mut first = bind(test_config());
    let mut second = bind(test_config());

    handshake(&mut first, &mut server);

    second.interface.connect(server.addr()).unwrap();
    assert!(pump_until(&mut second, &mut server, Duration::from_secs(5), |c, _| {
        c.failure_reason().is_some()
    }));

    assert_eq!(second.failure_reason(), Some(DisconnectReason::ServerFull));
    assert_eq!(second.interface.connections().count(), 0);
    assert_eq!(server.interface.connected_count(), 1);
}

#[test]
fn test_version_mismatch_denied() {
    let mut server = bind(test_config());
    let mut client = bind(CarrierConfig {
        protocol_version: 99,
        ..test_config()
    });

    client.interface.connect(server.addr()).unwrap();
    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, _| {
        c.failure_reason().is_some()
    }));

    assert_eq!(client.failure_reason(), Some(DisconnectReason::VersionMismatch));
    assert_eq!(server.interface.connections().count(), 0);
}

#[test]
fn test_handshake_times_out_without_server() {
    let silent = UdpDriver::bind("127.0.0.1:0", &Default::default()).unwrap();
    let mut client = bind(CarrierConfig {
        handshake_timeout_ms: 300,
        ..test_config()
    });

    let id = client.interface.connect(silent.local_addr()).unwrap();
    let start = Instant::now();
    while client.failure_reason().is_none() && start.elapsed() < Duration::from_secs(3) {
        client.update();
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client.failure_reason(), Some(DisconnectReason::HandshakeTimeout));
    assert!(client.interface.connection(id).is_none());
    let retries = client.interface.stats().datagrams_sent;
    assert!(retries >= 2, "expected handshake retries, sent {}", retries);
}

#[test]
fn test_graceful_disconnect() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    let (client_side, _) = handshake(&mut client, &mut server);

    client
        .interface
        .disconnect(client_side, DisconnectReason::UserRequested)
        .unwrap();
    assert_eq!(
        client.interface.connection(client_side).map(|c| c.state()),
        Some(ConnectionState::Disconnecting)
    );

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, s| {
        c.disconnect_reason().is_some() && s.disconnect_reason().is_some()
    }));

    assert_eq!(server.disconnect_reason(), Some(DisconnectReason::UserRequested));
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::UserRequested));
    assert_eq!(client.interface.connections().count(), 0);
    assert_eq!(server.interface.connections().count(), 0);
}

#[test]
fn test_shutdown_notifies_peers() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    handshake(&mut client, &mut server);

    server.interface.shutdown();

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, _| {
        c.disconnect_reason().is_some()
    }));
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::ShuttingDown));
}

#[test]
fn test_silent_peer_times_out() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    handshake(&mut client, &mut server);

    drop(server);

    let start = Instant::now();
    while client.disconnect_reason().is_none() && start.elapsed() < Duration::from_secs(5) {
        client.update();
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::BadConnection));
    assert_eq!(client.interface.connections().count(), 0);
}

#[test]
fn test_keep_alives_hold_idle_connection() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    handshake(&mut client, &mut server);

    // Three connection timeouts with nothing to say.
    let held = pump_until(&mut client, &mut server, Duration::from_secs(3), |c, s| {
        c.disconnect_reason().is_some() || s.disconnect_reason().is_some()
    });

    assert!(!held, "idle connection dropped");
    assert_eq!(client.interface.connected_count(), 1);
    assert_eq!(server.interface.connected_count(), 1);
}

#[test]
fn test_heartbeat_keeps_stalled_interface_alive() {
    let server = NetworkInterface::bind("127.0.0.1:0", test_config()).unwrap();
    let server_addr = server.local_addr();
    let server = Arc::new(Mutex::new(server));
    let mut client = bind(test_config());

    let mut heartbeat = HeartbeatThread::spawn(HeartbeatConfig {
        poll_interval_ms: 10,
        stall_threshold_ms: 50,
    })
    .unwrap();
    heartbeat.register(&server);

    // The server's main loop never runs during the handshake or after it.
    client.interface.connect(server_addr).unwrap();
    let start = Instant::now();
    while client.connected_id().is_none() && start.elapsed() < Duration::from_secs(5) {
        client.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(client.connected_id().is_some());

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(2500) {
        client.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.disconnect_reason(), None);

    let mut server = server.lock().unwrap();
    server.update();
    let events: Vec<InterfaceEvent> = server.drain_events().collect();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, InterfaceEvent::Disconnected { .. })),
        "server dropped the client: {:?}",
        events
    );
    assert_eq!(server.connected_count(), 1);
    drop(server);

    heartbeat.stop();
}

#[test]
fn test_reliable_delivery_under_packet_loss() {
    let config = CarrierConfig {
        handshake_timeout_ms: 10_000,
        connection_timeout_ms: 5000,
        ..test_config()
    };
    let mut server = bind_lossy(config.clone(), 20.0, 1);
    let mut client = bind_lossy(config, 20.0, 2);
    let (client_side, _) = handshake(&mut client, &mut server);

    let sent: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; 100]).collect();
    for payload in &sent {
        client
            .interface
            .send(client_side, 1, payload, Reliability::Reliable)
            .unwrap();
    }

    assert!(
        pump_until(&mut client, &mut server, Duration::from_secs(15), |_, s| {
            s.messages().len() >= sent.len()
        }),
        "only {} of {} messages arrived",
        server.messages().len(),
        sent.len()
    );
    assert_eq!(server.messages(), sent);
    assert!(client.interface.driver().dropped() > 0);
}

#[test]
fn test_broadcast_reaches_every_peer() {
    let mut server = bind(test_config());
    let mut first = bind(test_config());
    let mut second = bind(test_config());
    handshake(&mut first, &mut server);
    handshake(&mut second, &mut server);

    let count = server
        .interface
        .broadcast(0, b"to everyone", Reliability::Reliable)
        .unwrap();
    assert_eq!(count, 2);

    assert!(pump_until(&mut first, &mut server, Duration::from_secs(5), |c, _| {
        !c.messages().is_empty()
    }));
    assert!(pump_until(&mut second, &mut server, Duration::from_secs(5), |c, _| {
        !c.messages().is_empty()
    }));
    assert_eq!(first.messages(), vec![b"to everyone".to_vec()]);
    assert_eq!(second.messages(), vec![b"to everyone".to_vec()]);
}

#[test]
fn test_compressed_datagrams() {
    let config = CarrierConfig {
        compression: true,
        ..test_config()
    };
    let mut server = bind(config.clone());
    let mut client = bind(config);
    let (client_side, _) = handshake(&mut client, &mut server);

    let payload = vec![b'a'; 1000];
    client
        .interface
        .send(client_side, 0, &payload, Reliability::Unreliable)
        .unwrap();

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |_, s| {
        !s.messages().is_empty()
    }));
    assert_eq!(server.messages(), vec![payload]);
}

#[test]
fn test_unknown_peer_ignored() {
    let mut server = bind(test_config());
    let mut stranger = UdpDriver::bind("127.0.0.1:0", &Default::default()).unwrap();

    let mut datagram = Datagram::new(DatagramHeader::new(0, DatagramFlags::empty()));
    datagram
        .messages
        .push(Message::new(0, MessageFlags::RELIABLE, b"let me in".to_vec()));
    let bytes = Codec::default().encode(&datagram).unwrap();

    stranger.send_to(&bytes, server.addr()).unwrap();
    stranger.send_to(b"\x07garbage", server.addr()).unwrap();

    for _ in 0..50 {
        server.update();
        thread::sleep(Duration::from_millis(2));
    }

    assert!(server.events.is_empty(), "unexpected events: {:?}", server.events);
    assert_eq!(server.interface.connections().count(), 0);
}

#[test]
fn test_bad_packets_disconnect_peer() {
    let config = CarrierConfig {
        bad_packet_limit: 3,
        ..test_config()
    };
    let mut server = bind(config.clone());
    let mut client = bind(config);
    handshake(&mut client, &mut server);

    let server_addr = server.addr();
    for _ in 0..5 {
        client
            .interface
            .driver_mut()
            .send_to(b"\x09not a datagram", server_addr)
            .unwrap();
    }

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(5), |c, s| {
        c.disconnect_reason().is_some() && s.disconnect_reason().is_some()
    }));
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::BadPackets));
    assert_eq!(server.disconnect_reason(), Some(DisconnectReason::BadPackets));
    assert!(server.interface.stats().bad_packets > 3);
}

#[test]
fn test_denial_after_challenge_fails_handshake() {
    let mut client = bind(test_config());
    let mut raw = RawPeer::bind();
    let raw_addr = raw.addr();

    let id = client.interface.connect(raw_addr).unwrap();
    let request = |m: &SystemMessage| match m {
        SystemMessage::ConnectRequest { salt, .. } => Some(*salt),
        _ => None,
    };
    assert!(pump_raw(&mut client, &mut raw, Duration::from_secs(2), |_, r| {
        r.find(request).is_some()
    }));
    let client_salt = raw.find(request).unwrap();

    raw.send(
        client.addr(),
        &SystemMessage::ConnectChallenge {
            server_salt: 7,
            challenge: client_salt,
        },
    );
    let response = |m: &SystemMessage| match m {
        SystemMessage::ChallengeResponse { combined_salt } => Some(*combined_salt),
        _ => None,
    };
    assert!(pump_raw(&mut client, &mut raw, Duration::from_secs(2), |_, r| {
        r.find(response).is_some()
    }));
    assert_eq!(raw.find(response), Some(client_salt ^ 7));

    // Denials carry sequence 0 like the challenge before them.
    raw.send_at(
        client.addr(),
        0,
        &SystemMessage::ConnectDenied {
            reason: DisconnectReason::HandshakeRejected,
        },
    );
    assert!(pump_raw(&mut client, &mut raw, Duration::from_secs(3), |c, _| {
        c.failure_reason().is_some()
    }));
    assert_eq!(client.failure_reason(), Some(DisconnectReason::HandshakeRejected));
    assert!(client.interface.connection(id).is_none());
}

#[test]
fn test_wrong_challenge_response_rejected() {
    let mut server = bind(test_config());
    let mut raw = RawPeer::bind();
    let server_addr = server.addr();

    raw.send(
        server_addr,
        &SystemMessage::ConnectRequest {
            version: PROTOCOL_VERSION,
            salt: 5,
        },
    );
    let challenge = |m: &SystemMessage| match m {
        SystemMessage::ConnectChallenge {
            server_salt,
            challenge,
        } => Some((*server_salt, *challenge)),
        _ => None,
    };
    assert!(pump_raw(&mut server, &mut raw, Duration::from_secs(2), |_, r| {
        r.find(challenge).is_some()
    }));
    let (server_salt, echoed) = raw.find(challenge).unwrap();
    assert_eq!(echoed, 5);

    raw.send(
        server_addr,
        &SystemMessage::ChallengeResponse {
            combined_salt: server_salt ^ 5 ^ 1,
        },
    );
    let denial = |m: &SystemMessage| match m {
        SystemMessage::ConnectDenied { reason } => Some(*reason),
        _ => None,
    };
    assert!(pump_raw(&mut server, &mut raw, Duration::from_secs(2), |s, r| {
        s.failure_reason().is_some() && r.find(denial).is_some()
    }));

    assert_eq!(server.failure_reason(), Some(DisconnectReason::HandshakeRejected));
    assert_eq!(raw.find(denial), Some(DisconnectReason::HandshakeRejected));
    assert_eq!(server.interface.connections().count(), 0);
}

#[test]
fn test_new_endpoint_on_connected_address_denied() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    handshake(&mut client, &mut server);

    // Same address, fresh salt.
    let client_addr = client.addr();
    drop(client);
    let mut replacement = Peer::new(NetworkInterface::bind(client_addr, test_config()).unwrap());
    replacement.interface.connect(server.addr()).unwrap();

    assert!(pump_until(&mut replacement, &mut server, Duration::from_secs(3), |c, _| {
        c.failure_reason().is_some()
    }));
    assert_eq!(replacement.failure_reason(), Some(DisconnectReason::AlreadyConnected));
    assert_eq!(replacement.interface.connections().count(), 0);
    assert_eq!(server.interface.connected_count(), 1);
}

#[test]
fn test_disconnect_completes_after_linger_without_reply() {
    let mut server = bind(test_config());
    let mut client = bind(test_config());
    let (client_side, _) = handshake(&mut client, &mut server);
    drop(server);

    let start = Instant::now();
    client
        .interface
        .disconnect(client_side, DisconnectReason::UserRequested)
        .unwrap();
    while client.disconnect_reason().is_none() && start.elapsed() < Duration::from_secs(3) {
        client.update();
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::UserRequested));
    assert!(start.elapsed() >= test_config().disconnect_linger());
    assert!(client.interface.connection(client_side).is_none());
}

#[test]
fn test_clock_sync_estimates_offset() {
    let config = CarrierConfig {
        clock_sync_interval_ms: Some(50),
        ..test_config()
    };
    let mut server = bind(config.clone());
    let mut client = bind(config);
    let (client_side, server_side) = handshake(&mut client, &mut server);

    assert!(pump_until(&mut client, &mut server, Duration::from_secs(2), |c, s| {
        let synced = |peer: Option<&carrier::Connection>| {
            peer.and_then(|p| p.clock_offset_ms()).is_some()
        };
        synced(c.interface.connection(client_side)) && synced(s.interface.connection(server_side))
    }));

    // Both ends share a clock, so the estimate is within the round trip.
    for connection in [
        client.interface.connection(client_side).unwrap(),
        server.interface.connection(server_side).unwrap(),
    ] {
        let offset = connection.clock_offset_ms().unwrap();
        let bound = connection.rtt_ms() as i64 + 100;
        assert!(offset.abs() <= bound, "offset {}ms exceeds {}ms", offset, bound);
    }
}
