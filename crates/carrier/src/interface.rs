use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::channel::Reliability;
use crate::codec::{Codec, CodecError};
use crate::config::CarrierConfig;
use crate::connection::{Connection, ConnectionId, ConnectionManager, ConnectionState, Role};
use crate::driver::{SocketDriver, UdpDriver};
use crate::error::{CarrierError, DisconnectReason};
use crate::protocol::{
    Datagram, DatagramFlags, DatagramHeader, Message, MessageFlags, SYSTEM_CHANNEL,
    SystemMessage,
};
use crate::stats::TrafficStats;

#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceEvent {
    IncomingConnection {
        id: ConnectionId,
        addr: SocketAddr,
    },
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
    },
    ConnectionFailed {
        id: ConnectionId,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Disconnected {
        id: ConnectionId,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Message {
        id: ConnectionId,
        channel: u8,
        payload: Vec<u8>,
    },
    Error {
        message: String,
    },
}

/// Owns one socket driver and every connection that shares it.
///
/// Nothing happens on the wire until [`update`](Self::update) runs: it
/// drains the socket, drives the handshake and the timers, resends lost
/// reliable messages and flushes what is queued. Results surface through
/// [`drain_events`](Self::drain_events).
pub struct NetworkInterface<D: SocketDriver = UdpDriver> {
    driver: D,
    codec: Codec,
    config: CarrierConfig,
    connections: ConnectionManager,
    events: VecDeque<InterfaceEvent>,
    recv_buffer: Vec<u8>,
    departed: TrafficStats,
    last_update: Instant,
}

impl NetworkInterface<UdpDriver> {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: CarrierConfig) -> Result<Self, CarrierError> {
        config.validate()?;
        let driver = UdpDriver::bind(addr, &config.driver)?;
        Self::with_driver(driver, config)
    }
}

impl<D: SocketDriver> NetworkInterface<D> {
    pub fn with_driver(driver: D, config: CarrierConfig) -> Result<Self, CarrierError> {
        config.validate()?;

        let max_datagram_size = config.driver.max_datagram_size;
        let codec = Codec::new(max_datagram_size).with_compression(config.compression);
        info!(
            "network interface listening on {} (max {} connections)",
            driver.local_addr(),
            config.max_connections
        );

        Ok(Self {
            driver,
            codec,
            connections: ConnectionManager::new(config.max_connections),
            events: VecDeque::new(),
            recv_buffer: vec![0u8; max_datagram_size],
            departed: TrafficStats::default(),
            last_update: Instant::now(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.driver.local_addr()
    }

    pub fn config(&self) -> &CarrierConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_by_addr(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get_by_addr(addr)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.connected_count()
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Lifetime totals across current and departed connections.
    pub fn stats(&self) -> TrafficStats {
        let mut total = self.departed;
        for connection in self.connections.iter() {
            total.merge(&connection.stats().lifetime);
        }
        total
    }

    pub fn last_second_stats(&self) -> TrafficStats {
        let mut total = TrafficStats::default();
        for connection in self.connections.iter() {
            total.merge(&connection.stats().last_second);
        }
        total
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = InterfaceEvent> + '_ {
        self.events.drain(..)
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, CarrierError> {
        self.connect_at(addr, Instant::now())
    }

    pub fn connect_at(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<ConnectionId, CarrierError> {
        let config = &self.config;
        let id = self
            .connections
            .insert_with(addr, |id| Connection::new_outgoing(id, addr, config, now))?;

        let queued = match self.connections.get_mut(id) {
            Some(connection) => {
                let request = SystemMessage::ConnectRequest {
                    version: config.protocol_version,
                    salt: connection.local_salt(),
                };
                connection.schedule_handshake_retry(
                    now,
                    config.handshake_retry_base(),
                    config.handshake_retry_max(),
                );
                connection.queue_system(&request, Reliability::Unreliable)
            }
            None => Err(CarrierError::UnknownConnection(id)),
        };
        if let Err(e) = queued {
            self.connections.remove(id);
            return Err(e);
        }

        info!("connecting to {} as {}", addr, id);
        Ok(id)
    }

    pub fn disconnect(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), CarrierError> {
        self.disconnect_at(id, reason, Instant::now())
    }

    /// Sends `Disconnect` and lingers so it can be resent; the connection is
    /// torn down by a later update. A connection still waiting for its
    /// first reply is dropped at once.
    pub fn disconnect_at(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
        now: Instant,
    ) -> Result<(), CarrierError> {
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(CarrierError::UnknownConnection(id))?;

        match connection.state() {
            ConnectionState::Connecting => {
                let addr = connection.addr();
                self.remove_connection(id);
                info!("{} to {} abandoned: {}", id, addr, reason);
                self.events
                    .push_back(InterfaceEvent::Disconnected { id, addr, reason });
            }
            ConnectionState::Handshake | ConnectionState::Connected => {
                connection.set_disconnect_reason(reason);
                connection.queue_system(&SystemMessage::Disconnect { reason }, Reliability::Reliable)?;
                connection.transition(ConnectionState::Disconnecting, now)?;
                info!("disconnecting {} ({}): {}", id, connection.addr(), reason);
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
        Ok(())
    }

    pub fn send(
        &mut self,
        id: ConnectionId,
        channel: u8,
        payload: &[u8],
        reliability: Reliability,
    ) -> Result<(), CarrierError> {
        if channel >= SYSTEM_CHANNEL {
            return Err(CarrierError::InvalidChannel(channel));
        }
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(CarrierError::UnknownConnection(id))?;
        if !connection.is_established() {
            return Err(CarrierError::NotConnected {
                id,
                state: connection.state(),
            });
        }
        connection.queue_message(channel, payload, reliability)
    }

    /// Queues `payload` for every connected peer and returns how many that
    /// was.
    pub fn broadcast(
        &mut self,
        channel: u8,
        payload: &[u8],
        reliability: Reliability,
    ) -> Result<usize, CarrierError> {
        if channel >= SYSTEM_CHANNEL {
            return Err(CarrierError::InvalidChannel(channel));
        }
        let mut count = 0;
        for connection in self.connections.iter_mut() {
            if connection.is_established() {
                connection.queue_message(channel, payload, reliability)?;
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        self.last_update = now;

        self.receive(now);
        self.retry_handshakes(now);
        self.check_timeouts(now);
        self.resend_lost(now);
        self.sync_clocks(now);
        self.flush(now);
        self.send_keep_alives(now);

        for connection in self.connections.iter_mut() {
            connection.roll_stats(now);
        }
    }

    /// Keeps traffic flowing while the owner is not calling `update`.
    /// Returns the number of datagrams sent.
    pub(crate) fn pump(&mut self, now: Instant) -> usize {
        self.receive(now);
        self.resend_lost(now);
        self.flush(now) + self.send_keep_alives(now)
    }

    /// Disconnects every peer with `ShuttingDown` and flushes the notices.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        for id in self.connections.ids() {
            if let Err(e) = self.disconnect_at(id, DisconnectReason::ShuttingDown, now) {
                self.report(e);
            }
        }
        self.flush(now);
    }

    /// Sends a keep-alive to every connected peer we have not sent to for a
    /// heartbeat interval. Returns the number sent.
    pub fn send_keep_alives(&mut self, now: Instant) -> usize {
        let interval = self.config.heartbeat_interval();
        let budget = self.datagram_budget();
        let mut sent = 0;
        let mut failed = Vec::new();

        for connection in self.connections.iter_mut() {
            if !connection.needs_keep_alive(now, interval) {
                continue;
            }
            let datagram = connection.build_datagram(now, budget, DatagramFlags::KEEP_ALIVE);
            match transmit(&mut self.driver, &self.codec, connection, &datagram) {
                Ok(_) => sent += 1,
                Err(e) => failed.push((connection.id(), e)),
            }
        }

        self.drop_failed(failed);
        sent
    }

    fn datagram_budget(&self) -> usize {
        // One byte for the compression hint.
        self.codec.max_datagram_size().saturating_sub(1)
    }

    fn report(&mut self, error: CarrierError) {
        warn!("{}", error);
        self.events.push_back(InterfaceEvent::Error {
            message: error.to_string(),
        });
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        self.departed.merge(&connection.stats().lifetime);
        Some(connection)
    }

    fn receive(&mut self, now: Instant) {
        loop {
            let (size, addr) = match self.driver.recv_from(&mut self.recv_buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    self.report(CarrierError::Io(e));
                    break;
                }
            };
            let decoded = self.codec.decode(&self.recv_buffer[..size]);
            self.handle_datagram(addr, decoded, size, now);
        }
    }

    fn handle_datagram(
        &mut self,
        addr: SocketAddr,
        decoded: Result<Datagram, CodecError>,
        size: usize,
        now: Instant,
    ) {
        let Some(id) = self.connections.id_by_addr(&addr) else {
            match decoded {
                Ok(datagram) => self.handle_unknown(addr, datagram, size, now),
                Err(e) => debug!("ignoring undecodable datagram from {}: {}", addr, e),
            }
            return;
        };

        let datagram = match decoded {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("bad datagram from {} ({}): {}", id, addr, e);
                self.bad_packet(id, now);
                return;
            }
        };

        if let Some((_, salt)) = datagram.connect_request() {
            self.handle_repeated_request(id, addr, salt);
            return;
        }
        // Denials are sent without connection state and reuse sequence 0,
        // which the channels would take for a duplicate.
        if let Some(reason) = datagram.connect_denied() {
            self.handle_denial(id, reason);
            return;
        }

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let flags = datagram.header.flags();
        let delivered = match connection.on_datagram(datagram, size, now) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!("bad datagram from {} ({}): {}", id, addr, e);
                self.bad_packet(id, now);
                return;
            }
        };

        // The acceptor only stops flagging its datagrams once it has
        // accepted us, so this stands in for a lost `ConnectAccepted`.
        if connection.role() == Role::Initiator
            && connection.state() == ConnectionState::Handshake
            && !flags.contains(DatagramFlags::CONNECTING)
        {
            if let Err(e) = self.establish(id, now) {
                self.report(e);
            }
        }

        for (channel, payload) in delivered {
            if channel == SYSTEM_CHANNEL {
                match SystemMessage::decode(&payload) {
                    Ok(message) => {
                        if let Err(e) = self.handle_system(id, message, now) {
                            self.report(e);
                        }
                    }
                    Err(e) => {
                        warn!("bad system message from {}: {}", id, e);
                        self.bad_packet(id, now);
                    }
                }
                continue;
            }

            match self.connections.get(id) {
                Some(connection) if connection.is_established() => {
                    self.events.push_back(InterfaceEvent::Message {
                        id,
                        channel,
                        payload,
                    });
                }
                Some(connection) => {
                    debug!(
                        "dropping message on channel {} from {} while {}",
                        channel,
                        id,
                        connection.state()
                    );
                }
                None => break,
            }
        }

        self.check_bad_packets(id, now);
    }

    fn handle_unknown(&mut self, addr: SocketAddr, datagram: Datagram, size: usize, now: Instant) {
        let Some((version, salt)) = datagram.connect_request() else {
            debug!("ignoring datagram from unknown peer {}", addr);
            return;
        };

        if version != self.config.protocol_version {
            warn!(
                "rejecting {}: protocol version {} (expected {})",
                addr, version, self.config.protocol_version
            );
            self.deny(addr, DisconnectReason::VersionMismatch);
            return;
        }

        let config = &self.config;
        let id = match self
            .connections
            .insert_with(addr, |id| Connection::new_incoming(id, addr, salt, config, now))
        {
            Ok(id) => id,
            Err(CarrierError::ConnectionLimit(limit)) => {
                info!("rejecting {}: connection limit of {} reached", addr, limit);
                self.deny(addr, DisconnectReason::ServerFull);
                return;
            }
            Err(e) => {
                self.report(e);
                return;
            }
        };

        if let Err(e) = self.begin_challenge(id, datagram, size, now) {
            self.remove_connection(id);
            self.report(e);
            return;
        }

        info!("incoming connection {} from {}", id, addr);
        self.events
            .push_back(InterfaceEvent::IncomingConnection { id, addr });
    }

    fn begin_challenge(
        &mut self,
        id: ConnectionId,
        datagram: Datagram,
        size: usize,
        now: Instant,
    ) -> Result<(), CarrierError> {
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(CarrierError::UnknownConnection(id))?;

        // Record the request so our challenge acks it.
        connection.on_datagram(datagram, size, now)?;
        connection.transition(ConnectionState::Handshake, now)?;
        queue_challenge(connection)
    }

    /// A `ConnectRequest` from an address we already know: a retry of the
    /// handshake in progress, or a different endpoint reusing the address.
    fn handle_repeated_request(&mut self, id: ConnectionId, addr: SocketAddr, salt: u64) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };

        let same_peer =
            connection.role() == Role::Acceptor && connection.remote_salt() == Some(salt);
        if !same_peer {
            info!("rejecting {}: already connected as {}", addr, id);
            self.deny(addr, DisconnectReason::AlreadyConnected);
            return;
        }

        if connection.state() == ConnectionState::Handshake {
            debug!("resending challenge to {}", id);
            if let Err(e) = queue_challenge(connection) {
                self.report(e);
            }
        }
    }

    fn handle_system(
        &mut self,
        id: ConnectionId,
        message: SystemMessage,
        now: Instant,
    ) -> Result<(), CarrierError> {
        let Some(connection) = self.connections.get_mut(id) else {
            return Ok(());
        };
        let addr = connection.addr();

        match message {
            // Handled before the datagram reaches the channels.
            SystemMessage::ConnectRequest { .. } => {}
            SystemMessage::ConnectChallenge {
                server_salt,
                challenge,
            } => {
                if connection.role() != Role::Initiator
                    || connection.state() != ConnectionState::Connecting
                {
                    return Ok(());
                }
                if challenge != connection.local_salt() {
                    warn!("challenge from {} does not match our request", addr);
                    connection.record_bad_packet();
                    return Ok(());
                }

                connection.set_remote_salt(server_salt);
                connection.transition(ConnectionState::Handshake, now)?;
                queue_challenge_response(connection)?;
                debug!("answered challenge from {}", id);
            }
            SystemMessage::ChallengeResponse { combined_salt } => {
                if connection.role() != Role::Acceptor {
                    return Ok(());
                }
                match connection.state() {
                    ConnectionState::Handshake => {
                        if connection.combined_salt() != Some(combined_salt) {
                            warn!("invalid challenge response from {}", addr);
                            self.remove_connection(id);
                            self.deny(addr, DisconnectReason::HandshakeRejected);
                            self.events.push_back(InterfaceEvent::ConnectionFailed {
                                id,
                                addr,
                                reason: DisconnectReason::HandshakeRejected,
                            });
                            return Ok(());
                        }
                        connection.queue_system(
                            &SystemMessage::ConnectAccepted {
                                connection_id: id.0,
                            },
                            Reliability::Unreliable,
                        )?;
                        self.establish(id, now)?;
                    }
                    // Our acceptance was lost.
                    ConnectionState::Connected => {
                        connection.queue_system(
                            &SystemMessage::ConnectAccepted {
                                connection_id: id.0,
                            },
                            Reliability::Unreliable,
                        )?;
                    }
                    _ => {}
                }
            }
            SystemMessage::ConnectAccepted { connection_id } => {
                if connection.role() != Role::Initiator {
                    return Ok(());
                }
                connection.set_remote_id(connection_id);
                if connection.state().is_handshaking() {
                    self.establish(id, now)?;
                }
            }
            SystemMessage::ConnectDenied { reason } => self.handle_denial(id, reason),
            SystemMessage::Disconnect { reason } => {
                self.remove_connection(id);
                info!("{} ({}) disconnected: {}", id, addr, reason);
                self.events
                    .push_back(InterfaceEvent::Disconnected { id, addr, reason });
            }
            SystemMessage::ClockSync { time_ms } => {
                connection.update_clock_offset(time_ms, unix_millis());
            }
        }
        Ok(())
    }

    /// Ends our own handshake with `id`; a denial in any other state is
    /// ignored.
    fn handle_denial(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        if connection.role() != Role::Initiator || !connection.state().is_handshaking() {
            debug!("ignoring denial from {} while {}", id, connection.state());
            return;
        }

        let addr = connection.addr();
        self.remove_connection(id);
        info!("connection to {} denied: {}", addr, reason);
        self.events
            .push_back(InterfaceEvent::ConnectionFailed { id, addr, reason });
    }

    fn establish(&mut self, id: ConnectionId, now: Instant) -> Result<(), CarrierError> {
        let connection = self
            .connections
            .get_mut(id)
            .ok_or(CarrierError::UnknownConnection(id))?;
        connection.transition(ConnectionState::Connected, now)?;

        let addr = connection.addr();
        info!("{} connected to {}", id, addr);
        self.events
            .push_back(InterfaceEvent::Connected { id, addr });
        Ok(())
    }

    /// Answers without creating any connection state.
    fn deny(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        if let Err(e) = self.send_stateless(addr, &SystemMessage::ConnectDenied { reason }) {
            self.report(e);
        }
    }

    fn send_stateless(
        &mut self,
        addr: SocketAddr,
        message: &SystemMessage,
    ) -> Result<(), CarrierError> {
        let mut datagram = Datagram::new(DatagramHeader::new(0, DatagramFlags::CONNECTING));
        datagram.messages.push(Message::new(
            SYSTEM_CHANNEL,
            MessageFlags::empty(),
            message.encode()?,
        ));
        let bytes = self.codec.encode(&datagram)?;
        self.driver.send_to(&bytes, addr)?;
        Ok(())
    }

    fn bad_packet(&mut self, id: ConnectionId, now: Instant) {
        if let Some(connection) = self.connections.get_mut(id) {
            connection.record_bad_packet();
        }
        self.check_bad_packets(id, now);
    }

    fn check_bad_packets(&mut self, id: ConnectionId, now: Instant) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        if connection.bad_packets() <= self.config.bad_packet_limit
            || connection.state() == ConnectionState::Disconnecting
        {
            return;
        }

        warn!(
            "{} ({}) exceeded {} bad packets",
            id,
            connection.addr(),
            self.config.bad_packet_limit
        );
        if let Err(e) = self.disconnect_at(id, DisconnectReason::BadPackets, now) {
            self.report(e);
        }
    }

    fn retry_handshakes(&mut self, now: Instant) {
        let base = self.config.handshake_retry_base();
        let max = self.config.handshake_retry_max();
        let version = self.config.protocol_version;
        let mut errors = Vec::new();

        for connection in self.connections.iter_mut() {
            if connection.role() != Role::Initiator || !connection.handshake_retry_due(now) {
                continue;
            }

            let queued = match connection.state() {
                ConnectionState::Connecting => {
                    let request = SystemMessage::ConnectRequest {
                        version,
                        salt: connection.local_salt(),
                    };
                    connection.queue_system(&request, Reliability::Unreliable)
                }
                ConnectionState::Handshake => queue_challenge_response(connection),
                _ => continue,
            };
            if let Err(e) = queued {
                errors.push(e);
            }

            connection.schedule_handshake_retry(now, base, max);
            debug!(
                "retrying handshake with {} (attempt {})",
                connection.addr(),
                connection.handshake_retries()
            );
        }

        for e in errors {
            self.report(e);
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let handshake_timeout = self.config.handshake_timeout();
        let connection_timeout = self.config.connection_timeout();
        let linger = self.config.disconnect_linger();

        let mut failed = Vec::new();
        let mut closed = Vec::new();
        for connection in self.connections.iter() {
            let id = connection.id();
            if connection.handshake_expired(now, handshake_timeout) {
                failed.push(id);
            } else if connection.is_established()
                && connection.is_timed_out(now, connection_timeout)
            {
                closed.push((id, DisconnectReason::BadConnection));
            } else if connection.linger_expired(now, linger) {
                let reason = connection
                    .disconnect_reason()
                    .unwrap_or(DisconnectReason::UserRequested);
                closed.push((id, reason));
            }
        }

        for id in failed {
            if let Some(connection) = self.remove_connection(id) {
                let addr = connection.addr();
                info!("handshake with {} timed out", addr);
                self.events.push_back(InterfaceEvent::ConnectionFailed {
                    id,
                    addr,
                    reason: DisconnectReason::HandshakeTimeout,
                });
            }
        }

        for (id, reason) in closed {
            if let Some(connection) = self.remove_connection(id) {
                let addr = connection.addr();
                info!("{} ({}) closed: {}", id, addr, reason);
                self.events
                    .push_back(InterfaceEvent::Disconnected { id, addr, reason });
            }
        }
    }

    fn resend_lost(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            let lost = connection.collect_lost(now);
            if lost > 0 {
                debug!(
                    "{} lost {} datagrams, {} messages queued",
                    connection.id(),
                    lost,
                    connection.outgoing_len()
                );
            }
        }
    }

    fn sync_clocks(&mut self, now: Instant) {
        let Some(interval) = self.config.clock_sync_interval() else {
            return;
        };

        let mut errors = Vec::new();
        for connection in self.connections.iter_mut() {
            if !connection.clock_sync_due(now, interval) {
                continue;
            }
            let sync = SystemMessage::ClockSync {
                time_ms: unix_millis(),
            };
            if let Err(e) = connection.queue_system(&sync, Reliability::Unreliable) {
                errors.push(e);
            }
            connection.mark_clock_sync(now);
        }

        for e in errors {
            self.report(e);
        }
    }

    /// Sends everything queued, then a bare ack to peers owed one. Returns
    /// the number of datagrams sent.
    fn flush(&mut self, now: Instant) -> usize {
        let budget = self.datagram_budget();
        let mut sent = 0;
        let mut failed = Vec::new();

        for connection in self.connections.iter_mut() {
            let flags = if connection.state().is_handshaking() {
                DatagramFlags::CONNECTING
            } else {
                DatagramFlags::empty()
            };

            let mut result = Ok(());
            while connection.has_sendable() && result.is_ok() {
                let datagram = connection.build_datagram(now, budget, flags);
                result = transmit(&mut self.driver, &self.codec, connection, &datagram);
                sent += 1;
            }
            if result.is_ok() && connection.needs_ack() {
                let datagram = connection.build_datagram(now, budget, flags);
                result = transmit(&mut self.driver, &self.codec, connection, &datagram);
                sent += 1;
            }

            if let Err(e) = result {
                failed.push((connection.id(), e));
            }
        }

        self.drop_failed(failed);
        sent
    }

    fn drop_failed(&mut self, failed: Vec<(ConnectionId, CarrierError)>) {
        for (id, error) in failed {
            warn!("dropping {} after send failure: {}", id, error);
            if let Some(connection) = self.remove_connection(id) {
                self.events.push_back(InterfaceEvent::Disconnected {
                    id,
                    addr: connection.addr(),
                    reason: DisconnectReason::DriverError,
                });
            }
        }
    }
}

fn transmit<D: SocketDriver>(
    driver: &mut D,
    codec: &Codec,
    connection: &mut Connection,
    datagram: &Datagram,
) -> Result<(), CarrierError> {
    let bytes = codec.encode(datagram)?;
    driver.send_to(&bytes, connection.addr())?;
    connection.record_sent(bytes.len());
    Ok(())
}

fn queue_challenge(connection: &mut Connection) -> Result<(), CarrierError> {
    let Some(remote_salt) = connection.remote_salt() else {
        return Err(CarrierError::NotConnected {
            id: connection.id(),
            state: connection.state(),
        });
    };
    let challenge = SystemMessage::ConnectChallenge {
        server_salt: connection.local_salt(),
        challenge: remote_salt,
    };
    connection.queue_system(&challenge, Reliability::Unreliable)
}

fn queue_challenge_response(connection: &mut Connection) -> Result<(), CarrierError> {
    let Some(combined_salt) = connection.combined_salt() else {
        return Err(CarrierError::NotConnected {
            id: connection.id(),
            state: connection.state(),
        });
    };
    connection.queue_system(
        &SystemMessage::ChallengeResponse { combined_salt },
        Reliability::Unreliable,
    )
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
