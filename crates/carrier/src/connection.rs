use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::channel::{ChannelState, REORDER_WINDOW, Reliability};
use crate::config::CarrierConfig;
use crate::error::{CarrierError, DisconnectReason};
use crate::protocol::{
    CHANNEL_COUNT, DATAGRAM_OVERHEAD, Datagram, DatagramFlags, DatagramHeader, Message,
    SYSTEM_CHANNEL, SystemMessage, sequence_distance, sequence_greater_than,
};
use crate::stats::NetworkStats;
use crate::tracking::{AckTracker, ReceiveTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initiator has sent its connect request.
    Connecting,
    /// Challenge sent or received, waiting for the other side.
    Handshake,
    Connected,
    /// Disconnect sent, lingering so it can be delivered.
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshake | Connected | Disconnecting | Disconnected)
                | (Handshake, Connected | Disconnecting | Disconnected)
                | (Connected, Disconnecting | Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn is_established(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_handshaking(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Handshake)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshake => "handshake",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Default)]
struct HandshakeRetry {
    retries: u32,
    next_retry: Option<Instant>,
}

/// One remote endpoint sharing the interface's socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    role: Role,
    state: ConnectionState,
    local_salt: u64,
    remote_salt: Option<u64>,
    created: Instant,
    state_changed: Instant,
    last_receive: Instant,
    last_send: Instant,
    last_clock_sync: Option<Instant>,
    send_sequence: u16,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    channels: [ChannelState; CHANNEL_COUNT],
    /// Control traffic, always packed ahead of `outgoing`.
    system_outgoing: VecDeque<Message>,
    outgoing: VecDeque<Message>,
    max_message_payload: usize,
    max_in_flight: usize,
    ack_pending: bool,
    retry: HandshakeRetry,
    disconnect_reason: Option<DisconnectReason>,
    bad_packets: u32,
    clock_offset_ms: Option<i64>,
    remote_id: Option<u32>,
    stats: NetworkStats,
}

impl Connection {
    fn new(
        id: ConnectionId,
        addr: SocketAddr,
        role: Role,
        config: &CarrierConfig,
        now: Instant,
    ) -> Self {
        let ack_tracker = AckTracker::new(config.max_pending_datagrams).with_rto_bounds(
            Duration::from_millis(config.min_resend_ms),
            Duration::from_millis(config.max_resend_ms),
        );

        Self {
            id,
            addr,
            role,
            state: ConnectionState::Connecting,
            local_salt: rand::random(),
            remote_salt: None,
            created: now,
            state_changed: now,
            last_receive: now,
            last_send: now,
            last_clock_sync: None,
            send_sequence: 0,
            ack_tracker,
            receive_tracker: ReceiveTracker::new(),
            channels: std::array::from_fn(|channel| {
                ChannelState::new(channel as u8).with_max_chunk(config.max_message_payload)
            }),
            system_outgoing: VecDeque::new(),
            outgoing: VecDeque::new(),
            max_message_payload: config.max_message_payload,
            max_in_flight: config.max_in_flight_datagrams.max(1),
            ack_pending: false,
            retry: HandshakeRetry::default(),
            disconnect_reason: None,
            bad_packets: 0,
            clock_offset_ms: None,
            remote_id: None,
            stats: NetworkStats::default(),
        }
    }

    pub fn new_outgoing(
        id: ConnectionId,
        addr: SocketAddr,
        config: &CarrierConfig,
        now: Instant,
    ) -> Self {
        Self::new(id, addr, Role::Initiator, config, now)
    }

    pub fn new_incoming(
        id: ConnectionId,
        addr: SocketAddr,
        remote_salt: u64,
        config: &CarrierConfig,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(id, addr, Role::Acceptor, config, now);
        connection.remote_salt = Some(remote_salt);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn transition(&mut self, next: ConnectionState, now: Instant) -> Result<(), CarrierError> {
        if !self.state.can_transition_to(next) {
            return Err(CarrierError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.state_changed = now;
        Ok(())
    }

    pub fn local_salt(&self) -> u64 {
        self.local_salt
    }

    pub fn remote_salt(&self) -> Option<u64> {
        self.remote_salt
    }

    pub fn set_remote_salt(&mut self, salt: u64) {
        self.remote_salt = Some(salt);
    }

    /// Both salts XORed; `None` until the remote salt is known.
    pub fn combined_salt(&self) -> Option<u64> {
        self.remote_salt.map(|remote| self.local_salt ^ remote)
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    pub fn set_remote_id(&mut self, id: u32) {
        self.remote_id = Some(id);
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn set_disconnect_reason(&mut self, reason: DisconnectReason) {
        self.disconnect_reason.get_or_insert(reason);
    }

    /// Splits `payload` into messages no larger than `max_message_payload`
    /// and queues them behind everything already waiting.
    pub fn queue_message(
        &mut self,
        channel: u8,
        payload: &[u8],
        reliability: Reliability,
    ) -> Result<(), CarrierError> {
        let state = self
            .channels
            .get_mut(usize::from(channel))
            .ok_or(CarrierError::InvalidChannel(channel))?;
        let messages = state.stamp(payload, reliability, self.max_message_payload)?;
        if channel == SYSTEM_CHANNEL {
            self.system_outgoing.extend(messages);
        } else {
            self.outgoing.extend(messages);
        }
        Ok(())
    }

    pub fn queue_system(
        &mut self,
        message: &SystemMessage,
        reliability: Reliability,
    ) -> Result<(), CarrierError> {
        let payload = message.encode()?;
        self.queue_message(SYSTEM_CHANNEL, &payload, reliability)
    }

    /// Whether `build_datagram` would pack at least one message right now.
    /// Data waits while too many datagrams are unacked, or while its reliable
    /// sequence is too far ahead of the oldest one the peer may still lack.
    pub fn has_sendable(&self) -> bool {
        if !self.system_outgoing.is_empty() {
            return true;
        }
        self.window_open()
            && self
                .outgoing
                .front()
                .is_some_and(|next| within_reorder_window(next, &self.reliable_floors()))
    }

    pub fn outgoing_len(&self) -> usize {
        self.system_outgoing.len() + self.outgoing.len()
    }

    fn window_open(&self) -> bool {
        self.ack_tracker.unacked_count() < self.max_in_flight
    }

    /// Lowest reliable sequence per channel that is queued or unacked.
    fn reliable_floors(&self) -> [Option<u16>; CHANNEL_COUNT] {
        let mut floors = [None; CHANNEL_COUNT];
        let queued = self.system_outgoing.iter().chain(&self.outgoing);
        for message in self
            .ack_tracker
            .outstanding()
            .chain(queued)
            .filter(|m| m.is_reliable())
        {
            if let Some(floor) = floors.get_mut(usize::from(message.channel)) {
                if floor.is_none_or(|f| sequence_greater_than(f, message.reliable_sequence)) {
                    *floor = Some(message.reliable_sequence);
                }
            }
        }
        floors
    }

    /// Packs queued messages into the next datagram until `budget` would be
    /// exceeded, system messages first. The datagram may be empty, in which
    /// case it only carries acks.
    pub fn build_datagram(
        &mut self,
        now: Instant,
        budget: usize,
        flags: DatagramFlags,
    ) -> Datagram {
        let sequence = self.send_sequence;
        let mut header = DatagramHeader::new(sequence, flags);
        if let Some((ack, ack_bitfield)) = self.receive_tracker.ack_data() {
            header = header.with_ack(ack, ack_bitfield);
        }

        let mut datagram = Datagram::new(header);
        let mut size = DATAGRAM_OVERHEAD;
        pack(&mut self.system_outgoing, &mut datagram, &mut size, budget, |_| true);
        if self.window_open() {
            let floors = self.reliable_floors();
            pack(&mut self.outgoing, &mut datagram, &mut size, budget, |next| {
                within_reorder_window(next, &floors)
            });
        }

        if datagram.is_empty() {
            self.ack_tracker.mark_sent(sequence);
        } else {
            let reliable = datagram
                .messages
                .iter()
                .filter(|m| m.is_reliable())
                .cloned()
                .collect();
            self.ack_tracker.track(sequence, reliable, now);
        }

        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.ack_pending = false;
        self.last_send = now;
        datagram
    }

    /// Feeds one decoded datagram through ack processing and the channels.
    /// Returns the `(channel, payload)` pairs that became deliverable,
    /// system channel included.
    pub fn on_datagram(
        &mut self,
        datagram: Datagram,
        size: usize,
        now: Instant,
    ) -> Result<Vec<(u8, Vec<u8>)>, CarrierError> {
        let ack_data = datagram.header.ack_data();
        if let Some((ack, _)) = ack_data {
            if !self.ack_tracker.is_ack_valid(ack) {
                return Err(CarrierError::InvalidAck { ack });
            }
        }

        if !self.receive_tracker.record_received(datagram.header.sequence) {
            self.stats.record_duplicate();
            return Ok(Vec::new());
        }

        self.last_receive = now;
        self.stats.record_received(size);

        if let Some((ack, ack_bitfield)) = ack_data {
            let acked = self.ack_tracker.process_ack(ack, ack_bitfield, now);
            if !acked.is_empty() {
                self.stats
                    .update_rtt(self.ack_tracker.srtt(), self.ack_tracker.rtt_var());
            }
        }

        if !datagram.is_empty() {
            self.ack_pending = true;
        }

        let mut delivered = Vec::new();
        for message in datagram.messages {
            let channel = message.channel;
            match self.channels.get_mut(usize::from(channel)) {
                Some(state) => {
                    delivered.extend(state.receive(message).into_iter().map(|p| (channel, p)));
                    for _ in 0..state.take_rejected() {
                        self.record_bad_packet();
                    }
                }
                None => {
                    self.record_bad_packet();
                }
            }
        }

        Ok(delivered)
    }

    /// Requeues the reliable content of lost datagrams ahead of anything
    /// not yet sent, oldest first. Returns the number of lost datagrams.
    pub fn collect_lost(&mut self, now: Instant) -> usize {
        let lost = self.ack_tracker.collect_lost(now);
        if lost.is_empty() {
            return 0;
        }

        let count = lost.len();
        let resend: Vec<Message> = lost.into_iter().flat_map(|d| d.reliable).collect();
        let resent = resend.len();
        for message in resend.into_iter().rev() {
            if message.channel == SYSTEM_CHANNEL {
                self.system_outgoing.push_front(message);
            } else {
                self.outgoing.push_front(message);
            }
        }

        self.stats.record_lost(count, resent);
        count
    }

    pub fn needs_ack(&self) -> bool {
        self.ack_pending
    }

    pub fn needs_keep_alive(&self, now: Instant, interval: Duration) -> bool {
        self.state.is_established() && now.saturating_duration_since(self.last_send) >= interval
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_receive) > timeout
    }

    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state.is_handshaking() && now.saturating_duration_since(self.created) > timeout
    }

    pub fn linger_expired(&self, now: Instant, linger: Duration) -> bool {
        self.state == ConnectionState::Disconnecting
            && now.saturating_duration_since(self.state_changed) >= linger
    }

    pub fn handshake_retry_due(&self, now: Instant) -> bool {
        self.state.is_handshaking() && self.retry.next_retry.is_some_and(|at| now >= at)
    }

    /// Delay before retry `retries`: `min(max, base * 2^retries)`.
    pub fn next_handshake_retry(&self, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(self.retry.retries).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max)
    }

    pub fn schedule_handshake_retry(&mut self, now: Instant, base: Duration, max: Duration) {
        let delay = self.next_handshake_retry(base, max);
        self.retry.next_retry = Some(now + delay);
        self.retry.retries = self.retry.retries.saturating_add(1);
    }

    pub fn handshake_retries(&self) -> u32 {
        self.retry.retries
    }

    /// Returns the updated bad packet count.
    pub fn record_bad_packet(&mut self) -> u32 {
        self.bad_packets = self.bad_packets.saturating_add(1);
        self.stats.record_bad_packet();
        self.bad_packets
    }

    pub fn bad_packets(&self) -> u32 {
        self.bad_packets
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.record_sent(bytes);
    }

    pub fn roll_stats(&mut self, now: Instant) {
        self.stats.roll(now);
    }

    pub fn clock_sync_due(&self, now: Instant, interval: Duration) -> bool {
        self.state.is_established()
            && self
                .last_clock_sync
                .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    pub fn mark_clock_sync(&mut self, now: Instant) {
        self.last_clock_sync = Some(now);
    }

    /// Estimates the remote clock offset from a `ClockSync` stamp, assuming
    /// the message spent half the round trip in flight.
    pub fn update_clock_offset(&mut self, remote_ms: u64, local_ms: u64) {
        let one_way = (self.ack_tracker.srtt() / 2.0) as i64;
        self.clock_offset_ms = Some(remote_ms as i64 + one_way - local_ms as i64);
    }

    /// Remote clock minus ours, once a `ClockSync` has arrived.
    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.clock_offset_ms
    }

    pub fn rtt_ms(&self) -> f32 {
        self.ack_tracker.srtt()
    }

    pub fn unacked_count(&self) -> usize {
        self.ack_tracker.unacked_count()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn last_receive(&self) -> Instant {
        self.last_receive
    }

    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    pub fn created(&self) -> Instant {
        self.created
    }
}

/// Moves messages from the front of `queue` into `datagram` while
/// `sendable` allows and the budget holds. The first message always fits.
fn pack(
    queue: &mut VecDeque<Message>,
    datagram: &mut Datagram,
    size: &mut usize,
    budget: usize,
    sendable: impl Fn(&Message) -> bool,
) {
    while let Some(next) = queue.front() {
        if !sendable(next) {
            break;
        }
        let next_size = next.estimated_size();
        if *size + next_size > budget && !datagram.is_empty() {
            break;
        }
        *size += next_size;
        if let Some(message) = queue.pop_front() {
            datagram.messages.push(message);
        }
    }
}

/// The receiver drops reliable messages further than `REORDER_WINDOW` past
/// the next one it expects, which is never behind the channel's floor.
fn within_reorder_window(message: &Message, floors: &[Option<u16>; CHANNEL_COUNT]) -> bool {
    if !message.is_reliable() {
        return true;
    }
    floors
        .get(usize::from(message.channel))
        .copied()
        .flatten()
        .is_none_or(|floor| sequence_distance(floor, message.reliable_sequence) < REORDER_WINDOW)
}

#[derive(Debug)]
pub struct ConnectionManager {
    by_addr: HashMap<SocketAddr, ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u32,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            by_addr: HashMap::new(),
            connections: HashMap::new(),
            next_id: 1,
            max_connections,
        }
    }

    /// Allocates an id and inserts the connection built by `build`.
    pub fn insert_with(
        &mut self,
        addr: SocketAddr,
        build: impl FnOnce(ConnectionId) -> Connection,
    ) -> Result<ConnectionId, CarrierError> {
        if self.by_addr.contains_key(&addr) {
            return Err(CarrierError::AlreadyConnected(addr));
        }
        if self.is_full() {
            return Err(CarrierError::ConnectionLimit(self.max_connections));
        }

        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);

        self.connections.insert(id, build(id));
        self.by_addr.insert(addr, id);
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.by_addr
            .get(addr)
            .and_then(|id| self.connections.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        if let Some(id) = self.by_addr.get(addr) {
            self.connections.get_mut(id)
        } else {
            None
        }
    }

    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(addr).copied()
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        if let Some(connection) = self.connections.remove(&id) {
            self.by_addr.remove(&connection.addr);
            Some(connection)
        } else {
            None
        }
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<Connection> {
        if let Some(id) = self.by_addr.remove(addr) {
            self.connections.remove(&id)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }
}
