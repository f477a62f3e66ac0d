use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use carrier::{ConnectionId, DisconnectReason, HeartbeatThread, InterfaceEvent, Reliability};

use crate::Node;
use crate::config::NodeConfig;
use crate::net::{self, SharedInterface};
use crate::tui::{ConnectionInfo, Dashboard, LogLine};

const SEQUENCE_BYTES: usize = 4;

#[derive(Debug, Clone)]
pub struct ClientPlan {
    pub count: u32,
    pub interval: Duration,
    pub reliability: Reliability,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Sending,
    Draining,
    Leaving,
}

/// Connects to an echo server, sends `count` numbered messages and measures
/// how many come back and how long they take.
pub struct TestClient {
    interface: SharedInterface,
    heartbeat: HeartbeatThread,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
    id: ConnectionId,
    plan: ClientPlan,
    phase: Phase,
    running: Arc<AtomicBool>,
    tick_interval: Duration,
    drain_timeout: Duration,
    start_time: Instant,
    next_sequence: u32,
    last_send: Option<Instant>,
    drain_started: Option<Instant>,
    in_flight: HashMap<u32, Instant>,
    echoed: u32,
    rtt_total: Duration,
    rtt_max: Duration,
}

impl TestClient {
    pub fn new(server_addr: SocketAddr, plan: ClientPlan, config: &NodeConfig) -> Result<Self> {
        let bind_addr = if server_addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let (interface, heartbeat) = net::open(bind_addr, config)?;
        let (local_addr, id) = {
            let mut interface = net::lock(&interface);
            (interface.local_addr(), interface.connect(server_addr)?)
        };

        Ok(Self {
            interface,
            heartbeat,
            local_addr,
            server_addr,
            id,
            plan,
            phase: Phase::Connecting,
            running: Arc::new(AtomicBool::new(true)),
            tick_interval: config.tick_interval(),
            drain_timeout: config.carrier.connection_timeout(),
            start_time: Instant::now(),
            next_sequence: 0,
            last_send: None,
            drain_started: None,
            in_flight: HashMap::new(),
            echoed: 0,
            rtt_total: Duration::ZERO,
            rtt_max: Duration::ZERO,
        })
    }

    pub fn summary(&self) -> Vec<String> {
        let sent = self.next_sequence;
        let mut lines = vec![format!(
            "Sent {} / echoed {} ({:.1}% lost) to {}",
            sent,
            self.echoed,
            loss_percent(sent, self.echoed),
            self.server_addr
        )];
        if self.echoed > 0 {
            lines.push(format!(
                "Echo RTT avg {:.1}ms, max {:.1}ms",
                (self.rtt_total / self.echoed).as_secs_f64() * 1000.0,
                self.rtt_max.as_secs_f64() * 1000.0
            ));
        }
        lines
    }

    fn handle_event(&mut self, event: InterfaceEvent, now: Instant, lines: &mut Vec<LogLine>) {
        match &event {
            InterfaceEvent::Connected { .. } => self.phase = Phase::Sending,
            InterfaceEvent::Message { payload, .. } => {
                if let Some(sent_at) = decode_sequence(payload).and_then(|s| self.in_flight.remove(&s)) {
                    let rtt = now.saturating_duration_since(sent_at);
                    self.rtt_total += rtt;
                    self.rtt_max = self.rtt_max.max(rtt);
                    self.echoed += 1;
                }
            }
            InterfaceEvent::ConnectionFailed { .. } | InterfaceEvent::Disconnected { .. } => {
                self.running.store(false, Ordering::SeqCst);
            }
            InterfaceEvent::IncomingConnection { .. } | InterfaceEvent::Error { .. } => {}
        }
        lines.extend(LogLine::from_event(&event));
    }

    fn send_due(&mut self, now: Instant, lines: &mut Vec<LogLine>) {
        if self.phase != Phase::Sending {
            return;
        }
        if self.next_sequence >= self.plan.count {
            lines.push(LogLine::info(format!(
                "All {} messages sent, waiting for echoes",
                self.plan.count
            )));
            self.phase = Phase::Draining;
            self.drain_started = Some(now);
            return;
        }
        if self
            .last_send
            .is_some_and(|last| now.saturating_duration_since(last) < self.plan.interval)
        {
            return;
        }

        let sequence = self.next_sequence;
        let payload = encode_sequence(sequence, self.plan.size);
        let channel = net::channel_for(self.plan.reliability);
        let sent = net::lock(&self.interface).send(self.id, channel, &payload, self.plan.reliability);
        match sent {
            Ok(()) => {
                self.in_flight.insert(sequence, now);
                self.next_sequence += 1;
                self.last_send = Some(now);
            }
            Err(e) => lines.push(LogLine::error(format!("Send {} failed: {}", sequence, e))),
        }
    }

    fn finish_if_drained(&mut self, now: Instant, lines: &mut Vec<LogLine>) {
        if self.phase != Phase::Draining {
            return;
        }
        let timed_out = self
            .drain_started
            .is_some_and(|started| now.saturating_duration_since(started) >= self.drain_timeout);
        if self.in_flight.is_empty() || timed_out {
            lines.extend(self.summary().into_iter().map(LogLine::info));
            self.leave(lines);
        }
    }

    fn leave(&mut self, lines: &mut Vec<LogLine>) {
        if let Err(e) = net::lock(&self.interface).disconnect(self.id, DisconnectReason::UserRequested) {
            lines.push(LogLine::warn(format!("Disconnect failed: {}", e)));
            self.running.store(false, Ordering::SeqCst);
        }
        self.phase = Phase::Leaving;
    }
}

impl Node for TestClient {
    fn tick_once(&mut self) -> Vec<LogLine> {
        let now = Instant::now();
        let events: Vec<InterfaceEvent> = {
            let mut interface = net::lock(&self.interface);
            interface.update_at(now);
            interface.drain_events().collect()
        };

        let mut lines = Vec::new();
        for event in events {
            self.handle_event(event, now, &mut lines);
        }
        self.send_due(now, &mut lines);
        self.finish_if_drained(now, &mut lines);
        lines
    }

    fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    fn dashboard(&self) -> Dashboard {
        let interface = net::lock(&self.interface);
        let now = Instant::now();
        Dashboard {
            title: "Carrier Test Client".to_string(),
            local_addr: self.local_addr,
            uptime_secs: self.start_time.elapsed().as_secs(),
            connections: interface
                .connections()
                .map(|c| ConnectionInfo::from_connection(c, now))
                .collect(),
            lifetime: interface.stats(),
            last_second: interface.last_second_stats(),
            simulated_drops: interface.driver().dropped(),
            status: vec![
                format!("{:?}", self.phase),
                format!("Sent: {}/{}", self.next_sequence, self.plan.count),
                format!("Echoed: {}", self.echoed),
            ],
        }
    }

    fn shutdown(&mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        if matches!(self.phase, Phase::Connecting | Phase::Sending | Phase::Draining) {
            self.leave(&mut lines);
        }
        net::lock(&self.interface).shutdown();
        self.heartbeat.stop();
        lines
    }
}

fn encode_sequence(sequence: u32, size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size.max(SEQUENCE_BYTES)];
    payload[..SEQUENCE_BYTES].copy_from_slice(&sequence.to_le_bytes());
    payload
}

fn decode_sequence(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; SEQUENCE_BYTES] = payload.get(..SEQUENCE_BYTES)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn loss_percent(sent: u32, echoed: u32) -> f32 {
    if sent == 0 {
        return 0.0;
    }
    (sent.saturating_sub(echoed)) as f32 / sent as f32 * 100.0
}
