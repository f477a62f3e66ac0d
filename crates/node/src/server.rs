use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::Result;
use carrier::{HeartbeatThread, InterfaceEvent};

use crate::Node;
use crate::config::NodeConfig;
use crate::net::{self, SharedInterface};
use crate::tui::{ConnectionInfo, Dashboard, LogLine};

/// Accepts connections and sends every message back on the channel it
/// arrived on.
pub struct EchoServer {
    interface: SharedInterface,
    heartbeat: HeartbeatThread,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    tick_interval: Duration,
    echoed: u64,
    start_time: Instant,
}

impl EchoServer {
    pub fn new(bind_addr: &str, config: &NodeConfig) -> Result<Self> {
        let (interface, heartbeat) = net::open(bind_addr, config)?;
        let local_addr = net::lock(&interface).local_addr();

        Ok(Self {
            interface,
            heartbeat,
            local_addr,
            running: Arc::new(AtomicBool::new(true)),
            tick_interval: config.tick_interval(),
            echoed: 0,
            start_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Node for EchoServer {
    fn tick_once(&mut self) -> Vec<LogLine> {
        let mut interface = net::lock(&self.interface);
        interface.update();

        let events: Vec<InterfaceEvent> = interface.drain_events().collect();
        let mut lines = Vec::new();
        for event in events {
            if let InterfaceEvent::Message {
                id,
                channel,
                payload,
            } = &event
            {
                match interface.send(*id, *channel, payload, net::reliability_for(*channel)) {
                    Ok(()) => self.echoed += 1,
                    Err(e) => lines.push(LogLine::warn(format!("Echo to {} failed: {}", id, e))),
                }
                continue;
            }
            lines.extend(LogLine::from_event(&event));
        }
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
            title: "Carrier Echo Server".to_string(),
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
                format!("Max: {}", interface.config().max_connections),
                format!("Echoed: {}", self.echoed),
                format!(
                    "Heartbeat: {}",
                    if self.heartbeat.is_running() { "on" } else { "off" }
                ),
            ],
        }
    }

    fn shutdown(&mut self) -> Vec<LogLine> {
        let mut lines = vec![LogLine::info("Shutting down...")];
        let linger = {
            let mut interface = net::lock(&self.interface);
            interface.shutdown();
            interface.config().disconnect_linger() * 2
        };

        // Keep updating so the disconnect notices get acked or resent.
        let deadline = Instant::now() + linger;
        while Instant::now() < deadline {
            let mut interface = net::lock(&self.interface);
            interface.update();
            lines.extend(interface.drain_events().filter_map(|e| LogLine::from_event(&e)));
            if interface.connections().next().is_none() {
                break;
            }
            drop(interface);
            std::thread::sleep(self.tick_interval);
        }

        self.heartbeat.stop();
        lines.push(LogLine::info(format!("Echoed {} messages", self.echoed())));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrier::{ConnectionState, DisconnectReason, NetworkInterface, Reliability};

    fn test_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.tick_ms = 1;
        config.carrier.heartbeat_interval_ms = 100;
        config.carrier.disconnect_linger_ms = 100;
        config
    }

    #[test]
    fn test_echoes_on_same_channel() {
        let mut server = EchoServer::new("127.0.0.1:0", &test_config()).unwrap();
        let mut client =
            NetworkInterface::bind("127.0.0.1:0", test_config().carrier).unwrap();
        let id = client.connect(server.local_addr()).unwrap();

        let mut echoes = Vec::new();
        let mut sent = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while echoes.len() < 2 && Instant::now() < deadline {
            server.tick_once();
            client.update();
            for event in client.drain_events() {
                if let InterfaceEvent::Message {
                    channel, payload, ..
                } = event
                {
                    echoes.push((channel, payload));
                }
            }
            if !sent
                && client
                    .connection(id)
                    .is_some_and(|c| c.state() == ConnectionState::Connected)
            {
                client
                    .send(id, net::RELIABLE_CHANNEL, b"ping", Reliability::Reliable)
                    .unwrap();
                client
                    .send(id, net::UNRELIABLE_CHANNEL, b"pong", Reliability::Unreliable)
                    .unwrap();
                sent = true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        echoes.sort();
        assert_eq!(
            echoes,
            vec![
                (net::RELIABLE_CHANNEL, b"ping".to_vec()),
                (net::UNRELIABLE_CHANNEL, b"pong".to_vec()),
            ]
        );
        assert_eq!(server.echoed(), 2);

        client.disconnect(id, DisconnectReason::UserRequested).unwrap();
        let lines = server.shutdown();
        assert!(lines.iter().any(|l| l.message.contains("Echoed 2")));
    }
}
