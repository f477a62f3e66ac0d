use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::driver::SocketDriver;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// 0 to 100.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop<R: Rng>(&self, rng: &mut R) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rng.random::<f32>() * 100.0 < self.loss_percent
    }

    pub fn delay_ms<R: Rng>(&self, rng: &mut R) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            rng.random_range(0..=self.jitter_ms)
        } else {
            0
        };
        base + rng.random_range(0..=range) + jitter
    }
}

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    order: u64,
    data: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Wraps a driver and applies [`PacketLossSimulation`] to everything it
/// sends. Delayed datagrams go out on later driver calls.
#[derive(Debug)]
pub struct SimulatedDriver<D> {
    inner: D,
    config: PacketLossSimulation,
    rng: StdRng,
    outbound: BinaryHeap<DelayedDatagram>,
    next_order: u64,
    dropped: u64,
}

impl<D: SocketDriver> SimulatedDriver<D> {
    pub fn new(inner: D, config: PacketLossSimulation) -> Self {
        Self::with_rng(inner, config, StdRng::from_os_rng())
    }

    pub fn with_seed(inner: D, config: PacketLossSimulation, seed: u64) -> Self {
        Self::with_rng(inner, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: D, config: PacketLossSimulation, rng: StdRng) -> Self {
        Self {
            inner,
            config,
            rng,
            outbound: BinaryHeap::new(),
            next_order: 0,
            dropped: 0,
        }
    }

    pub fn config(&self) -> &PacketLossSimulation {
        &self.config
    }

    pub fn set_config(&mut self, config: PacketLossSimulation) {
        self.config = config;
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn delayed(&self) -> usize {
        self.outbound.len()
    }

    fn flush(&mut self, now: Instant) -> io::Result<()> {
        while self
            .outbound
            .peek()
            .is_some_and(|delayed| delayed.release_time <= now)
        {
            if let Some(delayed) = self.outbound.pop() {
                self.inner.send_to(&delayed.data, delayed.addr)?;
            }
        }
        Ok(())
    }
}

impl<D: SocketDriver> SocketDriver for SimulatedDriver<D> {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let now = Instant::now();
        self.flush(now)?;

        if !self.config.enabled {
            return self.inner.send_to(data, addr);
        }

        if self.config.should_drop(&mut self.rng) {
            self.dropped += 1;
            return Ok(data.len());
        }

        let delay = self.config.delay_ms(&mut self.rng);
        if delay == 0 {
            return self.inner.send_to(data, addr);
        }

        self.outbound.push(DelayedDatagram {
            release_time: now + Duration::from_millis(u64::from(delay)),
            order: self.next_order,
            data: data.to_vec(),
            addr,
        });
        self.next_order += 1;
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.flush(Instant::now())?;
        self.inner.recv_from(buf)
    }

    fn max_datagram_size(&self) -> usize {
        self.inner.max_datagram_size()
    }
}
