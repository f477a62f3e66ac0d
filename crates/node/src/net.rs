use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use carrier::{
    HeartbeatThread, NetworkInterface, PacketLossSimulation, Reliability, SimulatedDriver,
    UdpDriver,
};

use crate::config::NodeConfig;

pub const RELIABLE_CHANNEL: u8 = 0;
pub const UNRELIABLE_CHANNEL: u8 = 1;

pub type Interface = NetworkInterface<SimulatedDriver<UdpDriver>>;
pub type SharedInterface = Arc<Mutex<Interface>>;

/// Binds an interface behind the loss simulator and hands it to a heartbeat
/// thread. Keep the thread alive as long as the interface.
pub fn open(bind_addr: &str, config: &NodeConfig) -> Result<(SharedInterface, HeartbeatThread)> {
    let driver = UdpDriver::bind(bind_addr, &config.carrier.driver)
        .with_context(|| format!("binding {}", bind_addr))?;
    let driver = SimulatedDriver::new(driver, simulation(config));
    let interface = NetworkInterface::with_driver(driver, config.carrier.clone())?;
    let interface = Arc::new(Mutex::new(interface));

    let heartbeat = HeartbeatThread::spawn(config.carrier.heartbeat.clone())
        .context("starting heartbeat thread")?;
    heartbeat.register(&interface);

    Ok((interface, heartbeat))
}

pub fn lock(interface: &SharedInterface) -> MutexGuard<'_, Interface> {
    interface.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn reliability_for(channel: u8) -> Reliability {
    if channel == UNRELIABLE_CHANNEL {
        Reliability::Unreliable
    } else {
        Reliability::Reliable
    }
}

pub fn channel_for(reliability: Reliability) -> u8 {
    match reliability {
        Reliability::Reliable => RELIABLE_CHANNEL,
        Reliability::Unreliable => UNRELIABLE_CHANNEL,
    }
}

fn simulation(config: &NodeConfig) -> PacketLossSimulation {
    if config.simulation.enabled {
        log::info!(
            "simulating {:.1}% loss, {}-{}ms latency, {}ms jitter",
            config.simulation.loss_percent,
            config.simulation.min_latency_ms,
            config.simulation.max_latency_ms,
            config.simulation.jitter_ms
        );
    }
    config.simulation.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mapping() {
        for reliability in [Reliability::Reliable, Reliability::Unreliable] {
            assert_eq!(reliability_for(channel_for(reliability)), reliability);
        }
        assert_eq!(reliability_for(7), Reliability::Reliable);
    }
}
