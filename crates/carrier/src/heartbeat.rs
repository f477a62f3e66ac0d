use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::driver::SocketDriver;
use crate::interface::NetworkInterface;

pub trait Heartbeat: Send {
    fn last_update(&self) -> Instant;

    fn connection_timeout(&self) -> Duration;

    /// Pumps the network without running the owner's update. Returns the
    /// number of datagrams sent.
    fn heartbeat(&mut self, now: Instant) -> usize;
}

impl<D: SocketDriver> Heartbeat for NetworkInterface<D> {
    fn last_update(&self) -> Instant {
        NetworkInterface::last_update(self)
    }

    fn connection_timeout(&self) -> Duration {
        self.config().connection_timeout()
    }

    fn heartbeat(&mut self, now: Instant) -> usize {
        self.pump(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeartbeatHandle(u64);

struct Registration {
    handle: HeartbeatHandle,
    target: Weak<Mutex<dyn Heartbeat>>,
    stalled: bool,
    warned: bool,
}

struct Shared {
    registrations: Mutex<Vec<Registration>>,
    running: AtomicBool,
    next_handle: AtomicU64,
}

impl Shared {
    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pumps registered interfaces whose owner has stopped calling `update`.
pub struct HeartbeatThread {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatThread {
    pub fn spawn(config: HeartbeatConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            registrations: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("carrier-heartbeat".to_string())
            .spawn(move || run(worker, config))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Watches `target` until it is unregistered or dropped. Only a weak
    /// reference is kept.
    pub fn register<T: Heartbeat + 'static>(&self, target: &Arc<Mutex<T>>) -> HeartbeatHandle {
        let handle = HeartbeatHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let target: Arc<Mutex<dyn Heartbeat>> = target.clone();

        self.shared.registrations().push(Registration {
            handle,
            target: Arc::downgrade(&target),
            stalled: false,
            warned: false,
        });
        handle
    }

    pub fn unregister(&self, handle: HeartbeatHandle) -> bool {
        let mut registrations = self.shared.registrations();
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        registrations.len() != before
    }

    /// Number of registered targets that are still alive.
    pub fn registered(&self) -> usize {
        self.shared
            .registrations()
            .iter()
            .filter(|r| r.target.strong_count() > 0)
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, config: HeartbeatConfig) {
    let poll_interval = config.poll_interval();
    let stall_threshold = config.stall_threshold();
    debug!(
        "heartbeat thread started (poll {:?}, stall threshold {:?})",
        poll_interval, stall_threshold
    );

    while shared.running.load(Ordering::Acquire) {
        tick(&shared, stall_threshold, Instant::now());
        thread::park_timeout(poll_interval);
    }

    debug!("heartbeat thread stopped");
}

fn tick(shared: &Shared, stall_threshold: Duration, now: Instant) {
    let mut registrations = shared.registrations();
    registrations.retain(|r| r.target.strong_count() > 0);

    for registration in registrations.iter_mut() {
        let Some(target) = registration.target.upgrade() else {
            continue;
        };
        let mut target = match target.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => continue,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let idle = now.saturating_duration_since(target.last_update());
        if idle < stall_threshold {
            if registration.stalled {
                info!("network interface resumed after {:?}", idle);
                registration.stalled = false;
                registration.warned = false;
            }
            continue;
        }

        if !registration.stalled {
            debug!("network interface idle for {:?}, heartbeat taking over", idle);
            registration.stalled = true;
        }
        if !registration.warned && idle > target.connection_timeout() {
            warn!(
                "network interface not updated for {:?}, longer than the connection timeout",
                idle
            );
            registration.warned = true;
        }

        let sent = target.heartbeat(now);
        if sent > 0 {
            debug!("heartbeat sent {} datagrams", sent);
        }
    }
}
