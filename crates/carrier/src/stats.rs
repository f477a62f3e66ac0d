use std::time::{Duration, Instant};

const STATS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_resent: u64,
    pub duplicates: u64,
    pub bad_packets: u64,
}

impl TrafficStats {
    pub fn loss_percent(&self) -> f32 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        (self.datagrams_lost as f32 / self.datagrams_sent as f32) * 100.0
    }

    pub fn merge(&mut self, other: &TrafficStats) {
        self.datagrams_sent += other.datagrams_sent;
        self.datagrams_received += other.datagrams_received;
        self.datagrams_lost += other.datagrams_lost;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_resent += other.messages_resent;
        self.duplicates += other.duplicates;
        self.bad_packets += other.bad_packets;
    }
}

/// Lifetime counters plus the totals of the last complete one second window.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub lifetime: TrafficStats,
    pub last_second: TrafficStats,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
    current: TrafficStats,
    window_start: Option<Instant>,
}

impl NetworkStats {
    fn apply(&mut self, update: impl Fn(&mut TrafficStats)) {
        update(&mut self.lifetime);
        update(&mut self.current);
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.apply(|s| {
            s.datagrams_sent += 1;
            s.bytes_sent += bytes as u64;
        });
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.apply(|s| {
            s.datagrams_received += 1;
            s.bytes_received += bytes as u64;
        });
    }

    pub fn record_lost(&mut self, datagrams: usize, messages_resent: usize) {
        self.apply(|s| {
            s.datagrams_lost += datagrams as u64;
            s.messages_resent += messages_resent as u64;
        });
        self.packet_loss_percent = self.lifetime.loss_percent();
    }

    pub fn record_duplicate(&mut self) {
        self.apply(|s| s.duplicates += 1);
    }

    pub fn record_bad_packet(&mut self) {
        self.apply(|s| s.bad_packets += 1);
    }

    pub fn update_rtt(&mut self, rtt_ms: f32, rtt_variance: f32) {
        self.rtt_ms = rtt_ms;
        self.rtt_variance = rtt_variance;
    }

    /// Closes the current window once a second has passed.
    pub fn roll(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };

        if now.saturating_duration_since(start) >= STATS_WINDOW {
            self.last_second = std::mem::take(&mut self.current);
            self.window_start = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_second_window_rolls() {
        let start = Instant::now();
        let mut stats = NetworkStats::default();
        stats.roll(start);

        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(20);

        stats.roll(start + Duration::from_millis(500));
        assert_eq!(stats.last_second, TrafficStats::default());

        stats.roll(start + Duration::from_millis(1000));
        assert_eq!(stats.last_second.datagrams_sent, 2);
        assert_eq!(stats.last_second.bytes_sent, 150);
        assert_eq!(stats.last_second.bytes_received, 20);

        stats.roll(start + Duration::from_millis(2100));
        assert_eq!(stats.last_second, TrafficStats::default());
        assert_eq!(stats.lifetime.datagrams_sent, 2);
    }

    #[test]
    fn test_loss_percent() {
        let mut stats = NetworkStats::default();
        for _ in 0..4 {
            stats.record_sent(10);
        }
        stats.record_lost(1, 3);

        assert!((stats.packet_loss_percent - 25.0).abs() < f32::EPSILON);
        assert_eq!(stats.lifetime.messages_resent, 3);
    }
}
