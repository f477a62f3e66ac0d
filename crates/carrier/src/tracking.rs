use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::{ACK_WINDOW, Message, sequence_distance, sequence_greater_than};

const INITIAL_SRTT_MS: f32 = 100.0;
const INITIAL_RTT_VAR_MS: f32 = 50.0;
const DEFAULT_MIN_RTO: Duration = Duration::from_millis(50);
const DEFAULT_MAX_RTO: Duration = Duration::from_secs(2);

/// A datagram we sent and still expect an ack for, along with the reliable
/// messages it carried.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub sequence: u16,
    pub send_time: Instant,
    pub acked: bool,
    pub reliable: Vec<Message>,
}

#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<SentDatagram>,
    evicted: Vec<SentDatagram>,
    max_pending: usize,
    last_sent: Option<u16>,
    latest_ack: Option<u16>,
    srtt: f32,
    rtt_var: f32,
    min_rto: Duration,
    max_rto: Duration,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            evicted: Vec::new(),
            max_pending: max_pending.max(1),
            last_sent: None,
            latest_ack: None,
            srtt: INITIAL_SRTT_MS,
            rtt_var: INITIAL_RTT_VAR_MS,
            min_rto: DEFAULT_MIN_RTO,
            max_rto: DEFAULT_MAX_RTO,
        }
    }

    pub fn with_rto_bounds(mut self, min_rto: Duration, max_rto: Duration) -> Self {
        self.min_rto = min_rto;
        self.max_rto = max_rto.max(min_rto);
        self
    }

    pub fn track(&mut self, sequence: u16, reliable: Vec<Message>, now: Instant) {
        while self.pending.len() >= self.max_pending {
            if let Some(oldest) = self.pending.pop_front() {
                if !oldest.acked {
                    self.evicted.push(oldest);
                }
            }
        }

        self.pending.push_back(SentDatagram {
            sequence,
            send_time: now,
            acked: false,
            reliable,
        });
        self.last_sent = Some(sequence);
    }

    /// Records a sequence that went out without anything worth tracking,
    /// such as an ack-only datagram. The peer may still ack it.
    pub fn mark_sent(&mut self, sequence: u16) {
        self.last_sent = Some(sequence);
    }

    pub fn last_sent(&self) -> Option<u16> {
        self.last_sent
    }

    /// An ack may only name a datagram that has already gone out.
    pub fn is_ack_valid(&self, ack: u16) -> bool {
        match self.last_sent {
            Some(last) => !sequence_greater_than(ack, last),
            None => false,
        }
    }

    pub fn process_ack(&mut self, ack: u16, ack_bitfield: u32, now: Instant) -> Vec<u16> {
        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();

        if self
            .latest_ack
            .is_none_or(|latest| sequence_greater_than(ack, latest))
        {
            self.latest_ack = Some(ack);
        }

        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }

            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                if diff <= ACK_WINDOW {
                    (ack_bitfield & (1 << (diff - 1))) != 0
                } else {
                    false
                }
            } else {
                false
            };

            if is_acked {
                pending.acked = true;
                pending.reliable.clear();
                acked_sequences.push(pending.sequence);

                let rtt = now.duration_since(pending.send_time).as_secs_f32() * 1000.0;
                rtt_samples.push(rtt);
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }

        acked_sequences
    }

    /// Removes and returns datagrams that will never be acked: older than
    /// the retransmission timeout, pushed out of the ack window, or evicted
    /// because too many were in flight.
    pub fn collect_lost(&mut self, now: Instant) -> Vec<SentDatagram> {
        let rto = self.rto();
        let latest_ack = self.latest_ack;
        let mut lost = std::mem::take(&mut self.evicted);

        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if pending.acked {
                continue;
            }

            let expired = now.saturating_duration_since(pending.send_time) > rto;
            let out_of_window = latest_ack.is_some_and(|ack| {
                sequence_distance(pending.sequence, ack) > i32::from(ACK_WINDOW)
            });

            if expired || out_of_window {
                lost.push(pending);
            } else {
                kept.push_back(pending);
            }
        }
        self.pending = kept;

        lost
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn rto(&self) -> Duration {
        let millis = (self.srtt + 4.0 * self.rtt_var).max(0.0);
        Duration::from_secs_f32(millis / 1000.0).clamp(self.min_rto, self.max_rto)
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count() + self.evicted.len()
    }

    /// Reliable messages the peer has not acked yet, evicted ones included.
    pub fn outstanding(&self) -> impl Iterator<Item = &Message> {
        self.pending
            .iter()
            .filter(|p| !p.acked)
            .chain(&self.evicted)
            .flat_map(|p| &p.reliable)
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: Option<u16>,
    received_bitfield: u32,
    recent_sequences: VecDeque<u16>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: None,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    /// Returns `false` for a datagram we have already seen.
    pub fn record_received(&mut self, sequence: u16) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        match self.last_received {
            None => {
                self.last_received = Some(sequence);
                self.received_bitfield = 0;
            }
            Some(last) if sequence_greater_than(sequence, last) => {
                let diff = u32::from(sequence.wrapping_sub(last));
                if diff <= u32::from(ACK_WINDOW) {
                    self.received_bitfield =
                        self.received_bitfield.checked_shl(diff).unwrap_or(0) | (1 << (diff - 1));
                } else {
                    self.received_bitfield = 0;
                }
                self.last_received = Some(sequence);
            }
            Some(last) => {
                let diff = last.wrapping_sub(sequence);
                if diff > 0 && diff <= ACK_WINDOW {
                    self.received_bitfield |= 1 << (diff - 1);
                }
            }
        }

        true
    }

    /// Latest received sequence and the bitfield of the 32 before it, or
    /// `None` until something has arrived.
    pub fn ack_data(&self) -> Option<(u16, u32)> {
        self.last_received
            .map(|last| (last, self.received_bitfield))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFlags;

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);

        let (ack, bitfield) = tracker.ack_data().unwrap();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_receive_tracker_gap() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(4);

        let (ack, bitfield) = tracker.ack_data().unwrap();
        assert_eq!(ack, 4);
        assert_eq!(bitfield & 0b111, 0b100);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data().unwrap();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_receive_tracker_wraps() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(u16::MAX);
        tracker.record_received(0);
        tracker.record_received(1);

        let (ack, bitfield) = tracker.ack_data().unwrap();
        assert_eq!(ack, 1);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_nothing_to_ack_before_first_datagram() {
        assert!(ReceiveTracker::new().ack_data().is_none());
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new(32);
        let start = Instant::now();

        tracker.track(1, Vec::new(), start);
        let acked = tracker.process_ack(1, 0, start + Duration::from_millis(10));

        assert_eq!(acked, vec![1]);
        assert!(tracker.srtt() > 0.0);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_ack_bitfield_covers_older_datagrams() {
        let mut tracker = AckTracker::new(32);
        let now = Instant::now();

        for sequence in 10..14 {
            tracker.track(sequence, Vec::new(), now);
        }

        // Ack 13, plus 11 via bit 1; 10 and 12 are missing.
        let mut acked = tracker.process_ack(13, 0b10, now);
        acked.sort_unstable();
        assert_eq!(acked, vec![11, 13]);
        assert_eq!(tracker.unacked_count(), 2);
    }

    #[test]
    fn test_ack_validation_rejects_unsent() {
        let mut tracker = AckTracker::new(32);
        assert!(!tracker.is_ack_valid(0));

        tracker.track(5, Vec::new(), Instant::now());
        assert!(tracker.is_ack_valid(5));
        assert!(tracker.is_ack_valid(4));
        assert!(!tracker.is_ack_valid(6));

        tracker.mark_sent(6);
        assert!(tracker.is_ack_valid(6));
        assert_eq!(tracker.unacked_count(), 1);
    }

    #[test]
    fn test_lost_after_timeout_returns_reliable_messages() {
        let mut tracker = AckTracker::new(32)
            .with_rto_bounds(Duration::from_millis(20), Duration::from_millis(20));
        let start = Instant::now();
        let message = Message::new(0, MessageFlags::RELIABLE, b"resend me".to_vec());

        tracker.track(1, vec![message.clone()], start);
        assert!(tracker.collect_lost(start + Duration::from_millis(5)).is_empty());

        let lost = tracker.collect_lost(start + Duration::from_millis(50));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].reliable, vec![message]);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_lost_when_outside_ack_window() {
        let mut tracker = AckTracker::new(64);
        let now = Instant::now();

        for sequence in 0..40 {
            tracker.track(sequence, Vec::new(), now);
        }
        tracker.process_ack(39, 0, now);

        let lost: Vec<u16> = tracker
            .collect_lost(now)
            .into_iter()
            .map(|d| d.sequence)
            .collect();
        assert_eq!(lost, (0..7).collect::<Vec<u16>>());
    }

    #[test]
    fn test_overflow_evicts_oldest_as_lost() {
        let mut tracker = AckTracker::new(2);
        let now = Instant::now();

        tracker.track(0, Vec::new(), now);
        tracker.track(1, Vec::new(), now);
        tracker.track(2, Vec::new(), now);

        let lost = tracker.collect_lost(now);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].sequence, 0);
    }

    #[test]
    fn test_outstanding_skips_acked_and_keeps_evicted() {
        let mut tracker = AckTracker::new(2);
        let now = Instant::now();
        let message = |text: &[u8]| Message::new(0, MessageFlags::RELIABLE, text.to_vec());

        tracker.track(0, vec![message(b"evicted")], now);
        tracker.track(1, vec![message(b"acked")], now);
        tracker.track(2, vec![message(b"waiting")], now);
        tracker.process_ack(1, 0, now);

        let outstanding: Vec<&[u8]> = tracker.outstanding().map(|m| m.payload.as_slice()).collect();
        assert_eq!(outstanding, vec![b"waiting".as_slice(), b"evicted".as_slice()]);
    }
}
