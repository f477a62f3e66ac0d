use std::collections::HashMap;

use crate::error::CarrierError;
use crate::protocol::{
    ChunkInfo, MAX_DATAGRAM_SIZE, Message, MessageFlags, sequence_distance, sequence_greater_than,
};

/// Reliable messages further than this ahead of the next expected one are
/// dropped instead of buffered. Senders hold back anything beyond it.
pub(crate) const REORDER_WINDOW: i32 = 1024;
const MAX_CHUNKS: usize = REORDER_WINDOW as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    #[default]
    Unreliable,
    Reliable,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

/// Sequencing state for one channel of one connection.
#[derive(Debug)]
pub struct ChannelState {
    channel: u8,
    send_sequence: u16,
    send_reliable_sequence: u16,
    last_unreliable: Option<u16>,
    next_reliable: u16,
    reorder: HashMap<u16, Message>,
    assembly: Vec<u8>,
    /// Next chunk index and total count of the message being assembled.
    assembling: Option<ChunkInfo>,
    max_message_size: usize,
    rejected: u32,
}

impl ChannelState {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            send_sequence: 0,
            send_reliable_sequence: 0,
            last_unreliable: None,
            next_reliable: 0,
            reorder: HashMap::new(),
            assembly: Vec::new(),
            assembling: None,
            max_message_size: MAX_DATAGRAM_SIZE * MAX_CHUNKS,
            rejected: 0,
        }
    }

    /// Caps reassembled messages at what a peer chunking by `max_chunk` can
    /// produce.
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_message_size = max_chunk.max(1).saturating_mul(MAX_CHUNKS);
        self
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Number of malformed chunked messages discarded since the last call.
    pub fn take_rejected(&mut self) -> u32 {
        std::mem::take(&mut self.rejected)
    }

    pub fn stamp(
        &mut self,
        payload: &[u8],
        reliability: Reliability,
        max_chunk: usize,
    ) -> Result<Vec<Message>, CarrierError> {
        let max_chunk = max_chunk.max(1);

        if !reliability.is_reliable() {
            if payload.len() > max_chunk {
                return Err(CarrierError::PayloadTooLarge {
                    size: payload.len(),
                    max: max_chunk,
                });
            }
            let mut message = Message::new(self.channel, MessageFlags::empty(), payload.to_vec());
            message.sequence = self.next_send_sequence();
            return Ok(vec![message]);
        }

        if payload.len() <= max_chunk {
            let message = self.stamp_reliable(payload.to_vec(), None);
            return Ok(vec![message]);
        }

        let count = payload.len().div_ceil(max_chunk);
        if count > MAX_CHUNKS {
            return Err(CarrierError::PayloadTooLarge {
                size: payload.len(),
                max: max_chunk * MAX_CHUNKS,
            });
        }

        let messages = payload
            .chunks(max_chunk)
            .enumerate()
            .map(|(index, chunk)| {
                let info = ChunkInfo {
                    index: index as u16,
                    count: count as u16,
                };
                self.stamp_reliable(chunk.to_vec(), Some(info))
            })
            .collect();

        Ok(messages)
    }

    fn stamp_reliable(&mut self, payload: Vec<u8>, chunk: Option<ChunkInfo>) -> Message {
        let flags = if chunk.is_some() {
            MessageFlags::RELIABLE | MessageFlags::CHUNKED
        } else {
            MessageFlags::RELIABLE
        };

        let mut message = Message::new(self.channel, flags, payload);
        message.sequence = self.next_send_sequence();
        message.reliable_sequence = self.send_reliable_sequence;
        message.chunk = chunk;
        self.send_reliable_sequence = self.send_reliable_sequence.wrapping_add(1);
        message
    }

    fn next_send_sequence(&mut self) -> u16 {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        sequence
    }

    /// Accepts one inbound message and returns the payloads that became
    /// deliverable, in order.
    pub fn receive(&mut self, message: Message) -> Vec<Vec<u8>> {
        if !message.is_reliable() {
            if let Some(last) = self.last_unreliable {
                if !sequence_greater_than(message.sequence, last) {
                    return Vec::new();
                }
            }
            self.last_unreliable = Some(message.sequence);
            return vec![message.payload];
        }

        let distance = sequence_distance(self.next_reliable, message.reliable_sequence);
        if !(0..REORDER_WINDOW).contains(&distance) {
            return Vec::new();
        }
        self.reorder
            .entry(message.reliable_sequence)
            .or_insert(message);

        let mut delivered = Vec::new();
        while let Some(next) = self.reorder.remove(&self.next_reliable) {
            self.next_reliable = self.next_reliable.wrapping_add(1);
            if let Some(payload) = self.assemble(next) {
                delivered.push(payload);
            }
        }
        delivered
    }

    fn assemble(&mut self, message: Message) -> Option<Vec<u8>> {
        let chunk = match message.chunk {
            Some(chunk) if message.is_chunked() => chunk,
            _ => {
                if self.assembling.is_some() {
                    self.abandon_assembly();
                }
                return Some(message.payload);
            }
        };

        let expected = match self.assembling {
            Some(partial) if partial.count != chunk.count => None,
            Some(partial) => Some(partial.index),
            None => Some(0),
        };
        let valid = chunk.count > 0
            && usize::from(chunk.count) <= MAX_CHUNKS
            && expected == Some(chunk.index)
            && self.assembly.len() + message.payload.len() <= self.max_message_size;
        if !valid {
            self.abandon_assembly();
            return None;
        }

        self.assembly.extend_from_slice(&message.payload);
        if chunk.index + 1 == chunk.count {
            self.assembling = None;
            Some(std::mem::take(&mut self.assembly))
        } else {
            self.assembling = Some(ChunkInfo {
                index: chunk.index + 1,
                count: chunk.count,
            });
            None
        }
    }

    fn abandon_assembly(&mut self) {
        self.assembling = None;
        self.assembly = Vec::new();
        self.rejected = self.rejected.saturating_add(1);
    }
}
