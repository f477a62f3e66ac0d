use bitflags::bitflags;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::codec::CodecError;
use crate::error::DisconnectReason;

pub const MAX_DATAGRAM_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u16 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4352_4952;
pub const DEFAULT_PORT: u16 = 33450;

pub const CHANNEL_COUNT: usize = 4;
pub const SYSTEM_CHANNEL: u8 = 3;

/// Number of datagrams behind the latest ack that the ack bitfield covers.
pub const ACK_WINDOW: u16 = 32;

/// Upper bounds on the archived size of a datagram and of one message,
/// excluding payload bytes. Used when packing messages into a datagram.
pub const DATAGRAM_OVERHEAD: usize = 64;
pub const MESSAGE_OVERHEAD: usize = 40;

const SEQUENCE_WRAP_THRESHOLD: u16 = u16::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Signed number of steps from `from` to `to`, modulo 2^16.
#[inline]
pub fn sequence_distance(from: u16, to: u16) -> i32 {
    to.wrapping_sub(from) as i16 as i32
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DatagramFlags: u8 {
        /// `ack` and `ack_bitfield` are meaningful.
        const HAS_ACK = 1 << 0;
        /// Sent by the heartbeat path with no payload of its own.
        const KEEP_ALIVE = 1 << 1;
        /// Sender has not finished the handshake yet.
        const CONNECTING = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        const RELIABLE = 1 << 0;
        const CHUNKED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct DatagramHeader {
    pub magic: u32,
    pub version: u16,
    pub sequence: u16,
    pub ack: u16,
    pub ack_bitfield: u32,
    pub flags: u8,
}

impl DatagramHeader {
    pub fn new(sequence: u16, flags: DatagramFlags) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack: 0,
            ack_bitfield: 0,
            flags: flags.bits(),
        }
    }

    pub fn with_ack(mut self, ack: u16, ack_bitfield: u32) -> Self {
        self.ack = ack;
        self.ack_bitfield = ack_bitfield;
        self.flags |= DatagramFlags::HAS_ACK.bits();
        self
    }

    pub fn flags(&self) -> DatagramFlags {
        DatagramFlags::from_bits_truncate(self.flags)
    }

    pub fn ack_data(&self) -> Option<(u16, u32)> {
        self.flags()
            .contains(DatagramFlags::HAS_ACK)
            .then_some((self.ack, self.ack_bitfield))
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ChunkInfo {
    pub index: u16,
    pub count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Message {
    pub channel: u8,
    pub flags: u8,
    pub sequence: u16,
    pub reliable_sequence: u16,
    pub chunk: Option<ChunkInfo>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(channel: u8, flags: MessageFlags, payload: Vec<u8>) -> Self {
        Self {
            channel,
            flags: flags.bits(),
            sequence: 0,
            reliable_sequence: 0,
            chunk: None,
            payload,
        }
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.flags)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags().contains(MessageFlags::RELIABLE)
    }

    pub fn is_chunked(&self) -> bool {
        self.flags().contains(MessageFlags::CHUNKED)
    }

    pub fn estimated_size(&self) -> usize {
        MESSAGE_OVERHEAD + self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Datagram {
    pub header: DatagramHeader,
    pub messages: Vec<Message>,
}

impl Datagram {
    pub fn new(header: DatagramHeader) -> Self {
        Self {
            header,
            messages: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        DATAGRAM_OVERHEAD + self.messages.iter().map(Message::estimated_size).sum::<usize>()
    }

    /// Version and salt of the first `ConnectRequest` carried on the system
    /// channel, if any.
    pub fn connect_request(&self) -> Option<(u16, u64)> {
        self.messages
            .iter()
            .filter(|m| m.channel == SYSTEM_CHANNEL)
            .find_map(|m| match SystemMessage::decode(&m.payload) {
                Ok(SystemMessage::ConnectRequest { version, salt }) => Some((version, salt)),
                _ => None,
            })
    }

    /// Reason of the first `ConnectDenied` on the system channel, if any.
    pub fn connect_denied(&self) -> Option<DisconnectReason> {
        self.messages
            .iter()
            .filter(|m| m.channel == SYSTEM_CHANNEL)
            .find_map(|m| match SystemMessage::decode(&m.payload) {
                Ok(SystemMessage::ConnectDenied { reason }) => Some(reason),
                _ => None,
            })
    }
}

/// Control traffic carried on [`SYSTEM_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum SystemMessage {
    ConnectRequest { version: u16, salt: u64 },
    ConnectChallenge { server_salt: u64, challenge: u64 },
    ChallengeResponse { combined_salt: u64 },
    ConnectAccepted { connection_id: u32 },
    ConnectDenied { reason: DisconnectReason },
    Disconnect { reason: DisconnectReason },
    ClockSync { time_ms: u64 },
}

impl SystemMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(CodecError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut aligned: AlignedVec = AlignedVec::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(CodecError::Deserialize)
    }
}
