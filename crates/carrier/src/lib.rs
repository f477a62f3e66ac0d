pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod heartbeat;
pub mod interface;
pub mod protocol;
pub mod simulator;
pub mod stats;
pub mod tracking;

pub use channel::{ChannelState, Reliability};
pub use codec::{Codec, CodecError};
pub use config::{CarrierConfig, ConfigError, DriverConfig, HeartbeatConfig, MIN_MESSAGE_PAYLOAD};
pub use connection::{Connection, ConnectionId, ConnectionManager, ConnectionState, Role};
pub use driver::{AddressFamily, SocketDriver, UdpDriver, broadcast_address, resolve_address};
pub use error::{CarrierError, DisconnectReason};
pub use heartbeat::{Heartbeat, HeartbeatHandle, HeartbeatThread};
pub use interface::{InterfaceEvent, NetworkInterface};
pub use protocol::{
    CHANNEL_COUNT, DEFAULT_PORT, Datagram, DatagramFlags, DatagramHeader, MAX_DATAGRAM_SIZE,
    Message, MessageFlags, PROTOCOL_MAGIC, PROTOCOL_VERSION, SYSTEM_CHANNEL, SystemMessage,
    sequence_distance, sequence_greater_than,
};
pub use simulator::{PacketLossSimulation, SimulatedDriver};
pub use stats::{NetworkStats, TrafficStats};
pub use tracking::{AckTracker, ReceiveTracker, SentDatagram};
