pub mod codec;
mod loopback;
mod protocol;
mod stats;
mod transport;

pub use codec::{DecodeError, EncodeError};
pub use loopback::{LoopbackHub, LoopbackProvider};
pub use protocol::{
    DEFAULT_MAX_MESSAGES_PER_POLL, HOST_IDENTITY, MAX_STRING_LEN, NetworkIdentity, Packet,
    PacketKind, PlatformId, Reliability,
};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{
    EventInbox, EventSink, NetworkProvider, PeerHandle, ProviderEvent, TransportAdapter,
    TransportError, TransportEvent, event_channel,
};
