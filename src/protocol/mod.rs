//! SOE protocol v3 engine: wire codec, reliable channels, and the per-session
//! state machine that ties them together.

pub mod app;
pub mod buffer_pool;
pub mod cipher;
pub mod crc;
pub mod deserialize;
pub mod handler;
pub mod packet;
pub mod reliable;
pub mod serialize;
pub mod varint;

pub use deserialize::CodecParams;
pub use handler::{ConnectionMode, ProtocolHandler, SessionState};
pub use packet::{
    precedes, BufferSize, DisconnectReason, Packet, ProtocolOpCode, SequenceNumber, SessionId,
    SoeProtocolVersion, SOE_PROTOCOL_VERSION,
};
pub use reliable::ApplicationParameters;
