//! # mrp-proto
//!
//! Wire format for the MediaRemote protocol:
//! - checked-in prost stubs for the fixed protobuf schema
//! - the varint-length frame codec

pub mod frame;
pub mod protocol;

pub use frame::{encode_frame, FrameDecoder};
pub use protocol::{
    ClientUpdatesConfigMessage, Command, ConnectionState, CryptoPairingMessage,
    DeviceInfoMessage, MessageType, NowPlayingInfo, Payload, PlaybackQueue,
    PlaybackQueueRequestMessage, ProtocolMessage, SendHidEventMessage,
    SetConnectionStateMessage, SetStateMessage, SupportedCommand, SupportedCommands,
};
