//! Protobuf stubs for the MediaRemote envelope.
//!
//! The schema set is fixed by the device side, so the message types are
//! checked in as prost structs rather than generated at build time. The
//! outer `ProtocolMessage` carries a `type` discriminator and at most one
//! inner message; the oneof field tags equal the corresponding `Type`
//! values. Envelopes whose `type` is not in the enum still decode (the
//! raw value is preserved and `payload` is `None`) and are surfaced to
//! listeners unchanged.

use mrp_core::error::DecodeError;
use prost::Message;

/// Outer envelope for every frame on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolMessage {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    /// Correlation UUID; present on requests that expect a response and
    /// echoed back on the response.
    #[prost(string, optional, tag = "2")]
    pub identifier: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub priority: Option<i32>,
    #[prost(
        oneof = "Payload",
        tags = "15, 20, 22, 24, 38, 42, 44"
    )]
    pub payload: Option<Payload>,
}

/// Message type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    DeviceInfoMessage = 15,
    CryptoPairingMessage = 20,
    SetConnectionStateMessage = 22,
    ClientUpdatesConfigMessage = 24,
    SendHidEventMessage = 38,
    SetStateMessage = 42,
    PlaybackQueueRequestMessage = 44,
}

/// Type-selected inner message. Field tags match `MessageType` values.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "15")]
    DeviceInfo(DeviceInfoMessage),
    #[prost(message, tag = "20")]
    CryptoPairing(CryptoPairingMessage),
    #[prost(message, tag = "22")]
    SetConnectionState(SetConnectionStateMessage),
    #[prost(message, tag = "24")]
    ClientUpdatesConfig(ClientUpdatesConfigMessage),
    #[prost(message, tag = "38")]
    SendHidEvent(SendHidEventMessage),
    #[prost(message, tag = "42")]
    SetState(SetStateMessage),
    #[prost(message, tag = "44")]
    PlaybackQueueRequest(PlaybackQueueRequestMessage),
}

impl Payload {
    /// The `MessageType` this payload selects.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::DeviceInfo(_) => MessageType::DeviceInfoMessage,
            Payload::CryptoPairing(_) => MessageType::CryptoPairingMessage,
            Payload::SetConnectionState(_) => MessageType::SetConnectionStateMessage,
            Payload::ClientUpdatesConfig(_) => MessageType::ClientUpdatesConfigMessage,
            Payload::SendHidEvent(_) => MessageType::SendHidEventMessage,
            Payload::SetState(_) => MessageType::SetStateMessage,
            Payload::PlaybackQueueRequest(_) => MessageType::PlaybackQueueRequestMessage,
        }
    }
}

/// Introduction message exchanged in plaintext right after connect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceInfoMessage {
    #[prost(string, tag = "1")]
    pub unique_identifier: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub model: String,
    #[prost(string, optional, tag = "4")]
    pub system_build_version: Option<String>,
    #[prost(int32, tag = "5")]
    pub protocol_version: i32,
    #[prost(bool, tag = "6")]
    pub supports_system_pairing: bool,
    #[prost(bool, tag = "7")]
    pub supports_acl: bool,
    #[prost(bool, tag = "8")]
    pub supports_shared_queue: bool,
    #[prost(bool, tag = "9")]
    pub supports_extended_motion: bool,
    #[prost(bool, tag = "10")]
    pub allows_pairing: bool,
    #[prost(uint32, optional, tag = "11")]
    pub shared_queue_version: Option<u32>,
}

/// Carrier for pair-setup and pair-verify TLV blobs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CryptoPairingMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub pairing_data: Vec<u8>,
    #[prost(int32, optional, tag = "2")]
    pub status: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionState {
    Undefined = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetConnectionStateMessage {
    #[prost(enumeration = "ConnectionState", tag = "1")]
    pub state: i32,
}

/// Update subscriptions requested from the device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientUpdatesConfigMessage {
    #[prost(bool, tag = "1")]
    pub now_playing_updates: bool,
    #[prost(bool, tag = "2")]
    pub artwork_updates: bool,
    #[prost(bool, tag = "3")]
    pub keyboard_updates: bool,
    #[prost(bool, tag = "4")]
    pub volume_updates: bool,
}

/// HID key event carrier; `hid_event_data` is the fixed 44-byte blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendHidEventMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub hid_event_data: Vec<u8>,
}

/// Device-pushed playback state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStateMessage {
    #[prost(message, optional, tag = "1")]
    pub now_playing_info: Option<NowPlayingInfo>,
    #[prost(message, optional, tag = "2")]
    pub supported_commands: Option<SupportedCommands>,
    #[prost(message, optional, tag = "3")]
    pub playback_queue: Option<PlaybackQueue>,
    #[prost(int32, optional, tag = "4")]
    pub playback_state: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NowPlayingInfo {
    #[prost(string, optional, tag = "1")]
    pub album: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub artist: Option<String>,
    #[prost(double, optional, tag = "3")]
    pub duration: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub elapsed_time: Option<f64>,
    #[prost(float, optional, tag = "5")]
    pub playback_rate: Option<f32>,
    #[prost(string, optional, tag = "6")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub unique_identifier: Option<String>,
    #[prost(double, optional, tag = "8")]
    pub timestamp: Option<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SupportedCommands {
    #[prost(message, repeated, tag = "1")]
    pub supported_commands: Vec<SupportedCommand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Command {
    Unknown = 0,
    Play = 1,
    Pause = 2,
    TogglePlayPause = 3,
    Stop = 4,
    NextTrack = 5,
    PreviousTrack = 6,
    SeekToPlaybackPosition = 7,
    SkipForward = 8,
    SkipBackward = 9,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SupportedCommand {
    #[prost(enumeration = "Command", tag = "1")]
    pub command: i32,
    #[prost(bool, tag = "2")]
    pub enabled: bool,
    #[prost(bool, optional, tag = "3")]
    pub can_scrub: Option<bool>,
}

/// Opaque playback queue contents.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlaybackQueue {
    #[prost(int32, optional, tag = "1")]
    pub location: Option<i32>,
    #[prost(bytes = "vec", tag = "2")]
    pub contents: Vec<u8>,
}

/// Poll request for the playback queue / now-playing state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlaybackQueueRequestMessage {
    #[prost(int32, tag = "1")]
    pub location: i32,
    #[prost(int32, tag = "2")]
    pub length: i32,
    #[prost(int32, tag = "3")]
    pub artwork_width: i32,
    #[prost(int32, tag = "4")]
    pub artwork_height: i32,
    #[prost(string, tag = "5")]
    pub request_id: String,
}

impl ProtocolMessage {
    /// Build an envelope around a payload, stamping the matching `type`.
    pub fn from_payload(payload: Payload) -> Self {
        Self {
            r#type: payload.message_type() as i32,
            identifier: None,
            priority: None,
            payload: Some(payload),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The decoded `type`, if it is one the stubs know about.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }

    /// Serialize to protobuf bytes.
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserialize from protobuf bytes.
    pub fn decode_from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(data).map_err(|e| DecodeError::Envelope(e.to_string()))
    }
}
