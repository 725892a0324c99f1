//! Device events.
//!
//! Every consumer of an [`crate::AppleTv`] observes the session through
//! this enum, delivered over `tokio::sync::broadcast` channels obtained
//! from [`crate::AppleTv::events`] or the typed subscription handles.

use mrp_proto::ProtocolMessage;

use crate::now_playing::{NowPlayingInfo, PlaybackQueue, SupportedCommand};

/// Events emitted by an open device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Transport connected.
    Connected,
    /// Transport closed; terminal.
    Closed,
    /// Fatal connection error.
    Error(String),
    /// Protocol-level diagnostics (dropped frames, odd payloads).
    Debug(String),
    /// Every decoded inbound envelope, solicited or not.
    Message(ProtocolMessage),
    /// Now-playing state changed; `None` means nothing is playing.
    NowPlaying(Option<NowPlayingInfo>),
    /// The device's supported command set changed.
    SupportedCommands(Vec<SupportedCommand>),
    /// Playback queue contents arrived.
    PlaybackQueue(PlaybackQueue),
}
