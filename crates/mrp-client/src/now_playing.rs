//! Now-playing value objects decoded from `SetStateMessage` payloads.

use mrp_proto::protocol;

pub use mrp_proto::Command;

/// Current playback metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlayingInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<f64>,
    pub elapsed_time: Option<f64>,
    pub playback_rate: Option<f32>,
}

impl From<protocol::NowPlayingInfo> for NowPlayingInfo {
    fn from(info: protocol::NowPlayingInfo) -> Self {
        Self {
            title: info.title,
            artist: info.artist,
            album: info.album,
            duration: info.duration,
            elapsed_time: info.elapsed_time,
            playback_rate: info.playback_rate,
        }
    }
}

impl NowPlayingInfo {
    /// Whether the device reports the item as currently playing.
    pub fn is_playing(&self) -> bool {
        self.playback_rate.map(|r| r > 0.0).unwrap_or(false)
    }
}

/// One command from the device's supported-commands set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedCommand {
    pub command: Command,
    pub enabled: bool,
    pub can_scrub: bool,
}

impl From<protocol::SupportedCommand> for SupportedCommand {
    fn from(cmd: protocol::SupportedCommand) -> Self {
        Self {
            command: Command::try_from(cmd.command).unwrap_or(Command::Unknown),
            enabled: cmd.enabled,
            can_scrub: cmd.can_scrub.unwrap_or(false),
        }
    }
}

/// Opaque playback queue contents, passed through to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackQueue {
    pub location: Option<i32>,
    pub contents: Vec<u8>,
}

impl From<protocol::PlaybackQueue> for PlaybackQueue {
    fn from(queue: protocol::PlaybackQueue) -> Self {
        Self {
            location: queue.location,
            contents: queue.contents,
        }
    }
}
