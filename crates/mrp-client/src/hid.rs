//! Remote-control key commands as HID events.
//!
//! Keys map to fixed (usage page, usage id) pairs carried in the
//! `hid_event_data` blob of a `SendHIDEventMessage`. A press is two
//! frames: down then up.

use std::str::FromStr;
use std::time::Duration;

use mrp_core::error::Error;

/// Symbolic remote-control keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Up,
    Down,
    Left,
    Right,
    Menu,
    Select,
    Suspend,
    WakeUp,
    Play,
    Pause,
    Next,
    Previous,
    Topmenu,
    Home,
    HomeHold,
    VolumeUp,
    VolumeDown,
}

impl Key {
    /// The HID (usage page, usage id) pair for this key.
    pub fn usage(self) -> (u16, u16) {
        match self {
            Key::Up => (1, 0x8C),
            Key::Down => (1, 0x8D),
            Key::Left => (1, 0x8B),
            Key::Right => (1, 0x8A),
            Key::Menu => (1, 0x86),
            Key::Select => (1, 0x89),
            Key::Suspend => (1, 0x82),
            Key::WakeUp => (1, 0x83),
            Key::Play => (12, 0xB0),
            Key::Pause => (12, 0xB1),
            Key::Next => (12, 0xB5),
            Key::Previous => (12, 0xB6),
            Key::Topmenu => (12, 0x60),
            Key::Home => (12, 0x40),
            Key::HomeHold => (12, 0x40),
            Key::VolumeUp => (12, 0xE9),
            Key::VolumeDown => (12, 0xEA),
        }
    }

    /// Hold keys insert a delay between the down and up frames.
    pub fn hold_duration(self) -> Option<Duration> {
        match self {
            Key::HomeHold => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Key::Up),
            "down" => Ok(Key::Down),
            "left" => Ok(Key::Left),
            "right" => Ok(Key::Right),
            "menu" => Ok(Key::Menu),
            "select" => Ok(Key::Select),
            "suspend" => Ok(Key::Suspend),
            "wake_up" => Ok(Key::WakeUp),
            "play" => Ok(Key::Play),
            "pause" => Ok(Key::Pause),
            "next" => Ok(Key::Next),
            "previous" => Ok(Key::Previous),
            "topmenu" => Ok(Key::Topmenu),
            "home" => Ok(Key::Home),
            "home_hold" => Ok(Key::HomeHold),
            "volume_up" => Ok(Key::VolumeUp),
            "volume_down" => Ok(Key::VolumeDown),
            _ => Err(Error::Usage("unknown key name")),
        }
    }
}

/// Byte range of the spliced (page, usage, down) triple.
const EVENT_RANGE: std::ops::Range<usize> = 30..36;

/// Fixed 44-byte scaffold for `hid_event_data`. The first eight bytes are
/// the timestamp stub observed in live captures; the (page, usage, down)
/// triple is spliced at [30..36] as three little-endian u16s.
const HID_EVENT_TEMPLATE: [u8; 44] = [
    0x43, 0x89, 0x22, 0xCF, 0x08, 0x02, 0x00, 0x00, // timestamp stub
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x01, 0x00, 0x00, 0x00, 0x20, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // (page, usage, down)
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //
];

/// Build the `hid_event_data` blob for one key transition.
pub fn hid_event_data(page: u16, usage: u16, down: bool) -> Vec<u8> {
    let mut data = HID_EVENT_TEMPLATE.to_vec();
    let triple = &mut data[EVENT_RANGE];
    triple[0..2].copy_from_slice(&page.to_le_bytes());
    triple[2..4].copy_from_slice(&usage.to_le_bytes());
    triple[4..6].copy_from_slice(&u16::from(down).to_le_bytes());
    data
}
