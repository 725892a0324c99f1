//! # mrp-client
//!
//! High-level MediaRemote client for Apple TV:
//! - [`Connection`]: the framed, variably-encrypted transport with
//!   request/response correlation
//! - [`AppleTv`]: session lifecycle, pairing and verification, key
//!   commands, now-playing subscriptions
//!
//! ## Example
//!
//! ```ignore
//! use mrp_client::{AppleTv, Key};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // `record` comes from mDNS discovery; `credentials` from an
//!     // earlier pairing.
//!     let tv = AppleTv::open(&record, Some(credentials)).await?;
//!
//!     tv.send_key_command(Key::Select).await?;
//!
//!     let mut now_playing = tv.subscribe_now_playing();
//!     while let Some(update) = now_playing.next().await {
//!         println!("{update:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod connection;
mod device;
mod events;
mod hid;
mod now_playing;

pub use connection::{Connection, RESPONSE_TIMEOUT};
pub use device::{
    AppleTv, NowPlayingSubscription, PinEntry, SupportedCommandsSubscription,
};
pub use events::DeviceEvent;
pub use hid::Key;
pub use now_playing::{Command, NowPlayingInfo, PlaybackQueue, SupportedCommand};

// Re-export commonly used types from the lower layers.
pub use mrp_core::{AddressPick, Credentials, Error, Result, ServiceRecord, TxtRecord};
pub use mrp_proto::{MessageType, Payload, ProtocolMessage};
