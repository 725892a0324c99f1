//! # mrp-pairing
//!
//! The two authentication sub-protocols of MediaRemote, reified as typed
//! state machines driven by the transport:
//! - [`PairSetup`]: SRP-6a PIN pairing (M1-M6), yielding long-term
//!   [`mrp_core::Credentials`]
//! - [`PairVerify`]: X25519 + Ed25519 session verification (M1-M3),
//!   yielding per-session [`mrp_crypto::SessionKeys`]
//!
//! Both machines consume and produce raw `pairingData` TLV blobs; the
//! caller wraps them in `CryptoPairingMessage` envelopes and feeds back
//! the device's replies, matched on sequence number.

pub mod pair_setup;
pub mod pair_verify;

pub use pair_setup::{PairSetup, PairSetupState};
pub use pair_verify::{PairVerify, PairVerifyState};
