//! # mrp-core
//!
//! Core types shared by the MediaRemote client crates:
//! - the error taxonomy
//! - the discovered-service descriptor handed over by mDNS discovery
//! - persistent pairing credentials

pub mod credentials;
pub mod error;
pub mod service;

pub use credentials::Credentials;
pub use error::{Error, Result};
pub use service::{AddressPick, ServiceRecord, TxtRecord};
