//! Discovered service descriptor.
//!
//! mDNS discovery is an external collaborator; it hands the client a
//! resolved `ServiceRecord` with the addresses, port and TXT fields of an
//! `_mediaremotetv._tcp` instance.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

/// TXT record fields the client consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    /// `Name` field: human-readable device name.
    pub name: String,
    /// `UniqueIdentifier` field: stable device identifier.
    pub unique_identifier: String,
}

/// Address selection policy.
///
/// When a device advertises several addresses the second entry is
/// empirically the routable IPv4, so it is the default pick. Callers who
/// know better can force a specific entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressPick {
    /// Prefer `addresses[1]` when present, else `addresses[0]`.
    #[default]
    PreferSecond,
    /// Always `addresses[0]`.
    First,
    /// A specific index; out of range falls back to `addresses[0]`.
    Index(usize),
}

/// A resolved MediaRemote service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Display name from the service instance.
    pub name: String,
    /// All advertised addresses (IPv4 and IPv6).
    pub addresses: Vec<IpAddr>,
    /// TCP port of the MediaRemote service.
    pub port: u16,
    /// Parsed TXT record.
    pub txt: TxtRecord,
}

impl ServiceRecord {
    /// Select the address to dial according to `pick`.
    pub fn select_address(&self, pick: AddressPick) -> Option<IpAddr> {
        let addr = match pick {
            AddressPick::PreferSecond if self.addresses.len() > 1 => self.addresses.get(1),
            AddressPick::Index(i) if i < self.addresses.len() => self.addresses.get(i),
            _ => self.addresses.first(),
        }
        .copied();

        if let Some(a) = addr {
            debug!(address = %a, ?pick, "selected device address");
        }
        addr
    }

    /// The dial target with the default address pick.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr_with(AddressPick::default())
    }

    /// The dial target with an explicit address pick.
    pub fn socket_addr_with(&self, pick: AddressPick) -> Option<SocketAddr> {
        self.select_address(pick).map(|a| SocketAddr::new(a, self.port))
    }
}
