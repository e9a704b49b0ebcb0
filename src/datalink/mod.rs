//! BACnet Data Link Layer Module
//!
//! The transaction core does not drive hardware itself. It hands complete
//! NPDUs to a [`DataLink`] together with the [`Route`] they should take, and it
//! polls the same link for inbound frames. Anything that can move octets
//! between stations (a BACnet/IP socket, an MS/TP port, an in-process queue)
//! can sit behind the trait.
//!
//! # Contract
//!
//! - [`DataLink::send_pdu`] completes or fails immediately. A failure is one
//!   failed attempt; the stack does not retry at this level, the transaction
//!   timer does.
//! - [`DataLink::receive`] never blocks. `Ok(None)` means no frame is waiting.
//!
//! # Examples
//!
//! ## Implementing a Custom Data Link
//!
//! ```
//! use bacnet_tsm::datalink::{DataLink, DataLinkAddress, DataLinkType, Result};
//! use bacnet_tsm::network::{NpciData, Route};
//!
//! struct NullDataLink;
//!
//! impl DataLink for NullDataLink {
//!     fn send_pdu(&mut self, _route: &Route, _npci: &NpciData, pdu: &[u8]) -> Result<usize> {
//!         Ok(pdu.len())
//!     }
//!
//!     fn receive(&mut self) -> Result<Option<(Vec<u8>, DataLinkAddress)>> {
//!         Ok(None)
//!     }
//!
//!     fn link_type(&self) -> DataLinkType {
//!         DataLinkType::PointToPoint
//!     }
//!
//!     fn local_address(&self) -> DataLinkAddress {
//!         DataLinkAddress::MsTP(1)
//!     }
//! }
//! ```
//!
//! ## Loopback
//!
//! [`MemoryNetwork`] connects any number of [`MemoryDataLink`]s in-process:
//!
//! ```
//! use bacnet_tsm::datalink::{DataLink, DataLinkAddress, MemoryNetwork};
//! use bacnet_tsm::network::{NpciData, Route};
//!
//! let network = MemoryNetwork::new();
//! let mut a = network.attach(DataLinkAddress::MsTP(1));
//! let mut b = network.attach(DataLinkAddress::MsTP(2));
//!
//! a.send_pdu(&Route::unicast(b.local_address()), &NpciData::default(), &[0x01, 0x00]).unwrap();
//! let (frame, source) = b.receive().unwrap().unwrap();
//! assert_eq!(frame, vec![0x01, 0x00]);
//! assert_eq!(source, DataLinkAddress::MsTP(1));
//! ```

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::network::{NpciData, Route};

pub mod memory;

pub use memory::{MemoryDataLink, MemoryNetwork, Transmission};

/// Result type for data link operations.
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur during data link layer operations.
#[derive(Debug, Error)]
pub enum DataLinkError {
    /// Network I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received frame does not conform to the link's framing.
    #[error("invalid frame format")]
    InvalidFrame,

    /// Address resolution or validation failed.
    #[error("address error: {0}")]
    AddressError(String),

    /// The link could not put the frame on the wire.
    #[error("send to {destination} failed: {reason}")]
    SendFailed {
        destination: DataLinkAddress,
        reason: String,
    },

    /// Unsupported data link type for the requested operation.
    #[error("unsupported data link type")]
    UnsupportedType,
}

/// BACnet data link technologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLinkType {
    /// BACnet/IP (Annex J).
    BacnetIp,
    /// BACnet/Ethernet (ISO 8802-3).
    Ethernet,
    /// MS/TP (Master-Slave/Token-Passing).
    MsTP,
    /// PTP (Point-to-Point).
    PointToPoint,
    /// In-process link used for loopback and tests.
    Memory,
}

/// Send/receive contract between the stack and a datalink driver.
///
/// Implementations must be `Send + Sync` so a stack can be shared with the
/// async driver's tasks.
pub trait DataLink: Send + Sync {
    /// Send an encoded NPDU (network header plus APDU) along `route`.
    ///
    /// `npci` carries the control information the frame was encoded with;
    /// links that distinguish "expecting reply" frames (MS/TP) use it to pick
    /// a frame type. Returns the number of octets handed to the medium.
    fn send_pdu(&mut self, route: &Route, npci: &NpciData, pdu: &[u8]) -> Result<usize>;

    /// Fetch one waiting frame and its datalink source, or `Ok(None)`.
    fn receive(&mut self) -> Result<Option<(Vec<u8>, DataLinkAddress)>>;

    /// Get the data link type.
    fn link_type(&self) -> DataLinkType;

    /// Get the local address of this data link.
    fn local_address(&self) -> DataLinkAddress;
}

/// Data link layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataLinkAddress {
    /// IP address and port for BACnet/IP.
    Ip(SocketAddr),

    /// 6-byte MAC address for BACnet/Ethernet.
    Ethernet([u8; 6]),

    /// Station address (0-254) for MS/TP.
    MsTP(u8),

    /// Broadcast on the local link.
    Broadcast,
}

impl DataLinkAddress {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, DataLinkAddress::Broadcast)
    }
}

impl fmt::Display for DataLinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkAddress::Ip(addr) => write!(f, "{}", addr),
            DataLinkAddress::Ethernet(mac) => write!(f, "{}", hex::encode(mac)),
            DataLinkAddress::MsTP(station) => write!(f, "mstp:{}", station),
            DataLinkAddress::Broadcast => write!(f, "broadcast"),
        }
    }
}
