//! BACnet Network Layer Module
//!
//! This module implements the parts of the ASHRAE 135 network layer a non-routing
//! node needs: the NPDU header codec and the [`Route`] value that tells the stack
//! where a frame goes (or where it came from).
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU contains:
//! - Protocol version
//! - Control information (priority, data expecting reply, etc.)
//! - Destination network address (DNET, DLEN, DADR)
//! - Source network address (SNET, SLEN, SADR)
//! - Hop count, present whenever a destination is present
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::network::*;
//!
//! let mut buffer = [0u8; 16];
//! let len = encode_npdu(
//!     &mut buffer,
//!     Some(&NetworkAddress::global_broadcast()),
//!     None,
//!     &NpciData::default(),
//! )
//! .unwrap();
//! assert_eq!(&buffer[..len], &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
//!
//! let (npdu, offset) = decode_npdu(&buffer[..len]).unwrap();
//! assert_eq!(offset, len);
//! assert!(npdu.destination.unwrap().is_global_broadcast());
//! ```

use std::fmt;

use crate::datalink::DataLinkAddress;
use crate::encoding::{FrameError, FrameReader, FrameWriter};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Protocol version carried in every NPDU
pub const BACNET_PROTOCOL_VERSION: u8 = 1;

/// Network number that addresses every network
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// Longest station address carried in DADR/SADR
pub const MAX_MAC_LEN: usize = 7;

/// Network layer message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    InitializeRoutingTable = 0x06,
    InitializeRoutingTableAck = 0x07,
    EstablishConnectionToNetwork = 0x08,
    DisconnectConnectionToNetwork = 0x09,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl NetworkMessageType {
    /// Standard message type for `value`; `None` for reserved and
    /// vendor-proprietary types
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::WhoIsRouterToNetwork),
            0x01 => Some(Self::IAmRouterToNetwork),
            0x02 => Some(Self::ICouldBeRouterToNetwork),
            0x03 => Some(Self::RejectMessageToNetwork),
            0x04 => Some(Self::RouterBusyToNetwork),
            0x05 => Some(Self::RouterAvailableToNetwork),
            0x06 => Some(Self::InitializeRoutingTable),
            0x07 => Some(Self::InitializeRoutingTableAck),
            0x08 => Some(Self::EstablishConnectionToNetwork),
            0x09 => Some(Self::DisconnectConnectionToNetwork),
            0x12 => Some(Self::WhatIsNetworkNumber),
            0x13 => Some(Self::NetworkNumberIs),
            _ => None,
        }
    }
}

/// Network priority (control octet bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum NetworkPriority {
    #[default]
    Normal = 0,
    Urgent = 1,
    CriticalEquipment = 2,
    LifeSafety = 3,
}

impl NetworkPriority {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => NetworkPriority::Normal,
            1 => NetworkPriority::Urgent,
            2 => NetworkPriority::CriticalEquipment,
            _ => NetworkPriority::LifeSafety,
        }
    }
}

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    pub priority: NetworkPriority,
}

impl NpduControl {
    /// Create control byte from flags
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte | self.priority as u8
    }

    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: NetworkPriority::from_bits(byte),
        }
    }
}

/// Per-frame network control information supplied by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpciData {
    pub expecting_reply: bool,
    pub priority: NetworkPriority,
    /// Initial hop count, written only when a destination is present
    pub hop_count: u8,
}

impl Default for NpciData {
    fn default() -> Self {
        Self {
            expecting_reply: false,
            priority: NetworkPriority::Normal,
            hop_count: 255,
        }
    }
}

impl NpciData {
    pub fn expecting_reply() -> Self {
        Self {
            expecting_reply: true,
            ..Self::default()
        }
    }
}

/// Station address on a BACnet network, stored inline so routes stay `Copy`.
///
/// A zero-length address is a broadcast on the network it belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress {
    bytes: [u8; MAX_MAC_LEN],
    len: u8,
}

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress {
        bytes: [0; MAX_MAC_LEN],
        len: 0,
    };

    /// Build from raw bytes; `None` if longer than [`MAX_MAC_LEN`]
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_MAC_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_MAC_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", hex::encode(self.as_slice()))
    }
}

/// Network address (network number + station address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress {
    /// Network number (65535 = all networks)
    pub network: u16,
    /// Station address on that network, empty for broadcast
    pub address: MacAddress,
}

impl NetworkAddress {
    pub fn new(network: u16, address: MacAddress) -> Self {
        Self { network, address }
    }

    /// DNET 0xFFFF, DLEN 0
    pub fn global_broadcast() -> Self {
        Self::new(GLOBAL_BROADCAST_NETWORK, MacAddress::BROADCAST)
    }

    /// Broadcast on one remote network
    pub fn remote_broadcast(network: u16) -> Self {
        Self::new(network, MacAddress::BROADCAST)
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK
    }

    pub fn is_broadcast(&self) -> bool {
        self.is_global_broadcast() || self.address.is_empty()
    }
}

/// Network Protocol Data Unit header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    pub control: NpduControl,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    /// Hop count (only present if destination is present)
    pub hop_count: Option<u8>,
    /// Message type of a network layer message
    pub message_type: Option<u8>,
}

impl Npdu {
    /// Check if this is a network layer message
    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Named type of a network layer message
    pub fn network_message_type(&self) -> Option<NetworkMessageType> {
        self.message_type.and_then(NetworkMessageType::from_u8)
    }

    /// True when the frame names a specific remote network, which only a
    /// router may act on.
    pub fn is_for_remote_network(&self) -> bool {
        matches!(self.destination, Some(dest) if !dest.is_global_broadcast())
    }

    /// Bounded encode into `buffer`, returning bytes written
    pub fn encode_into(&self, buffer: &mut [u8]) -> Result<usize> {
        let mut writer = FrameWriter::new(buffer);

        writer.put_u8(self.version)?;
        writer.put_u8(self.control.to_byte())?;

        if let Some(dest) = &self.destination {
            writer.put_u16(dest.network)?;
            writer.put_u8(dest.address.len() as u8)?;
            writer.put_slice(dest.address.as_slice())?;
        }

        if let Some(src) = &self.source {
            writer.put_u16(src.network)?;
            writer.put_u8(src.address.len() as u8)?;
            writer.put_slice(src.address.as_slice())?;
        }

        if self.destination.is_some() {
            writer.put_u8(self.hop_count.unwrap_or(255))?;
        }

        if self.control.network_message {
            let message_type = self
                .message_type
                .ok_or(FrameError::InvalidField("network message type"))?;
            writer.put_u8(message_type)?;
        }

        Ok(writer.position())
    }

    /// Decode an NPDU header, returning it with the offset of the payload
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut reader = FrameReader::new(data);

        let version = reader.u8()?;
        if version != BACNET_PROTOCOL_VERSION {
            return Err(FrameError::InvalidVersion(version));
        }

        let control = NpduControl::from_byte(reader.u8()?);

        let destination = if control.destination_present {
            Some(read_address(&mut reader, "DLEN", true)?)
        } else {
            None
        };

        let source = if control.source_present {
            let source = read_address(&mut reader, "SLEN", false)?;
            if source.network == GLOBAL_BROADCAST_NETWORK {
                return Err(FrameError::InvalidField("SNET"));
            }
            Some(source)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            Some(reader.u8()?)
        } else {
            None
        };

        let message_type = if control.network_message {
            let message_type = reader.u8()?;
            // Proprietary network messages carry a vendor id
            if message_type >= 0x80 {
                reader.u16()?;
            }
            Some(message_type)
        } else {
            None
        };

        let npdu = Npdu {
            version,
            control,
            destination,
            source,
            hop_count,
            message_type,
        };
        Ok((npdu, reader.position()))
    }
}

fn read_address(
    reader: &mut FrameReader<'_>,
    length_field: &'static str,
    allow_empty: bool,
) -> Result<NetworkAddress> {
    let network = reader.u16()?;
    let len = reader.u8()? as usize;
    if (len == 0 && !allow_empty) || len > MAX_MAC_LEN {
        return Err(FrameError::InvalidField(length_field));
    }
    let address =
        MacAddress::from_slice(reader.take(len)?).ok_or(FrameError::InvalidField(length_field))?;
    Ok(NetworkAddress::new(network, address))
}

/// Encode an application NPDU header into `buffer`, returning bytes written.
pub fn encode_npdu(
    buffer: &mut [u8],
    destination: Option<&NetworkAddress>,
    source: Option<&NetworkAddress>,
    npci: &NpciData,
) -> Result<usize> {
    let npdu = Npdu {
        version: BACNET_PROTOCOL_VERSION,
        control: NpduControl {
            network_message: false,
            destination_present: destination.is_some(),
            source_present: source.is_some(),
            expecting_reply: npci.expecting_reply,
            priority: npci.priority,
        },
        destination: destination.copied(),
        source: source.copied(),
        hop_count: destination.map(|_| npci.hop_count),
        message_type: None,
    };
    npdu.encode_into(buffer)
}

/// Decode an NPDU header, returning it with the offset of the payload.
pub fn decode_npdu(data: &[u8]) -> Result<(Npdu, usize)> {
    Npdu::decode(data)
}

/// How a [`Route`] reaches its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteScope {
    Unicast,
    LocalBroadcast,
    RemoteBroadcast,
    GlobalBroadcast,
}

/// Where a frame goes, or where one came from.
///
/// `next_hop` is the datalink address handed to the driver. `remote` is the
/// network-layer destination (DNET/DADR) for traffic that leaves the local
/// network through a router, or the SNET/SADR of routed inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub next_hop: DataLinkAddress,
    pub remote: Option<NetworkAddress>,
    pub scope: RouteScope,
}

impl Route {
    /// Station on the local network
    pub fn unicast(next_hop: DataLinkAddress) -> Self {
        Self {
            next_hop,
            remote: None,
            scope: RouteScope::Unicast,
        }
    }

    /// Station on a remote network, reached through `router`
    pub fn routed(router: DataLinkAddress, remote: NetworkAddress) -> Self {
        Self {
            next_hop: router,
            remote: Some(remote),
            scope: RouteScope::Unicast,
        }
    }

    pub fn local_broadcast() -> Self {
        Self {
            next_hop: DataLinkAddress::Broadcast,
            remote: None,
            scope: RouteScope::LocalBroadcast,
        }
    }

    pub fn global_broadcast() -> Self {
        Self {
            next_hop: DataLinkAddress::Broadcast,
            remote: Some(NetworkAddress::global_broadcast()),
            scope: RouteScope::GlobalBroadcast,
        }
    }

    pub fn remote_broadcast(network: u16) -> Self {
        Self {
            next_hop: DataLinkAddress::Broadcast,
            remote: Some(NetworkAddress::remote_broadcast(network)),
            scope: RouteScope::RemoteBroadcast,
        }
    }

    /// Route back to the sender of an inbound frame
    pub fn from_source(datalink_source: DataLinkAddress, npdu_source: Option<NetworkAddress>) -> Self {
        match npdu_source {
            Some(remote) => Self::routed(datalink_source, remote),
            None => Self::unicast(datalink_source),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.scope != RouteScope::Unicast
    }

    /// DNET/DADR to put in the NPDU header
    pub fn npdu_destination(&self) -> Option<NetworkAddress> {
        self.remote
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.scope, &self.remote) {
            (RouteScope::GlobalBroadcast, _) => write!(f, "global-broadcast"),
            (RouteScope::LocalBroadcast, _) => write!(f, "local-broadcast"),
            (RouteScope::RemoteBroadcast, Some(remote)) => {
                write!(f, "broadcast on network {}", remote.network)
            }
            (_, Some(remote)) => write!(
                f,
                "{}:{} via {}",
                remote.network,
                hex::encode(remote.address.as_slice()),
                self.next_hop
            ),
            (_, None) => write!(f, "{}", self.next_hop),
        }
    }
}
