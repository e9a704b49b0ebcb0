//! BACnet Application Layer Module
//!
//! This module implements the application layer of the stack:
//!
//! - [`Apdu`]: the eight APDU types with their segmentation control fields
//! - [`invoke_id`]: allocation of the one-octet invoke-id namespace
//! - [`segmentation`]: outbound windowed segment transmission and inbound
//!   reassembly
//! - [`tsm`]: the Transaction State Machine pool that correlates requests with
//!   their replies, drives retries and timeouts and reports every transaction's
//!   outcome exactly once
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::app::*;
//!
//! let apdu = Apdu::SimpleAck {
//!     invoke_id: 7,
//!     service_choice: 15,
//! };
//! let mut buffer = [0u8; 8];
//! let len = apdu.encode_into(&mut buffer).unwrap();
//! assert_eq!(&buffer[..len], &[0x20, 0x07, 0x0F]);
//! assert_eq!(Apdu::decode(&buffer[..len]).unwrap(), apdu);
//! ```

use bitflags::bitflags;

use crate::encoding::{decode_enumerated, encode_enumerated, FrameError, FrameReader, FrameWriter};

pub mod invoke_id;
pub mod segmentation;
pub mod tsm;

pub use invoke_id::InvokeIdAllocator;
pub use segmentation::{OutboundSegments, Reassembly, SegmentationError};
pub use tsm::{
    Completion, CompletionCallback, InboundRequest, OriginatorRequest, Outcome, ResponderHandle,
    TransactionHandle, TransactionPool, TransactionState, Transmit, TsmActions, TsmError,
    TsmStatistics,
};

/// Result type for application layer framing
pub type Result<T> = std::result::Result<T, FrameError>;

/// Smallest max-APDU any BACnet device may advertise
pub const MIN_APDU_LENGTH: usize = 50;

/// Largest max-APDU (BACnet/IP, Ethernet)
pub const MAX_APDU_LENGTH: usize = 1476;

/// Header octets of a segmented confirmed request up to and including the
/// service choice
pub const CONFIRMED_SEGMENT_HEADER_LEN: usize = 6;

/// Header octets of a segmented ComplexACK up to and including the service
/// choice
pub const COMPLEX_ACK_SEGMENT_HEADER_LEN: usize = 5;

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(FrameError::UnknownPduType(other)),
        }
    }
}

bitflags! {
    /// Low nibble of the first octet of request and ComplexACK PDUs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PduFlags: u8 {
        const SEGMENTED = 0x08;
        const MORE_FOLLOWS = 0x04;
        const SEGMENTED_RESPONSE_ACCEPTED = 0x02;
    }
}

bitflags! {
    /// Low nibble of the first octet of SegmentACK and Abort PDUs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AckFlags: u8 {
        const NEGATIVE = 0x02;
        const SERVER = 0x01;
    }
}

/// Segmentation fields of a segmented request or ComplexACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub sequence_number: u8,
    /// Proposed window size, 1..=127
    pub window_size: u8,
    pub more_follows: bool,
}

/// Application Protocol Data Unit
///
/// Service choices stay raw octets so that a request for a service this node
/// does not know can still be decoded and rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segment: Option<SegmentHeader>,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segment: Option<SegmentHeader>,
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u32,
        error_code: u32,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Largest encoding that does not promise more than `count` segments
    pub fn for_count(count: usize) -> Self {
        match count {
            0..=1 => MaxSegments::Unspecified,
            2..=3 => MaxSegments::Two,
            4..=7 => MaxSegments::Four,
            8..=15 => MaxSegments::Eight,
            16..=31 => MaxSegments::Sixteen,
            32..=63 => MaxSegments::ThirtyTwo,
            64 => MaxSegments::SixtyFour,
            _ => MaxSegments::GreaterThan64,
        }
    }

    /// Segment limit this value promises; `None` when unspecified or unbounded
    pub fn limit(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits & 0x0F {
            0 => Ok(MaxApduSize::Up50),
            1 => Ok(MaxApduSize::Up128),
            2 => Ok(MaxApduSize::Up206),
            3 => Ok(MaxApduSize::Up480),
            4 => Ok(MaxApduSize::Up1024),
            5 => Ok(MaxApduSize::Up1476),
            _ => Err(FrameError::InvalidField("max-APDU")),
        }
    }

    /// Largest encoding not exceeding `length`
    pub fn for_length(length: usize) -> Self {
        match length {
            0..=127 => MaxApduSize::Up50,
            128..=205 => MaxApduSize::Up128,
            206..=479 => MaxApduSize::Up206,
            480..=1023 => MaxApduSize::Up480,
            1024..=1475 => MaxApduSize::Up1024,
            _ => MaxApduSize::Up1476,
        }
    }
}

/// Fixed-size scratch for the header octets of an APDU.
struct Header {
    bytes: [u8; 16],
    len: usize,
}

impl Header {
    fn new() -> Self {
        Self {
            bytes: [0; 16],
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.bytes[self.len] = byte;
        self.len += 1;
    }

    fn extend(&mut self, data: &[u8]) {
        self.bytes[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Apdu {
    pub fn pdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke id of every PDU type except Unconfirmed-Request
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    fn header(&self) -> Header {
        let mut header = Header::new();
        let type_bits = (self.pdu_type() as u8) << 4;

        match self {
            Apdu::ConfirmedRequest {
                segment,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                service_choice,
                ..
            } => {
                let mut flags = segment_flags(segment);
                flags.set(
                    PduFlags::SEGMENTED_RESPONSE_ACCEPTED,
                    *segmented_response_accepted,
                );
                header.push(type_bits | flags.bits());
                header.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                header.push(*invoke_id);
                if let Some(segment) = segment {
                    header.push(segment.sequence_number);
                    header.push(segment.window_size);
                }
                header.push(*service_choice);
            }

            Apdu::UnconfirmedRequest { service_choice, .. } => {
                header.push(type_bits);
                header.push(*service_choice);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                header.extend(&[type_bits, *invoke_id, *service_choice]);
            }

            Apdu::ComplexAck {
                segment,
                invoke_id,
                service_choice,
                ..
            } => {
                header.push(type_bits | segment_flags(segment).bits());
                header.push(*invoke_id);
                if let Some(segment) = segment {
                    header.push(segment.sequence_number);
                    header.push(segment.window_size);
                }
                header.push(*service_choice);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                window_size,
            } => {
                let mut flags = AckFlags::empty();
                flags.set(AckFlags::NEGATIVE, *negative);
                flags.set(AckFlags::SERVER, *server);
                header.extend(&[
                    type_bits | flags.bits(),
                    *invoke_id,
                    *sequence_number,
                    *window_size,
                ]);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                header.extend(&[type_bits, *invoke_id, *service_choice]);
                let mut tags = Vec::with_capacity(10);
                encode_enumerated(&mut tags, *error_class);
                encode_enumerated(&mut tags, *error_code);
                header.extend(&tags);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                header.extend(&[type_bits, *invoke_id, *reject_reason]);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let flags = if *server {
                    AckFlags::SERVER
                } else {
                    AckFlags::empty()
                };
                header.extend(&[type_bits | flags.bits(), *invoke_id, *abort_reason]);
            }
        }

        header
    }

    fn body(&self) -> &[u8] {
        match self {
            Apdu::ConfirmedRequest { service_data, .. }
            | Apdu::UnconfirmedRequest { service_data, .. }
            | Apdu::ComplexAck { service_data, .. } => service_data,
            _ => &[],
        }
    }

    /// Octets [`encode_into`](Self::encode_into) will write
    pub fn encoded_len(&self) -> usize {
        self.header().len + self.body().len()
    }

    /// Bounded encode into `buffer`, returning bytes written
    pub fn encode_into(&self, buffer: &mut [u8]) -> Result<usize> {
        let header = self.header();
        let body = self.body();

        let needed = header.len + body.len();
        if needed > buffer.len() {
            return Err(FrameError::CapacityExceeded {
                needed,
                capacity: buffer.len(),
            });
        }

        let mut writer = FrameWriter::new(buffer);
        writer.put_slice(header.as_slice())?;
        writer.put_slice(body)?;
        Ok(writer.position())
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let body = self.body();
        let mut buffer = Vec::with_capacity(header.len + body.len());
        buffer.extend_from_slice(header.as_slice());
        buffer.extend_from_slice(body);
        buffer
    }

    /// Decode APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(data);
        let first = reader.u8()?;
        let pdu_type = ApduType::try_from(first >> 4)?;

        let apdu = match pdu_type {
            ApduType::ConfirmedRequest => {
                let flags = PduFlags::from_bits_truncate(first);
                let max_info = reader.u8()?;
                let invoke_id = reader.u8()?;
                let segment = read_segment_header(&mut reader, flags)?;
                let service_choice = reader.u8()?;

                Apdu::ConfirmedRequest {
                    segment,
                    segmented_response_accepted: flags
                        .contains(PduFlags::SEGMENTED_RESPONSE_ACCEPTED),
                    max_segments: MaxSegments::from_bits(max_info >> 4),
                    max_response_size: MaxApduSize::from_bits(max_info)?,
                    invoke_id,
                    service_choice,
                    service_data: reader.rest().to_vec(),
                }
            }

            ApduType::UnconfirmedRequest => Apdu::UnconfirmedRequest {
                service_choice: reader.u8()?,
                service_data: reader.rest().to_vec(),
            },

            ApduType::SimpleAck => Apdu::SimpleAck {
                invoke_id: reader.u8()?,
                service_choice: reader.u8()?,
            },

            ApduType::ComplexAck => {
                let flags = PduFlags::from_bits_truncate(first);
                let invoke_id = reader.u8()?;
                let segment = read_segment_header(&mut reader, flags)?;
                let service_choice = reader.u8()?;

                Apdu::ComplexAck {
                    segment,
                    invoke_id,
                    service_choice,
                    service_data: reader.rest().to_vec(),
                }
            }

            ApduType::SegmentAck => {
                let flags = AckFlags::from_bits_truncate(first);
                Apdu::SegmentAck {
                    negative: flags.contains(AckFlags::NEGATIVE),
                    server: flags.contains(AckFlags::SERVER),
                    invoke_id: reader.u8()?,
                    sequence_number: reader.u8()?,
                    window_size: reader.u8()?,
                }
            }

            ApduType::Error => {
                let invoke_id = reader.u8()?;
                let service_choice = reader.u8()?;
                let rest = reader.rest();
                let (error_class, consumed) = decode_enumerated(rest)?;
                let (error_code, _) = decode_enumerated(&rest[consumed..])?;

                Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class,
                    error_code,
                }
            }

            ApduType::Reject => Apdu::Reject {
                invoke_id: reader.u8()?,
                reject_reason: reader.u8()?,
            },

            ApduType::Abort => Apdu::Abort {
                server: AckFlags::from_bits_truncate(first).contains(AckFlags::SERVER),
                invoke_id: reader.u8()?,
                abort_reason: reader.u8()?,
            },
        };

        Ok(apdu)
    }
}

fn segment_flags(segment: &Option<SegmentHeader>) -> PduFlags {
    match segment {
        Some(segment) if segment.more_follows => PduFlags::SEGMENTED | PduFlags::MORE_FOLLOWS,
        Some(_) => PduFlags::SEGMENTED,
        None => PduFlags::empty(),
    }
}

fn read_segment_header(
    reader: &mut FrameReader<'_>,
    flags: PduFlags,
) -> Result<Option<SegmentHeader>> {
    if !flags.contains(PduFlags::SEGMENTED) {
        return Ok(None);
    }

    Ok(Some(SegmentHeader {
        sequence_number: reader.u8()?,
        window_size: reader.u8()?,
        more_follows: flags.contains(PduFlags::MORE_FOLLOWS),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::EncodingError;

    #[test]
    fn test_unconfirmed_request_encode_decode() {
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: 8,                      // WhoIs
            service_data: vec![0x09, 0x7B, 0x19, 0x7B], // Range 123-123
        };

        let encoded = apdu.encode();
        assert_eq!(encoded[..2], [0x10, 0x08]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_confirmed_request_wire_format() {
        let apdu = Apdu::ConfirmedRequest {
            segment: None,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 123,
            service_choice: 12, // ReadProperty
            service_data: vec![0x0C, 0x02, 0x00, 0x00, 0x08, 0x19, 0x55],
        };

        let encoded = apdu.encode();
        assert_eq!(encoded[..4], [0x02, 0x05, 123, 12]);
        assert_eq!(apdu.encoded_len(), encoded.len());
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segmented_complex_ack() {
        let apdu = Apdu::ComplexAck {
            segment: Some(SegmentHeader {
                sequence_number: 3,
                window_size: 4,
                more_follows: true,
            }),
            invoke_id: 9,
            service_choice: 12,
            service_data: vec![0xAA; 10],
        };

        let encoded = apdu.encode();
        assert_eq!(encoded[..COMPLEX_ACK_SEGMENT_HEADER_LEN], [0x3C, 9, 3, 4, 12]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segmented_request_header_length() {
        let apdu = Apdu::ConfirmedRequest {
            segment: Some(SegmentHeader {
                sequence_number: 0,
                window_size: 2,
                more_follows: false,
            }),
            segmented_response_accepted: false,
            max_segments: MaxSegments::Four,
            max_response_size: MaxApduSize::Up480,
            invoke_id: 1,
            service_choice: 15,
            service_data: vec![],
        };
        assert_eq!(apdu.encode(), vec![0x08, 0x23, 1, 0, 2, 15]);
        assert_eq!(apdu.encoded_len(), CONFIRMED_SEGMENT_HEADER_LEN);
    }

    #[test]
    fn test_segment_ack_and_abort_flags() {
        let ack = Apdu::SegmentAck {
            negative: true,
            server: true,
            invoke_id: 5,
            sequence_number: 7,
            window_size: 8,
        };
        assert_eq!(ack.encode(), vec![0x43, 5, 7, 8]);
        assert_eq!(Apdu::decode(&ack.encode()).unwrap(), ack);

        let abort = Apdu::Abort {
            server: true,
            invoke_id: 5,
            abort_reason: 4,
        };
        assert_eq!(abort.encode(), vec![0x71, 5, 4]);
        assert_eq!(Apdu::decode(&[0x70, 5, 4]).unwrap().invoke_id(), Some(5));
    }

    #[test]
    fn test_error_pdu_uses_enumerated_tags() {
        let apdu = Apdu::Error {
            invoke_id: 1,
            service_choice: 12,
            error_class: 2,  // property
            error_code: 32,  // unknown-property
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x50, 1, 12, 0x91, 2, 0x91, 32]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);

        assert_eq!(
            Apdu::decode(&[0x50, 1, 12, 0x91, 2]),
            Err(FrameError::Encoding(EncodingError::InvalidTag))
        );
    }

    #[test]
    fn test_decode_truncated_and_unknown() {
        assert!(matches!(Apdu::decode(&[]), Err(FrameError::Truncated { .. })));
        assert!(matches!(
            Apdu::decode(&[0x00, 0x05, 1]),
            Err(FrameError::Truncated { offset: 3, .. })
        ));
        // Segmented flag set but sequence/window missing
        assert!(matches!(
            Apdu::decode(&[0x38, 1]),
            Err(FrameError::Truncated { .. })
        ));
        assert_eq!(Apdu::decode(&[0x80, 0]), Err(FrameError::UnknownPduType(8)));
        assert_eq!(
            Apdu::decode(&[0x00, 0x07, 1, 12]),
            Err(FrameError::InvalidField("max-APDU"))
        );
    }

    #[test]
    fn test_encode_into_respects_capacity() {
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: 8,
            service_data: vec![0; 10],
        };
        let mut small = [0u8; 11];
        assert_eq!(
            apdu.encode_into(&mut small),
            Err(FrameError::CapacityExceeded {
                needed: 12,
                capacity: 11
            })
        );
        assert_eq!(small, [0u8; 11]);

        let mut exact = [0u8; 12];
        assert_eq!(apdu.encode_into(&mut exact), Ok(12));
    }

    #[test]
    fn test_max_apdu_size() {
        assert_eq!(MaxApduSize::Up50.size(), 50);
        assert_eq!(MaxApduSize::Up128.size(), 128);
        assert_eq!(MaxApduSize::Up1476.size(), 1476);
        assert_eq!(MaxApduSize::for_length(1476), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::for_length(1000), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::for_length(50), MaxApduSize::Up50);
    }

    #[test]
    fn test_max_segments() {
        assert_eq!(MaxSegments::for_count(64), MaxSegments::SixtyFour);
        assert_eq!(MaxSegments::for_count(10), MaxSegments::Eight);
        assert_eq!(MaxSegments::for_count(1), MaxSegments::Unspecified);
        assert_eq!(MaxSegments::from_bits(4).limit(), Some(16));
        assert_eq!(MaxSegments::GreaterThan64.limit(), None);
    }
}
