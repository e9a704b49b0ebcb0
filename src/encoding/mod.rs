//! BACnet Encoding/Decoding Module
//!
//! This module provides the primitives shared by the framing codecs in
//! [`network`](crate::network) and [`app`](crate::app):
//!
//! - [`FrameError`], the error every frame decoder and bounded encoder returns
//! - [`FrameWriter`] / [`FrameReader`], cursors over caller-supplied buffers that
//!   refuse to write past capacity or read past the end of input
//! - The handful of ASHRAE 135 clause 20.2 tag primitives the core needs:
//!   unsigned, enumerated and object identifier application tags, plus
//!   context-tagged unsigned values (Who-Is limits)
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::encoding::*;
//!
//! let mut buffer = Vec::new();
//! encode_enumerated(&mut buffer, 31);
//! let (value, consumed) = decode_enumerated(&buffer).unwrap();
//! assert_eq!((value, consumed), (31, 2));
//! ```

use thiserror::Error;

/// Result type for tag encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during tag encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// Buffer underflow during decoding
    #[error("buffer underflow during decoding")]
    BufferUnderflow,
    /// Invalid tag number encountered
    #[error("invalid tag number encountered")]
    InvalidTag,
    /// Invalid length value
    #[error("invalid length value")]
    InvalidLength,
    /// Value out of valid range
    #[error("value out of valid range")]
    ValueOutOfRange,
}

/// Errors produced by the NPDU/APDU framing codecs.
///
/// Decoders never read past the supplied input and bounded encoders never
/// write past the supplied buffer; both report the violation here instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Input ended before a mandatory field
    #[error("frame truncated: needed {needed} more byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    /// Output buffer too small for the encoded frame
    #[error("buffer capacity exceeded: {needed} byte(s) needed, {capacity} available")]
    CapacityExceeded { needed: usize, capacity: usize },
    /// NPDU protocol version other than 1
    #[error("unsupported NPDU protocol version {0}")]
    InvalidVersion(u8),
    /// PDU type nibble outside 0..=7
    #[error("unknown PDU type {0}")]
    UnknownPduType(u8),
    /// A field holds a value the protocol does not allow
    #[error("invalid {0} field")]
    InvalidField(&'static str),
    /// A tagged value inside the header failed to decode
    #[error("malformed tagged value: {0}")]
    Encoding(#[from] EncodingError),
}

/// Bounded writer over a caller-supplied buffer.
#[derive(Debug)]
pub struct FrameWriter<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn put_u8(&mut self, value: u8) -> std::result::Result<(), FrameError> {
        self.put_slice(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> std::result::Result<(), FrameError> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_slice(&mut self, data: &[u8]) -> std::result::Result<(), FrameError> {
        let end = self.pos + data.len();
        if end > self.buffer.len() {
            return Err(FrameError::CapacityExceeded {
                needed: end,
                capacity: self.buffer.len(),
            });
        }
        self.buffer[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }
}

/// Cursor over received bytes that reports truncation instead of panicking.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn u8(&mut self) -> std::result::Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> std::result::Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Everything not consumed yet
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag),
        }
    }
}

fn push_tag(buffer: &mut Vec<u8>, first_octet: u8, length: usize) {
    if length < 5 {
        buffer.push(first_octet | length as u8);
        return;
    }

    buffer.push(first_octet | 5);
    if length < 254 {
        buffer.push(length as u8);
    } else if length < 65536 {
        buffer.push(254);
        buffer.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        buffer.push(255);
        buffer.extend_from_slice(&(length as u32).to_be_bytes());
    }
}

/// Decode the extended length that follows a tag octet whose LVT is 5.
fn decode_extended_length(data: &[u8]) -> Result<(usize, usize)> {
    let len_byte = *data.get(1).ok_or(EncodingError::BufferUnderflow)?;
    match len_byte {
        0..=253 => Ok((len_byte as usize, 2)),
        254 => {
            let bytes = data.get(2..4).ok_or(EncodingError::BufferUnderflow)?;
            Ok((u16::from_be_bytes([bytes[0], bytes[1]]) as usize, 4))
        }
        255 => {
            let bytes = data.get(2..6).ok_or(EncodingError::BufferUnderflow)?;
            Ok((
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
                6,
            ))
        }
    }
}

/// Encode a BACnet application tag
pub fn encode_application_tag(buffer: &mut Vec<u8>, tag: ApplicationTag, length: usize) {
    push_tag(buffer, (tag as u8) << 4, length);
}

/// Decode a BACnet application tag, returning (tag, length, header bytes consumed)
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    let tag_byte = *data.first().ok_or(EncodingError::InvalidTag)?;
    if tag_byte & 0x08 != 0 {
        return Err(EncodingError::InvalidTag);
    }

    let tag = ApplicationTag::try_from(tag_byte >> 4)?;
    match tag_byte & 0x07 {
        5 => {
            let (length, consumed) = decode_extended_length(data)?;
            Ok((tag, length, consumed))
        }
        length => Ok((tag, length as usize, 1)),
    }
}

/// Minimal big-endian octets for an unsigned value (at least one octet).
fn unsigned_octets(value: u32) -> ([u8; 4], usize) {
    let bytes = value.to_be_bytes();
    let len = match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    (bytes, len)
}

fn decode_unsigned_octets(data: &[u8]) -> Result<u32> {
    if data.is_empty() || data.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    Ok(data.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

fn decode_tagged_unsigned(data: &[u8], expected: ApplicationTag) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != expected {
        return Err(EncodingError::InvalidTag);
    }

    let octets = data
        .get(consumed..consumed + length)
        .ok_or(EncodingError::BufferUnderflow)?;
    Ok((decode_unsigned_octets(octets)?, consumed + length))
}

/// Encode a BACnet unsigned integer
pub fn encode_unsigned(buffer: &mut Vec<u8>, value: u32) {
    let (bytes, len) = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::UnsignedInt, len);
    buffer.extend_from_slice(&bytes[4 - len..]);
}

/// Decode a BACnet unsigned integer
pub fn decode_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    decode_tagged_unsigned(data, ApplicationTag::UnsignedInt)
}

/// Encode a BACnet enumerated value
pub fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let (bytes, len) = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::Enumerated, len);
    buffer.extend_from_slice(&bytes[4 - len..]);
}

/// Decode a BACnet enumerated value
pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    decode_tagged_unsigned(data, ApplicationTag::Enumerated)
}

/// Encode a BACnet object identifier
pub fn encode_object_identifier(buffer: &mut Vec<u8>, object_type: u16, instance: u32) -> Result<()> {
    if object_type > 0x3FF || instance > 0x3F_FFFF {
        return Err(EncodingError::ValueOutOfRange);
    }

    let object_id = ((object_type as u32) << 22) | instance;
    encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4);
    buffer.extend_from_slice(&object_id.to_be_bytes());
    Ok(())
}

/// Decode a BACnet object identifier into (object type, instance)
pub fn decode_object_identifier(data: &[u8]) -> Result<((u16, u32), usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;

    if tag != ApplicationTag::ObjectIdentifier {
        return Err(EncodingError::InvalidTag);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }

    let bytes = data
        .get(consumed..consumed + 4)
        .ok_or(EncodingError::BufferUnderflow)?;
    let object_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    Ok((((object_id >> 22) as u16, object_id & 0x3F_FFFF), consumed + 4))
}

/// Encode a context-tagged unsigned integer
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }

    let (bytes, len) = unsigned_octets(value);
    push_tag(buffer, 0x08 | (tag_number << 4), len);
    buffer.extend_from_slice(&bytes[4 - len..]);
    Ok(())
}

/// Decode a context tag header, returning (tag number, length, header bytes consumed)
pub fn decode_context_tag(data: &[u8]) -> Result<(u8, usize, usize)> {
    let tag_byte = *data.first().ok_or(EncodingError::InvalidTag)?;
    if tag_byte & 0x08 == 0 {
        return Err(EncodingError::InvalidTag);
    }

    let tag_number = tag_byte >> 4;
    match tag_byte & 0x07 {
        5 => {
            let (length, consumed) = decode_extended_length(data)?;
            Ok((tag_number, length, consumed))
        }
        length => Ok((tag_number, length as usize, 1)),
    }
}

/// Decode a context-tagged unsigned integer carrying `tag_number`
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_context_tag(data)?;
    if tag != tag_number {
        return Err(EncodingError::InvalidTag);
    }

    let octets = data
        .get(consumed..consumed + length)
        .ok_or(EncodingError::BufferUnderflow)?;
    Ok((decode_unsigned_octets(octets)?, consumed + length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_unsigned() {
        let mut buffer = Vec::new();
        for &test_value in &[0, 1, 255, 256, 65535, 65536, 16777215, 16777216, u32::MAX] {
            buffer.clear();
            encode_unsigned(&mut buffer, test_value);
            let (value, consumed) = decode_unsigned(&buffer).unwrap();
            assert_eq!(value, test_value);
            assert_eq!(consumed, buffer.len());
        }
    }

    #[test]
    fn test_enumerated_wire_format() {
        let mut buffer = Vec::new();
        encode_enumerated(&mut buffer, 2);
        assert_eq!(buffer, vec![0x91, 0x02]);

        buffer.clear();
        encode_enumerated(&mut buffer, 300);
        assert_eq!(buffer, vec![0x92, 0x01, 0x2C]);
        assert_eq!(decode_enumerated(&buffer).unwrap(), (300, 3));
    }

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let mut buffer = Vec::new();
        encode_unsigned(&mut buffer, 7);
        assert_eq!(decode_enumerated(&buffer), Err(EncodingError::InvalidTag));
    }

    #[test]
    fn test_short_value_is_underflow() {
        // Unsigned tag claiming two octets, only one present
        assert_eq!(decode_unsigned(&[0x22, 0x01]), Err(EncodingError::BufferUnderflow));
    }

    #[test]
    fn test_encode_decode_object_identifier() {
        let mut buffer = Vec::new();
        encode_object_identifier(&mut buffer, 8, 4_194_303).unwrap();
        assert_eq!(buffer[0], 0xC4);
        let ((object_type, instance), consumed) = decode_object_identifier(&buffer).unwrap();
        assert_eq!(object_type, 8);
        assert_eq!(instance, 4_194_303);
        assert_eq!(consumed, 5);

        assert_eq!(
            encode_object_identifier(&mut buffer, 8, 4_194_304),
            Err(EncodingError::ValueOutOfRange)
        );
    }

    #[test]
    fn test_context_unsigned() {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, 123).unwrap();
        encode_context_unsigned(&mut buffer, 1, 70000).unwrap();
        assert_eq!(buffer, vec![0x09, 0x7B, 0x1B, 0x01, 0x11, 0x70]);

        let (low, consumed) = decode_context_unsigned(&buffer, 0).unwrap();
        let (high, _) = decode_context_unsigned(&buffer[consumed..], 1).unwrap();
        assert_eq!((low, high), (123, 70000));

        assert_eq!(
            decode_context_unsigned(&buffer, 1),
            Err(EncodingError::InvalidTag)
        );
    }

    #[test]
    fn test_frame_writer_refuses_overflow() {
        let mut storage = [0u8; 3];
        let mut writer = FrameWriter::new(&mut storage);
        writer.put_u16(0xBAC0).unwrap();
        assert_eq!(
            writer.put_u16(1),
            Err(FrameError::CapacityExceeded {
                needed: 4,
                capacity: 3
            })
        );
        writer.put_u8(7).unwrap();
        assert_eq!(writer.position(), 3);
        assert_eq!(storage, [0xBA, 0xC0, 7]);
    }

    #[test]
    fn test_frame_reader_reports_truncation() {
        let mut reader = FrameReader::new(&[1, 2, 3]);
        assert_eq!(reader.u16().unwrap(), 0x0102);
        assert_eq!(
            reader.take(4),
            Err(FrameError::Truncated {
                offset: 2,
                needed: 3
            })
        );
        assert_eq!(reader.rest(), &[3]);
        assert_eq!(reader.remaining(), 0);
    }
}
