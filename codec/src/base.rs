// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

use crate::utils::{validate_utf8_string, StringError};
use crate::{ByteArray, DecodeError, EncodeError, PacketType, VarIntError};

/// Protocol name field in a connect packet can only hold this value.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Parse a packet from a byte stream.
pub trait DecodePacket: Sized {
    /// Read packet fields from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes do not form a valid packet of this type.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Serialize a packet into a byte buffer.
pub trait EncodePacket {
    /// Append this packet to `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if a field does not fit its wire representation.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Common surface of every concrete packet struct.
pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Get total byte length in packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns error if packet size exceeds the remaining-length range.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Delivery guarantee of a publish packet.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// Nonzero 16-bit value correlating a request packet with its acknowledgement.
///
/// Required on subscribe, unsubscribe and publish packets of `QoS` 1 or 2.
/// The zero value is reserved as "no identifier" for `QoS` 0 publishes.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

/// UTF-8 string field, length-prefixed with a two byte big-endian integer.
///
/// The character data must be well-formed UTF-8 and must not include an
/// encoding of the null character [MQTT-1.5.3-2]. Length is limited to
/// 65535 bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringData(String);

impl StringData {
    /// Validate `data` and wrap it as a string field.
    ///
    /// # Errors
    ///
    /// Returns error if `data` is too long or contains NUL.
    pub fn from(data: &str) -> Result<Self, StringError> {
        validate_utf8_string(data)?;
        Ok(Self(data.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get byte length in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for StringData {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for StringData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let s = ba.read_string(len)?;
        Ok(Self(s))
    }
}

impl EncodePacket for StringData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Opaque binary field, length-prefixed with a two byte big-endian integer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinaryData(Vec<u8>);

impl BinaryData {
    /// Wrap `data` as a binary field.
    ///
    /// # Errors
    ///
    /// Returns error if `data` is longer than 65535 bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, StringError> {
        if data.len() > u16::MAX as usize {
            return Err(StringError::TooLong);
        }
        Ok(Self(data.to_vec()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get byte length in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<[u8]> for BinaryData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DecodePacket for BinaryData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let bytes = ba.read_bytes(len)?;
        Ok(Self(bytes.to_vec()))
    }
}

impl EncodePacket for BinaryData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(&self.0)?;
        Ok(self.bytes())
    }
}

/// Two byte big-endian integer field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct U16Data(u16);

impl U16Data {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl DecodePacket for U16Data {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for U16Data {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_data() {
        let s = StringData::from("MQTT").unwrap();
        let mut buf = Vec::new();
        assert_eq!(s.encode(&mut buf).unwrap(), 6);
        assert_eq!(&buf, &[0x00, 0x04, b'M', b'Q', b'T', b'T']);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(StringData::decode(&mut ba).unwrap(), s);
    }

    #[test]
    fn test_string_data_rejects_nul() {
        assert!(StringData::from("a\0b").is_err());
    }

    #[test]
    fn test_packet_id_round_trip() {
        let id = PacketId::new(0x1234);
        let mut buf = Vec::new();
        id.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x12, 0x34]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba).unwrap(), id);
    }
}
