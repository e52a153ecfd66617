// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError,
};

/// Control packet type, the high nibble of the first byte of every packet.
///
/// Type codes run 1 through 15; the publish variant additionally carries its
/// flag nibble because dup/qos/retain live in the fixed header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker.
    #[default]
    Connect,

    /// Broker reply to connect request.
    ConnectAck,

    /// Publish message.
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement, first reply of `QoS` 1.
    PublishAck,

    /// Publish received, first step of the `QoS` 2 exchange.
    PublishReceived,

    /// Publish release, second step of the `QoS` 2 exchange.
    PublishRelease,

    /// Publish complete, final step of the `QoS` 2 exchange.
    PublishComplete,

    /// Client subscribe request.
    Subscribe,

    /// Subscribe acknowledgement.
    SubscribeAck,

    /// Unsubscribe request.
    Unsubscribe,

    /// Unsubscribe acknowledgement.
    UnsubscribeAck,

    /// Client ping request.
    PingRequest,

    /// Server ping response.
    PingResponse,

    /// Client is disconnecting.
    Disconnect,

    /// Authentication exchange, reserved for protocol level 5.0.
    Auth,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }

    const fn type_code(self) -> u8 {
        match self {
            Self::Connect => 1,
            Self::ConnectAck => 2,
            Self::Publish { .. } => 3,
            Self::PublishAck => 4,
            Self::PublishReceived => 5,
            Self::PublishRelease => 6,
            Self::PublishComplete => 7,
            Self::Subscribe => 8,
            Self::SubscribeAck => 9,
            Self::Unsubscribe => 10,
            Self::UnsubscribeAck => 11,
            Self::PingRequest => 12,
            Self::PingResponse => 13,
            Self::Disconnect => 14,
            Self::Auth => 15,
        }
    }

    const fn flag_bits(self) -> u8 {
        match self {
            Self::Publish { dup, qos, retain } => {
                let dup = if dup { 0b1000 } else { 0 };
                let qos = (qos as u8) << 1;
                let retain = if retain { 0b0001 } else { 0 };
                dup | qos | retain
            }
            // Bits 3,2,1,0 of the fixed header of PUBREL, SUBSCRIBE and
            // UNSUBSCRIBE are reserved and MUST be 0,0,1,0 [MQTT-3.6.1-1].
            Self::PublishRelease | Self::Subscribe | Self::Unsubscribe => 0b0010,
            _ => 0,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        (packet_type.type_code() << 4) | packet_type.flag_bits()
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from the first byte of a packet.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketFlags` if reserved flag bits carry the wrong
    /// value [MQTT-2.2.2-2], `InvalidPacketType` on an unknown type code.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        if type_bits == 3 {
            let dup = flag & 0b1000 != 0;
            let retain = flag & 0b0001 != 0;
            let qos = match flag & 0b0110 {
                0b0000 => QoS::AtMostOnce,
                0b0010 => QoS::AtLeastOnce,
                0b0100 => QoS::ExactOnce,
                _ => {
                    log::error!("header: invalid qos bits in publish flags: {flag:#06b}");
                    return Err(DecodeError::InvalidPacketFlags);
                }
            };
            // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
            if dup && qos == QoS::AtMostOnce {
                return Err(DecodeError::InvalidPacketFlags);
            }
            return Ok(Self::Publish { dup, qos, retain });
        }

        let packet_type = match type_bits {
            1 => Self::Connect,
            2 => Self::ConnectAck,
            4 => Self::PublishAck,
            5 => Self::PublishReceived,
            6 => Self::PublishRelease,
            7 => Self::PublishComplete,
            8 => Self::Subscribe,
            9 => Self::SubscribeAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubscribeAck,
            12 => Self::PingRequest,
            13 => Self::PingResponse,
            14 => Self::Disconnect,
            15 => Self::Auth,
            t => {
                log::error!("header: invalid type code: {t}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        if flag != packet_type.flag_bits() {
            log::error!("header: invalid flags {flag:#06b} for {packet_type:?}");
            return Err(DecodeError::InvalidPacketFlags);
        }
        Ok(packet_type)
    }
}

/// Fixed header part of a control packet, at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// Number of bytes in the current packet after the fixed header,
    /// variable-length encoded in one to four bytes.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is out of range.
    pub const fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = match VarInt::new(remaining_length) {
            Ok(v) => v,
            Err(err) => return Err(err),
        };
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(u8::from(self.packet_type));
        let len_bytes = self.remaining_length.encode(buf)?;
        Ok(PacketType::bytes() + len_bytes)
    }
}
