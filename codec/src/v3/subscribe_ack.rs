// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, QoS, VarIntError,
};

/// Broker verdict for one subscribed topic filter.
///
/// Wire values are 0x00/0x01/0x02 for the granted `QoS` and 0x80 for
/// failure; everything else is malformed [MQTT-3.9.3-2].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeAck {
    /// Maximum `QoS` the broker granted for this filter.
    GrantedQoS(QoS),

    /// The broker refused this filter.
    Failed,
}

impl SubscribeAck {
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::GrantedQoS(_))
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(Self::GrantedQoS(QoS::AtMostOnce)),
            0x01 => Ok(Self::GrantedQoS(QoS::AtLeastOnce)),
            0x02 => Ok(Self::GrantedQoS(QoS::ExactOnce)),
            0x80 => Ok(Self::Failed),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

impl From<SubscribeAck> for u8 {
    fn from(ack: SubscribeAck) -> Self {
        match ack {
            SubscribeAck::GrantedQoS(qos) => qos as u8,
            SubscribeAck::Failed => 0x80,
        }
    }
}

/// Reply to a subscribe packet.
///
/// The payload carries one return code per filter, in the order the filters
/// appeared in the subscribe packet.
///
/// ```txt
/// +---------------------------+
/// | Fixed header              |
/// |                           |
/// +---------------------------+
/// | Packet id                 |
/// |                           |
/// +---------------------------+
/// | Ack 0                     |
/// +---------------------------+
/// | Ack N ...                 |
/// +---------------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    /// Identical to the packet id of the subscribe packet being answered.
    packet_id: PacketId,

    acknowledgements: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn new(packet_id: PacketId, ack: SubscribeAck) -> Self {
        Self {
            packet_id,
            acknowledgements: vec![ack],
        }
    }

    #[must_use]
    pub fn with_vec(packet_id: PacketId, acknowledgements: Vec<SubscribeAck>) -> Self {
        Self {
            packet_id,
            acknowledgements,
        }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acknowledgements(&self) -> &[SubscribeAck] {
        &self.acknowledgements
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = PacketId::bytes() + self.acknowledgements.len();
        FixedHeader::new(PacketType::SubscribeAck, remaining_length)
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }

        let packet_id = PacketId::decode(ba)?;

        let mut acknowledgements = Vec::new();
        let mut consumed = PacketId::bytes();
        while consumed < fixed_header.remaining_length() {
            let ack = SubscribeAck::try_from(ba.read_byte()?)?;
            consumed += 1;
            acknowledgements.push(ack);
        }

        Ok(Self {
            packet_id,
            acknowledgements,
        })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        for ack in &self.acknowledgements {
            buf.push(u8::from(*ack));
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for SubscribeAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubscribeAck
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed_codes() {
        let packet = SubscribeAckPacket::with_vec(
            PacketId::new(3),
            vec![
                SubscribeAck::GrantedQoS(QoS::AtLeastOnce),
                SubscribeAck::Failed,
            ],
        );
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x90, 0x04, 0x00, 0x03, 0x01, 0x80]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribeAckPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_invalid_return_code_is_malformed() {
        let buf = [0x90, 0x03, 0x00, 0x03, 0x03];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscribeAckPacket::decode(&mut ba),
            Err(DecodeError::InvalidQoS)
        );
    }
}
