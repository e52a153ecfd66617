// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, PubTopic, QoS, VarIntError,
};

/// `PublishPacket` transports an application message, in either direction.
///
/// Basic structure:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name length     |
/// |                       |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// |                       |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// The packet identifier is present only when `QoS` is 1 or 2.
///
/// Expected response:
/// * `QoS` 0, none
/// * `QoS` 1, `PublishAckPacket`
/// * `QoS` 2, `PublishReceivedPacket`
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// True when this packet might be a re-delivery of an earlier attempt.
    /// Must be false when `QoS` is 0.
    dup: bool,

    /// Level of assurance for delivery.
    qos: QoS,

    /// When true the broker stores this message as the topic's retained
    /// value and hands it to future subscribers.
    retain: bool,

    /// Topic name, no wildcard characters.
    topic: PubTopic,

    /// Zero when `QoS` is 0.
    packet_id: PacketId,

    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            qos,
            topic,
            msg: Bytes::copy_from_slice(msg),
            ..Self::default()
        })
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update the `dup` flag.
    ///
    /// # Errors
    ///
    /// The DUP flag MUST be 0 for all `QoS` 0 messages [MQTT-3.3.1-2], so
    /// setting it on one is an error.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketType);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// The packet identifier field is only present when `QoS` is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    /// Take the payload out of the packet without copying.
    #[must_use]
    pub fn into_message(self) -> Bytes {
        self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }
        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        let topic = PubTopic::decode(ba)?;

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            // SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0)
            // control packets MUST contain a non-zero packet identifier
            // [MQTT-2.3.1-1].
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        // A zero length payload is valid.
        let mut msg_len = fixed_header
            .remaining_length()
            .checked_sub(topic.bytes())
            .ok_or(DecodeError::InvalidRemainingLength)?;
        if qos != QoS::AtMostOnce {
            msg_len = msg_len
                .checked_sub(PacketId::bytes())
                .ok_or(DecodeError::InvalidRemainingLength)?;
        }

        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }
        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        }
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
    fn test_encode_qos0() {
        let packet = PublishPacket::new("topic", QoS::AtMostOnce, b"hello world").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf,
            &[
                0x30, 0x12, // fixed header, remaining length 18
                0x00, 0x05, b't', b'o', b'p', b'i', b'c', // topic
                b'h', b'e', b'l', b'l', b'o', b' ', b'w', b'o', b'r', b'l', b'd',
            ]
        );
    }

    #[test]
    fn test_round_trip_qos2() {
        let mut packet = PublishPacket::new("topic", QoS::ExactOnce, &[0, 1, 2, 3]).unwrap();
        packet.set_packet_id(PacketId::new(2));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.packet_id(), PacketId::new(2));
        assert_eq!(decoded.message(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_zero_packet_id_with_qos1_is_malformed() {
        // PUBLISH qos=1, topic "t", id 0
        let buf = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }

    #[test]
    fn test_topic_longer_than_body_is_malformed() {
        // remaining length 4 but topic field claims 10 bytes
        let buf = [0x30, 0x04, 0x00, 0x0a, b'a', b'b'];
        let mut ba = ByteArray::new(&buf);
        assert!(PublishPacket::decode(&mut ba).is_err());
    }

    #[test]
    fn test_set_dup_on_qos0_is_rejected() {
        let mut packet = PublishPacket::new("t", QoS::AtMostOnce, b"x").unwrap();
        assert!(packet.set_dup(true).is_err());
    }
}
