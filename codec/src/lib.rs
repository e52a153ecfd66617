// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

mod base;
mod byte_array;
mod connect_flags;
mod error;
mod header;
mod packet;
mod protocol_level;
mod stream;
pub mod topic;
pub mod utils;
mod v3;
mod var_int;

pub use base::{
    BinaryData, DecodePacket, EncodePacket, Packet, PacketId, QoS, StringData, U16Data,
    PROTOCOL_NAME,
};
pub use byte_array::{ByteArray, ByteArrayError};
pub use connect_flags::ConnectFlags;
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, PacketType};
pub use packet::MqttPacket;
pub use protocol_level::ProtocolLevel;
pub use stream::{EncodedFrame, FrameEncoder, PacketDecoder};
pub use topic::{PubTopic, SubTopic, TopicError};
pub use v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, DisconnectPacket, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    SubscribeTopic, UnsubscribeAckPacket, UnsubscribePacket,
};
pub use var_int::{VarInt, VarIntError, MAX_REMAINING_LENGTH};
