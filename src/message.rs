// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use bytes::Bytes;

use codec::{PublishPacket, QoS};

/// Application message delivered on the inbound stream.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub struct MqttMessage {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
}

impl MqttMessage {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// True when this is a retained message replayed by the broker rather
    /// than a live publish.
    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Take the payload out of the message without copying.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl From<PublishPacket> for MqttMessage {
    fn from(packet: PublishPacket) -> Self {
        Self {
            topic: packet.topic().to_string(),
            qos: packet.qos(),
            retain: packet.retain(),
            payload: packet.into_message(),
        }
    }
}
