// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use codec::utils::{random_string, validate_client_id};
use codec::{ProtocolLevel, QoS};

use crate::error::{Error, ErrorKind};

/// How the broker replays retained messages on a new subscription,
/// protocol 5.0 only.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetainHandling {
    /// Send retained messages at subscribe time.
    #[default]
    SendAtSubscribe = 0,

    /// Send retained messages only if the subscription did not exist.
    SendAtSubscribeIfNew = 1,

    /// Never send retained messages for this subscription.
    DoNotSendAtSubscribe = 2,
}

/// Per-subscription options of protocol 5.0.
///
/// Carried in the session state for forward compatibility; a 3.1.1
/// subscribe packet has no place for them and they are ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Do not echo messages published by this client back to it.
    pub no_local: bool,

    /// Forward messages with the retain flag as published.
    pub retain_as_published: bool,

    pub retain_handling: RetainHandling,
}

/// Message the broker publishes on this client's behalf if the connection
/// drops without a disconnect packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything configurable about one client connection.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectOptions {
    address: String,
    client_id: String,
    protocol_version: ProtocolLevel,
    username: Option<String>,
    password: Option<Vec<u8>>,
    clean_session: bool,
    keep_alive_seconds: u16,
    max_reconnect_attempts: u32,
    publish_retry_interval: Duration,
    max_publish_retries: u32,
    max_retained_packet_ids: usize,
    packet_id_retention: Duration,
    maximum_packet_size: u32,
    ack_timeout: Duration,
    enable_telemetry: bool,
    will: Option<Will>,
}

impl ConnectOptions {
    /// Create options for a broker at `address` (`host:port`) with a random
    /// client id and defaults everywhere else.
    #[must_use]
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client_id: random_string(12),
            protocol_version: ProtocolLevel::V311,
            username: None,
            password: None,
            clean_session: true,
            keep_alive_seconds: 60,
            max_reconnect_attempts: 10,
            publish_retry_interval: Duration::from_secs(5),
            max_publish_retries: 3,
            max_retained_packet_ids: 1000,
            packet_id_retention: Duration::from_secs(5),
            maximum_packet_size: 128 * 1024,
            ack_timeout: Duration::from_secs(5),
            enable_telemetry: true,
            will: None,
        }
    }

    /// Check the options are internally consistent.
    ///
    /// # Errors
    ///
    /// Returns error if the client id is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        validate_client_id(&self.client_id)
            .map_err(|err| Error::from_string(ErrorKind::InvalidClientId, format!("{err:?}")))
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Set the client identifier. An empty id asks the broker to assign
    /// one, which also forces a clean session.
    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_protocol_version(&mut self, version: ProtocolLevel) -> &mut Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub const fn protocol_version(&self) -> ProtocolLevel {
        self.protocol_version
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        self.password = Some(password.to_vec());
        self
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Heartbeat interval in seconds; zero disables keep-alive probing.
    pub fn set_keep_alive_seconds(&mut self, keep_alive_seconds: u16) -> &mut Self {
        self.keep_alive_seconds = keep_alive_seconds;
        self
    }

    #[must_use]
    pub const fn keep_alive_seconds(&self) -> u16 {
        self.keep_alive_seconds
    }

    /// How many failed connection attempts in a row the client tolerates
    /// before giving up for good.
    pub fn set_max_reconnect_attempts(&mut self, attempts: u32) -> &mut Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    /// How long a `QoS` 1/2 publish waits for its acknowledgement before
    /// being retransmitted.
    pub fn set_publish_retry_interval(&mut self, interval: Duration) -> &mut Self {
        self.publish_retry_interval = interval;
        self
    }

    #[must_use]
    pub const fn publish_retry_interval(&self) -> Duration {
        self.publish_retry_interval
    }

    pub fn set_max_publish_retries(&mut self, retries: u32) -> &mut Self {
        self.max_publish_retries = retries;
        self
    }

    #[must_use]
    pub const fn max_publish_retries(&self) -> u32 {
        self.max_publish_retries
    }

    /// Capacity of the per-topic duplicate-suppression window.
    pub fn set_max_retained_packet_ids(&mut self, capacity: usize) -> &mut Self {
        self.max_retained_packet_ids = capacity;
        self
    }

    #[must_use]
    pub const fn max_retained_packet_ids(&self) -> usize {
        self.max_retained_packet_ids
    }

    /// How long a packet id stays in the duplicate-suppression window.
    pub fn set_packet_id_retention(&mut self, retention: Duration) -> &mut Self {
        self.packet_id_retention = retention;
        self
    }

    #[must_use]
    pub const fn packet_id_retention(&self) -> Duration {
        self.packet_id_retention
    }

    /// Packets larger than this are rejected rather than sent, and inbound
    /// frames claiming more than this tear the connection down.
    pub fn set_maximum_packet_size(&mut self, size: u32) -> &mut Self {
        self.maximum_packet_size = size;
        self
    }

    #[must_use]
    pub const fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Deadline for connect/subscribe/unsubscribe acknowledgements.
    pub fn set_ack_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn set_enable_telemetry(&mut self, enable: bool) -> &mut Self {
        self.enable_telemetry = enable;
        self
    }

    #[must_use]
    pub const fn enable_telemetry(&self) -> bool {
        self.enable_telemetry
    }

    pub fn set_will(&mut self, will: Will) -> &mut Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }
}
