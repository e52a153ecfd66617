// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! High-throughput MQTT 3.1.1 client.
//!
//! One [`Client`] owns one broker connection. All protocol state, the
//! delivery engines for `QoS` 1 and 2, keep-alive and the reconnect logic
//! run on a single supervisor task; the handle is cheap to clone and safe
//! to use from many tasks at once.

pub use codec;

mod ack_router;
mod client;
mod dedup;
mod error;
mod heartbeat;
mod message;
mod options;
mod packet_id;
mod qos1;
mod qos2;
mod session;
mod status;
mod supervisor;
pub mod transport;

pub use client::{Client, Delivery, MessageStream};
pub use codec::{ProtocolLevel, PublishPacket, QoS};
pub use error::{Error, ErrorKind};
pub use message::MqttMessage;
pub use options::{ConnectOptions, RetainHandling, SubscriptionOptions, Will};
pub use status::ClientStatus;
