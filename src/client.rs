// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use codec::topic::{validate_pub_topic, validate_sub_topic};
use codec::{PublishPacket, QoS};

use crate::error::Error;
use crate::message::MqttMessage;
use crate::options::{ConnectOptions, SubscriptionOptions};
use crate::status::ClientStatus;
use crate::supervisor::{Command, Supervisor};
use crate::transport::{Connector, TcpConnector};

fn client_gone() -> Error {
    Error::transport_lost("client task has terminated")
}

/// Handle to one broker connection.
///
/// Cheap to clone; every clone talks to the same supervisor task. Once the
/// client goes terminal (explicit disconnect or exhausted reconnect
/// budget) every call fails with `TransportLoss`.
#[derive(Clone, Debug)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel_tokens: Arc<AtomicU64>,
    status: Arc<AtomicU8>,
}

/// Inbound half of a client: application messages from subscribed topics,
/// in broker order per topic.
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<MqttMessage>,
}

impl MessageStream {
    /// Wait for the next message. `None` once the client has terminated.
    pub async fn next(&mut self) -> Option<MqttMessage> {
        self.rx.recv().await
    }
}

/// Completion handle of one publish call.
///
/// `QoS` 0 completes when the supervisor accepts the packet for writing,
/// `QoS` 1 on the acknowledgement, `QoS` 2 on the full exchange.
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), Error>>,
    cancel_token: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Delivery {
    /// Wait for the delivery guarantee of the publish to be met.
    ///
    /// # Errors
    ///
    /// Returns error if delivery failed, timed out, was cancelled, or the
    /// client terminated.
    pub async fn wait(self) -> Result<(), Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_closed) => Err(client_gone()),
        }
    }

    /// Give up on this publish. The entry is removed from its delivery
    /// engine and the waiter fails with `Cancelled`; bytes already on the
    /// wire are not retracted.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::CancelPublish {
            cancel_token: self.cancel_token,
        });
    }
}

impl Client {
    /// Connect to the broker in `options` over TCP.
    ///
    /// Resolves once the broker accepts the connect packet, with the
    /// handle and the inbound message stream.
    ///
    /// # Errors
    ///
    /// Returns error if the connection attempts exhausted their budget or
    /// the broker refused the session.
    pub async fn connect(options: ConnectOptions) -> Result<(Self, MessageStream), Error> {
        let max_frame_size = options.maximum_packet_size() as usize;
        let connector = Box::new(TcpConnector::new(options.address(), max_frame_size));
        Self::connect_with(options, connector).await
    }

    /// Connect through a caller-supplied transport factory. This is the
    /// seam the loopback test harness plugs into.
    ///
    /// # Errors
    ///
    /// Returns error if the connection attempts exhausted their budget or
    /// the broker refused the session.
    pub async fn connect_with(
        options: ConnectOptions,
        connector: Box<dyn Connector>,
    ) -> Result<(Self, MessageStream), Error> {
        options.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let status = Arc::new(AtomicU8::new(ClientStatus::Connecting as u8));
        let (ready_tx, ready_rx) = oneshot::channel();

        let supervisor = Supervisor::new(options, connector, cmd_rx, msg_tx, Arc::clone(&status));
        tokio::spawn(supervisor.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok((
                Self {
                    cmd_tx,
                    cancel_tokens: Arc::new(AtomicU64::new(1)),
                    status,
                },
                MessageStream { rx: msg_rx },
            )),
            Ok(Err(err)) => Err(err),
            Err(_closed) => Err(client_gone()),
        }
    }

    /// Subscribe to `topic` and wait for the broker to grant it.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is invalid, the broker refused it, or
    /// the acknowledgement timed out.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Error> {
        self.subscribe_with(topic, qos, SubscriptionOptions::default())
            .await
    }

    /// Subscribe with explicit subscription options. The options only have
    /// an effect under protocol 5.0; a 3.1.1 session remembers but ignores
    /// them.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is invalid, the broker refused it, or
    /// the acknowledgement timed out.
    pub async fn subscribe_with(
        &self,
        topic: &str,
        qos: QoS,
        options: SubscriptionOptions,
    ) -> Result<(), Error> {
        validate_sub_topic(topic)?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.to_string(),
                qos,
                options,
                waiter: tx,
            })
            .map_err(|_err| client_gone())?;
        match rx.await {
            Ok(result) => result,
            Err(_closed) => Err(client_gone()),
        }
    }

    /// Drop the subscription to `topic`.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is invalid or the acknowledgement timed
    /// out.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        validate_sub_topic(topic)?;
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe {
                topic: topic.to_string(),
                waiter: tx,
            })
            .map_err(|_err| client_gone())?;
        match rx.await {
            Ok(result) => result,
            Err(_closed) => Err(client_gone()),
        }
    }

    /// Publish `payload` to `topic`, returning a completion handle. The
    /// packet identifier for `QoS` 1/2 is assigned by the supervisor.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid or the client terminated.
    pub fn publish(&self, topic: &str, qos: QoS, payload: &[u8]) -> Result<Delivery, Error> {
        let packet = PublishPacket::new(topic, qos, payload)?;
        self.publish_packet(packet)
    }

    /// Publish a prepared packet, e.g. one with the retain flag set.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid or the client terminated.
    pub fn publish_packet(&self, packet: PublishPacket) -> Result<Delivery, Error> {
        validate_pub_topic(packet.topic())?;
        let cancel_token = self.cancel_tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                packet,
                cancel_token,
                waiter: tx,
            })
            .map_err(|_err| client_gone())?;
        Ok(Delivery {
            rx,
            cancel_token,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Flush a disconnect packet and close the transport. Idempotent; the
    /// client is terminal afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the client already terminated uncleanly.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Disconnect { waiter: tx })
            .is_err()
        {
            // Already gone; disconnecting twice is not an error.
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_closed) => Ok(()),
        }
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }
}
