// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! In-memory loopback broker for driving the client without a socket.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

use turbomqtt::codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, EncodePacket, MqttPacket, PacketDecoder,
    SubscribeAck, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use turbomqtt::transport::{Connector, TerminationReason, Transport};
use turbomqtt::{Error, ErrorKind};

/// Broker-side ends of one accepted connection.
pub struct BrokerLink {
    pub from_client: mpsc::Receiver<Bytes>,
    pub to_client: mpsc::Sender<Bytes>,
    pub terminate: mpsc::Sender<TerminationReason>,
}

/// Hands the supervisor a fresh pair of channels per attempt and surfaces
/// the broker side on an accept queue, so tests can serve any number of
/// reconnects.
pub struct MemoryConnector {
    accepts: mpsc::UnboundedSender<BrokerLink>,
}

impl Connector for MemoryConnector {
    fn connect(&mut self) -> BoxFuture<'_, Result<Transport, Error>> {
        Box::pin(async move {
            let (write_tx, write_rx) = mpsc::channel(32);
            let (read_tx, read_rx) = mpsc::channel(32);
            let (term_tx, term_rx) = mpsc::channel(2);
            let link = BrokerLink {
                from_client: write_rx,
                to_client: read_tx,
                terminate: term_tx,
            };
            self.accepts
                .send(link)
                .map_err(|_err| Error::new(ErrorKind::TransportLoss, "loopback broker is gone"))?;
            Ok(Transport::new(write_tx, read_rx, term_rx, None, 64 * 1024))
        })
    }
}

pub fn memory_connector() -> (Box<dyn Connector>, mpsc::UnboundedReceiver<BrokerLink>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(MemoryConnector { accepts: tx }), rx)
}

/// Scriptable peer speaking raw packets over one [`BrokerLink`].
pub struct FakeBroker {
    link: BrokerLink,
    decoder: PacketDecoder,
    inbox: VecDeque<MqttPacket>,
}

impl FakeBroker {
    /// Wait for the client's next connection attempt.
    pub async fn accept(accepts: &mut mpsc::UnboundedReceiver<BrokerLink>) -> Self {
        let link = tokio::time::timeout(Duration::from_secs(10), accepts.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("connector dropped");
        Self {
            link,
            decoder: PacketDecoder::new(),
            inbox: VecDeque::new(),
        }
    }

    pub async fn recv_packet(&mut self) -> MqttPacket {
        loop {
            if let Some(packet) = self.inbox.pop_front() {
                return packet;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(10), self.link.from_client.recv())
                .await
                .expect("timed out waiting for a packet")
                .expect("client closed its write side");
            self.inbox
                .extend(self.decoder.feed(&chunk).expect("malformed client bytes"));
        }
    }

    pub async fn send_packet(&mut self, packet: &MqttPacket) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("encode failed");
        self.link
            .to_client
            .send(Bytes::from(buf))
            .await
            .expect("client closed its read side");
    }

    /// Expect a connect packet and accept it.
    pub async fn accept_connect(&mut self) -> ConnectPacket {
        let packet = self.recv_packet().await;
        let MqttPacket::Connect(connect) = packet else {
            panic!("expected connect, got {packet:?}");
        };
        self.send_packet(&MqttPacket::ConnectAck(ConnectAckPacket::new(
            false,
            ConnectReturnCode::Accepted,
        )))
        .await;
        connect
    }

    /// Expect a connect packet and refuse it with `code`.
    pub async fn refuse_connect(&mut self, code: ConnectReturnCode) {
        let packet = self.recv_packet().await;
        assert!(matches!(packet, MqttPacket::Connect(_)), "got {packet:?}");
        self.send_packet(&MqttPacket::ConnectAck(ConnectAckPacket::new(false, code)))
            .await;
    }

    /// Expect a subscribe packet and grant every filter at its requested
    /// `QoS`.
    pub async fn grant_subscribe(&mut self) -> SubscribePacket {
        let packet = self.recv_packet().await;
        let MqttPacket::Subscribe(subscribe) = packet else {
            panic!("expected subscribe, got {packet:?}");
        };
        let acks = subscribe
            .topics()
            .iter()
            .map(|topic| SubscribeAck::GrantedQoS(topic.qos()))
            .collect();
        self.send_packet(&MqttPacket::SubscribeAck(SubscribeAckPacket::with_vec(
            subscribe.packet_id(),
            acks,
        )))
        .await;
        subscribe
    }

    /// Expect an unsubscribe packet and acknowledge it.
    pub async fn ack_unsubscribe(&mut self) -> UnsubscribePacket {
        let packet = self.recv_packet().await;
        let MqttPacket::Unsubscribe(unsubscribe) = packet else {
            panic!("expected unsubscribe, got {packet:?}");
        };
        self.send_packet(&MqttPacket::UnsubscribeAck(UnsubscribeAckPacket::new(
            unsubscribe.packet_id(),
        )))
        .await;
        unsubscribe
    }

    /// Read one raw chunk off the wire, for byte-level assertions.
    pub async fn recv_raw(&mut self) -> Bytes {
        assert!(self.inbox.is_empty(), "decoded packets pending");
        tokio::time::timeout(Duration::from_secs(10), self.link.from_client.recv())
            .await
            .expect("timed out waiting for bytes")
            .expect("client closed its write side")
    }

    /// Drop the connection out from under the client.
    pub fn kick(self) {
        let _ = self.link.terminate.try_send(TerminationReason::ClosedByPeer);
    }
}
