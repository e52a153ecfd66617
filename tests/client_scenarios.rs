// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! End-to-end client behavior against the in-memory loopback broker.

mod common;

use std::time::Duration;

use common::{memory_connector, FakeBroker};
use turbomqtt::codec::{
    ConnectReturnCode, MqttPacket, PacketId, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket,
};
use turbomqtt::{Client, ClientStatus, ConnectOptions, ErrorKind, QoS};

fn options() -> ConnectOptions {
    let mut options = ConnectOptions::new("loopback:1883");
    options.set_client_id("test-client");
    options
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();
    assert!(client.is_connected());

    let disconnected = tokio::spawn(async move {
        // The disconnect packet is always the two reference bytes.
        let raw = broker.recv_raw().await;
        assert_eq!(&raw[..], &[0xe0, 0x00]);
        drop(broker);
    });

    client.disconnect().await.unwrap();
    disconnected.await.unwrap();
    assert!(!client.is_connected());
    assert_eq!(client.status(), ClientStatus::Disconnected);
}

#[tokio::test]
async fn test_connect_sends_configured_client_id() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await
    });

    let (_client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let connect = broker.await.unwrap();
    assert_eq!(connect.client_id(), "test-client");
    assert_eq!(connect.keep_alive(), 60);
    assert!(connect.clean_session());
}

#[tokio::test(start_paused = true)]
async fn test_connect_refusal_surfaces_reason() {
    let (connector, mut accepts) = memory_connector();

    tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.refuse_connect(ConnectReturnCode::Unauthorized).await;
    });

    let mut options = options();
    options.set_max_reconnect_attempts(0);
    let err = Client::connect_with(options, connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
}

#[tokio::test]
async fn test_qos0_publish_round_trip() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, mut messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    let subscribed = tokio::spawn(async move {
        let subscribe = broker.grant_subscribe().await;
        assert_eq!(subscribe.topics()[0].topic(), "topic");
        assert_eq!(subscribe.topics()[0].qos(), QoS::AtLeastOnce);
        broker
    });
    client.subscribe("topic", QoS::AtLeastOnce).await.unwrap();
    let mut broker = subscribed.await.unwrap();

    // Outbound QoS 0: accepted immediately, visible to the broker.
    client
        .publish("topic", QoS::AtMostOnce, b"hello world")
        .unwrap()
        .wait()
        .await
        .unwrap();
    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert_eq!(publish.topic(), "topic");
    assert_eq!(publish.message(), b"hello world");

    // Inbound: exactly one message on the stream.
    broker
        .send_packet(&MqttPacket::Publish(
            PublishPacket::new("topic", QoS::AtMostOnce, b"hello world").unwrap(),
        ))
        .await;
    let message = messages.next().await.unwrap();
    assert_eq!(message.topic(), "topic");
    assert_eq!(message.payload(), b"hello world");
}

#[tokio::test]
async fn test_qos2_four_step_exchange() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    // Consume packet id 1 on a subscription so the publish gets id 2.
    let subscribed = tokio::spawn(async move {
        broker.grant_subscribe().await;
        broker
    });
    client.subscribe("topic", QoS::AtLeastOnce).await.unwrap();
    let mut broker = subscribed.await.unwrap();

    let delivery = client
        .publish("topic", QoS::ExactOnce, &[0, 1, 2, 3])
        .unwrap();

    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert_eq!(publish.qos(), QoS::ExactOnce);
    assert_eq!(publish.packet_id(), PacketId::new(2));
    assert_eq!(publish.message(), &[0, 1, 2, 3]);

    broker
        .send_packet(&MqttPacket::PublishReceived(PublishReceivedPacket::new(
            PacketId::new(2),
        )))
        .await;

    let packet = broker.recv_packet().await;
    assert_eq!(
        packet,
        MqttPacket::PublishRelease(PublishReleasePacket::new(PacketId::new(2)))
    );

    broker
        .send_packet(&MqttPacket::PublishComplete(PublishCompletePacket::new(
            PacketId::new(2),
        )))
        .await;

    delivery.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_qos1_retransmits_with_dup_until_acked() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    let delivery = client.publish("topic", QoS::AtLeastOnce, b"payload").unwrap();

    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(first) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert!(!first.dup());
    let packet_id = first.packet_id();

    // No ack: the retry deadline passes and the packet comes again, dup set.
    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(second) = packet else {
        panic!("expected republish, got {packet:?}");
    };
    assert!(second.dup());
    assert_eq!(second.packet_id(), packet_id);

    broker
        .send_packet(&MqttPacket::PublishAck(PublishAckPacket::new(packet_id)))
        .await;
    delivery.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_cancel_fails_waiter() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    let delivery = client.publish("topic", QoS::AtLeastOnce, b"payload").unwrap();
    let packet = broker.recv_packet().await;
    assert!(matches!(packet, MqttPacket::Publish(_)));

    delivery.cancel();
    let err = delivery.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_subscriptions() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        (broker, accepts)
    });

    let (client, mut messages) = Client::connect_with(options(), connector).await.unwrap();
    let (mut broker, mut accepts) = broker.await.unwrap();

    let subscribed = tokio::spawn(async move {
        broker.grant_subscribe().await;
        broker
    });
    client.subscribe("topic", QoS::AtLeastOnce).await.unwrap();
    let broker = subscribed.await.unwrap();

    // Kill the transport; the client must come back and resubscribe on its
    // own.
    broker.kick();

    let mut broker = FakeBroker::accept(&mut accepts).await;
    broker.accept_connect().await;
    let subscribe = broker.grant_subscribe().await;
    assert_eq!(subscribe.topics()[0].topic(), "topic");
    assert_eq!(subscribe.topics()[0].qos(), QoS::AtLeastOnce);

    // The restored session delivers again.
    broker
        .send_packet(&MqttPacket::Publish(
            PublishPacket::new("topic", QoS::AtMostOnce, b"after reconnect").unwrap(),
        ))
        .await;
    let message = messages.next().await.unwrap();
    assert_eq!(message.payload(), b"after reconnect");
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_miss_triggers_reconnect() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        (broker, accepts)
    });

    let mut options = options();
    options.set_keep_alive_seconds(1);
    let (client, mut messages) = Client::connect_with(options, connector).await.unwrap();
    let (mut broker, mut accepts) = broker.await.unwrap();

    let subscribed = tokio::spawn(async move {
        broker.grant_subscribe().await;
        broker
    });
    client.subscribe("topic", QoS::AtLeastOnce).await.unwrap();
    let mut broker = subscribed.await.unwrap();

    // The idle client pings within the keep-alive interval; the broker
    // stays silent and the client must give up on the connection.
    let packet = broker.recv_packet().await;
    assert!(matches!(packet, MqttPacket::PingRequest(_)));

    let mut broker = FakeBroker::accept(&mut accepts).await;
    broker.accept_connect().await;
    let subscribe = broker.grant_subscribe().await;
    assert_eq!(subscribe.topics()[0].topic(), "topic");

    // Full round trip on the new transport.
    let delivery = client.publish("topic", QoS::AtMostOnce, b"alive again").unwrap();
    delivery.wait().await.unwrap();
    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert_eq!(publish.message(), b"alive again");

    broker
        .send_packet(&MqttPacket::Publish(
            PublishPacket::new("topic", QoS::AtMostOnce, b"inbound").unwrap(),
        ))
        .await;
    assert_eq!(messages.next().await.unwrap().payload(), b"inbound");
}

#[tokio::test]
async fn test_oversize_publish_is_rejected() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let mut options = options();
    options.set_maximum_packet_size(64);
    let (client, _messages) = Client::connect_with(options, connector).await.unwrap();
    let _broker = broker.await.unwrap();

    let delivery = client
        .publish("topic", QoS::AtLeastOnce, &[0u8; 100])
        .unwrap();
    let err = delivery.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PacketTooLarge);
}

#[tokio::test]
async fn test_retained_publish_reaches_broker() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, _messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    let mut packet = PublishPacket::new("status", QoS::AtMostOnce, b"online").unwrap();
    packet.set_retain(true);
    client.publish_packet(packet).unwrap().wait().await.unwrap();

    let packet = broker.recv_packet().await;
    let MqttPacket::Publish(publish) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert!(publish.retain());
    assert_eq!(publish.topic(), "status");
}

#[tokio::test]
async fn test_empty_client_id_is_sent_as_is() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await
    });

    let mut options = options();
    options.set_client_id("");
    let (_client, _messages) = Client::connect_with(options, connector).await.unwrap();
    let connect = broker.await.unwrap();
    assert_eq!(connect.client_id(), "");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (connector, mut accepts) = memory_connector();

    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(&mut accepts).await;
        broker.accept_connect().await;
        broker
    });

    let (client, mut messages) = Client::connect_with(options(), connector).await.unwrap();
    let mut broker = broker.await.unwrap();

    for topic in ["topic1", "topic2"] {
        let granter = tokio::spawn(async move {
            broker.grant_subscribe().await;
            broker
        });
        client.subscribe(topic, QoS::AtLeastOnce).await.unwrap();
        broker = granter.await.unwrap();
    }

    for topic in ["topic1", "topic2"] {
        let acker = tokio::spawn(async move {
            let unsubscribe = broker.ack_unsubscribe().await;
            (broker, unsubscribe)
        });
        let result = client.unsubscribe(topic).await;
        let (returned, unsubscribe) = acker.await.unwrap();
        broker = returned;
        result.unwrap();
        assert_eq!(unsubscribe.topics()[0].as_ref(), topic);
    }

    // An unsubscribed broker forwards nothing; the stream stays quiet.
    let quiet = tokio::time::timeout(Duration::from_millis(100), messages.next()).await;
    assert!(quiet.is_err(), "unexpected message after unsubscribe");
}
