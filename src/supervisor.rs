// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

use codec::{
    ConnectPacket, DisconnectPacket, FrameEncoder, MqttPacket, Packet, PacketDecoder,
    PingRequestPacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, QoS, SubscribePacket, UnsubscribePacket,
};

use crate::ack_router::{AckRouter, AckWaiter};
use crate::dedup::DedupCache;
use crate::error::{Error, ErrorKind};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::message::MqttMessage;
use crate::options::{ConnectOptions, SubscriptionOptions};
use crate::packet_id::PacketIdCounter;
use crate::qos1::Qos1Engine;
use crate::qos2::Qos2Engine;
use crate::session::SessionState;
use crate::status::ClientStatus;
use crate::transport::{Connector, TerminationReason, Transport};

/// Pause between failed connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Cadence of the deadline sweeps.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Requests from the public handle to the supervisor task.
pub(crate) enum Command {
    Publish {
        packet: PublishPacket,
        cancel_token: u64,
        waiter: AckWaiter,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        options: SubscriptionOptions,
        waiter: AckWaiter,
    },
    Unsubscribe {
        topic: String,
        waiter: AckWaiter,
    },
    Disconnect {
        waiter: AckWaiter,
    },
    CancelPublish {
        cancel_token: u64,
    },
}

enum Wake {
    Command(Option<Command>),
    Inbound(Option<Bytes>),
    Terminated(Option<TerminationReason>),
    Tick,
}

#[derive(Debug, Default)]
struct Telemetry {
    packets_sent: u64,
    packets_received: u64,
    messages_delivered: u64,
    reconnects: u64,
}

/// Owns every piece of per-client protocol state and drives it from one
/// task.
///
/// Public calls arrive as [`Command`] values on an unbounded queue, decoded
/// packets are routed to the delivery engines or the inbound stream, and a
/// one second tick drives every deadline: ack timeouts, publish
/// retransmission, dedup expiry and keep-alive.
pub(crate) struct Supervisor {
    options: ConnectOptions,
    connector: Box<dyn Connector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    msg_tx: mpsc::UnboundedSender<MqttMessage>,
    status: Arc<AtomicU8>,

    session: SessionState,
    packet_ids: PacketIdCounter,
    ack_router: AckRouter,
    qos1: Qos1Engine,
    qos2: Qos2Engine,
    dedup: DedupCache,
    heartbeat: Heartbeat,

    decoder: PacketDecoder,
    encoder: FrameEncoder,
    outbound: VecDeque<MqttPacket>,
    link: Option<Transport>,

    disconnect_requested: bool,
    reconnect_requested: bool,
    disconnect_waiters: Vec<AckWaiter>,
    telemetry: Telemetry,
}

impl Supervisor {
    pub fn new(
        options: ConnectOptions,
        connector: Box<dyn Connector>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        msg_tx: mpsc::UnboundedSender<MqttMessage>,
        status: Arc<AtomicU8>,
    ) -> Self {
        let max_packet_size = options.maximum_packet_size() as usize;
        Self {
            session: SessionState::new(options.max_reconnect_attempts()),
            packet_ids: PacketIdCounter::new(),
            ack_router: AckRouter::new(),
            qos1: Qos1Engine::new(
                options.publish_retry_interval(),
                options.max_publish_retries(),
            ),
            qos2: Qos2Engine::new(
                options.publish_retry_interval(),
                options.max_publish_retries(),
            ),
            dedup: DedupCache::new(
                options.max_retained_packet_ids(),
                options.packet_id_retention(),
            ),
            heartbeat: Heartbeat::new(options.keep_alive_seconds(), Instant::now()),
            decoder: PacketDecoder::with_max_packet_size(max_packet_size),
            encoder: FrameEncoder::new(max_packet_size),
            outbound: VecDeque::new(),
            link: None,
            disconnect_requested: false,
            reconnect_requested: false,
            disconnect_waiters: Vec::new(),
            telemetry: Telemetry::default(),
            options,
            connector,
            cmd_rx,
            msg_tx,
            status,
        }
    }

    /// Task entry point. `ready` resolves once the initial connect either
    /// succeeds or exhausts its budget.
    pub async fn run(mut self, ready: oneshot::Sender<Result<(), Error>>) {
        match self.establish_with_retries().await {
            Ok(()) => {
                let _ = ready.send(Ok(()));
            }
            Err(err) => {
                self.set_status(ClientStatus::Disconnected);
                let _ = ready.send(Err(err));
                return;
            }
        }
        self.run_connected().await;
    }

    async fn run_connected(&mut self) {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Err(err) = self.flush_outbound().await {
                log::warn!("supervisor: flush failed: {err}");
                self.reconnect_requested = true;
            }

            if self.disconnect_requested {
                self.shutdown().await;
                return;
            }
            if self.reconnect_requested && !self.reconnect().await {
                return;
            }

            let wake = {
                let Some(link) = self.link.as_mut() else {
                    self.reconnect_requested = true;
                    continue;
                };
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                    chunk = link.reader.recv() => Wake::Inbound(chunk),
                    reason = link.terminated.recv() => Wake::Terminated(reason),
                    _ = tick.tick() => Wake::Tick,
                }
            };

            match wake {
                Wake::Command(None) => {
                    // Every handle is gone, leave the broker cleanly.
                    log::info!("supervisor: all client handles dropped, disconnecting");
                    self.disconnect_requested = true;
                    self.outbound
                        .push_back(MqttPacket::Disconnect(DisconnectPacket::new()));
                }
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Inbound(Some(chunk)) => match self.decoder.feed(&chunk) {
                    Ok(packets) => {
                        for packet in packets {
                            self.route_packet(packet);
                        }
                    }
                    Err(err) => {
                        log::error!("supervisor: malformed inbound data: {err:?}");
                        self.reconnect_requested = true;
                    }
                },
                Wake::Inbound(None) | Wake::Terminated(None) => {
                    log::warn!("supervisor: transport stream ended");
                    self.reconnect_requested = true;
                }
                Wake::Terminated(Some(reason)) => {
                    log::warn!("supervisor: transport terminated: {reason:?}");
                    self.reconnect_requested = true;
                }
                Wake::Tick => self.on_tick(),
            }
        }
    }

    // ---- connection lifecycle ----

    /// One connection attempt followed by budgeted retries. On success the
    /// session is live: status switched, budget refilled, saved
    /// subscriptions replayed.
    async fn establish_with_retries(&mut self) -> Result<(), Error> {
        self.set_status(ClientStatus::Connecting);
        loop {
            match self.establish_once().await {
                Ok(leftover) => {
                    self.session
                        .reset_reconnects(self.options.max_reconnect_attempts());
                    self.set_status(ClientStatus::Connected);
                    self.heartbeat.reset(Instant::now());
                    self.restore_subscriptions();
                    for packet in leftover {
                        self.route_packet(packet);
                    }
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("supervisor: connect attempt failed: {err}");
                    if !self.session.consume_reconnect() {
                        return Err(err);
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Acquire a fresh transport and run the connect handshake on it.
    /// Returns any packets that arrived after the connect ack in the same
    /// chunks; they are routed once the session state is restored.
    async fn establish_once(&mut self) -> Result<Vec<MqttPacket>, Error> {
        if let Some(old) = self.link.take() {
            old.abort();
        }
        self.decoder.reset();

        let transport = self.connector.connect().await?;
        let budget = transport
            .max_frame_size()
            .min(self.options.maximum_packet_size() as usize);
        self.encoder = FrameEncoder::new(budget);
        self.link = Some(transport);

        let connect = self.build_connect_packet()?;
        let deadline = Instant::now() + self.options.ack_timeout();
        let (tx, mut rx) = oneshot::channel();
        self.ack_router.register_connect(tx, deadline);
        self.outbound.push_front(MqttPacket::Connect(connect));
        self.flush_outbound().await?;

        let mut leftover = Vec::new();
        loop {
            let link = self
                .link
                .as_mut()
                .ok_or_else(|| Error::transport_lost("transport vanished during connect"))?;
            let chunk = match timeout_at(deadline, link.reader.recv()).await {
                Err(_elapsed) => {
                    self.ack_router.fail_connect(Error::timeout("connect ack overdue"));
                    return Err(Error::timeout("broker did not answer connect"));
                }
                Ok(None) => {
                    self.ack_router
                        .fail_connect(Error::transport_lost("connection closed during connect"));
                    return Err(Error::transport_lost("connection closed during connect"));
                }
                Ok(Some(chunk)) => chunk,
            };

            for packet in self.decoder.feed(&chunk)? {
                if let MqttPacket::ConnectAck(ack) = packet {
                    self.ack_router.on_connect_ack(&ack);
                } else {
                    leftover.push(packet);
                }
            }

            match rx.try_recv() {
                Ok(result) => {
                    result?;
                    return Ok(leftover);
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(Error::transport_lost("connect waiter lost"));
                }
            }
        }
    }

    fn build_connect_packet(&self) -> Result<ConnectPacket, Error> {
        let mut packet = ConnectPacket::new(self.options.client_id())?;
        packet.set_protocol_level(self.options.protocol_version());
        packet.set_keep_alive(self.options.keep_alive_seconds());
        packet.set_clean_session(self.options.clean_session());
        if let Some(username) = self.options.username() {
            packet.set_username(username)?;
        }
        if let Some(password) = self.options.password() {
            packet.set_password(password)?;
        }
        if let Some(will) = self.options.will() {
            packet.set_will(&will.topic, &will.payload, will.qos, will.retain)?;
        }
        Ok(packet)
    }

    /// Replay every saved subscription onto the fresh connection. Failures
    /// here force another reconnect, reported through the router.
    fn restore_subscriptions(&mut self) {
        let subscriptions: Vec<(String, QoS)> = self
            .session
            .subscriptions()
            .map(|(topic, subscription)| (topic.to_string(), subscription.qos))
            .collect();
        let deadline = Instant::now() + self.options.ack_timeout();
        for (topic, qos) in subscriptions {
            let packet_id = self.packet_ids.next_id();
            match SubscribePacket::new(&topic, qos, packet_id) {
                Ok(packet) => {
                    log::debug!("supervisor: restoring subscription to {topic}");
                    self.ack_router
                        .register_subscribe(packet_id, None, deadline, true);
                    self.outbound.push_back(MqttPacket::Subscribe(packet));
                }
                Err(err) => {
                    log::error!("supervisor: saved subscription {topic} no longer encodes: {err:?}");
                }
            }
        }
    }

    /// Unified recovery for transport loss, server disconnect, heartbeat
    /// failure and malformed inbound data. Returns false when the client
    /// went terminal.
    async fn reconnect(&mut self) -> bool {
        self.reconnect_requested = false;
        self.telemetry.reconnects += 1;
        if self.options.enable_telemetry() {
            log::debug!(
                "supervisor: reconnect #{}, sent={} received={} delivered={}",
                self.telemetry.reconnects,
                self.telemetry.packets_sent,
                self.telemetry.packets_received,
                self.telemetry.messages_delivered,
            );
        }

        // Unflushed packets survive the transport swap; a disconnect that
        // raced a failure does not.
        let holding: Vec<MqttPacket> = self
            .outbound
            .drain(..)
            .filter(|packet| !matches!(packet, MqttPacket::Disconnect(_)))
            .collect();

        match self.establish_with_retries().await {
            Ok(()) => {
                for mut packet in holding {
                    if let MqttPacket::Publish(publish) = &mut packet {
                        if publish.qos() != QoS::AtMostOnce && publish.set_dup(true).is_err() {
                            continue;
                        }
                    }
                    self.outbound.push_back(packet);
                }
                true
            }
            Err(err) => {
                log::error!("supervisor: reconnect budget exhausted: {err}");
                self.terminate(&Error::from_string(
                    ErrorKind::TransportLoss,
                    format!("reconnect budget exhausted: {err}"),
                ));
                false
            }
        }
    }

    /// Graceful shutdown after a disconnect request: the disconnect packet
    /// has already been flushed by the caller.
    async fn shutdown(&mut self) {
        self.set_status(ClientStatus::Disconnecting);
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        let err = Error::new(ErrorKind::Cancelled, "client disconnected");
        self.qos1.fail_all(&err);
        self.qos2.fail_all(&err);
        self.ack_router.fail_all(&err);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.set_status(ClientStatus::Disconnected);
        if self.options.enable_telemetry() {
            log::debug!(
                "supervisor: session closed, sent={} received={} delivered={} reconnects={}",
                self.telemetry.packets_sent,
                self.telemetry.packets_received,
                self.telemetry.messages_delivered,
                self.telemetry.reconnects,
            );
        }
    }

    /// Terminal failure: every waiter fails, the handle-facing channels
    /// close when the task exits.
    fn terminate(&mut self, err: &Error) {
        self.qos1.fail_all(err);
        self.qos2.fail_all(err);
        self.ack_router.fail_all(err);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some(link) = self.link.take() {
            link.abort();
        }
        self.set_status(ClientStatus::Disconnected);
    }

    // ---- outbound path ----

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                packet,
                cancel_token,
                waiter,
            } => self.handle_publish(packet, cancel_token, waiter),
            Command::Subscribe {
                topic,
                qos,
                options,
                waiter,
            } => self.handle_subscribe(&topic, qos, options, waiter),
            Command::Unsubscribe { topic, waiter } => self.handle_unsubscribe(&topic, waiter),
            Command::Disconnect { waiter } => {
                self.disconnect_waiters.push(waiter);
                if !self.disconnect_requested {
                    self.disconnect_requested = true;
                    self.outbound
                        .push_back(MqttPacket::Disconnect(DisconnectPacket::new()));
                }
            }
            Command::CancelPublish { cancel_token } => {
                let err = Error::new(ErrorKind::Cancelled, "publish cancelled by caller");
                if !self.qos1.cancel(cancel_token, &err) {
                    self.qos2.cancel(cancel_token, &err);
                }
            }
        }
    }

    fn handle_publish(&mut self, mut packet: PublishPacket, cancel_token: u64, waiter: AckWaiter) {
        match packet.bytes() {
            Ok(size) if size > self.options.maximum_packet_size() as usize => {
                let _ = waiter.send(Err(Error::from_string(
                    ErrorKind::PacketTooLarge,
                    format!(
                        "publish of {size} bytes exceeds maximum packet size {}",
                        self.options.maximum_packet_size()
                    ),
                )));
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = waiter.send(Err(Error::from(codec::EncodeError::from(err))));
                return;
            }
        }

        match packet.qos() {
            QoS::AtMostOnce => {
                // Fire and forget: accepting it into the queue is success.
                self.outbound.push_back(MqttPacket::Publish(packet));
                let _ = waiter.send(Ok(()));
            }
            QoS::AtLeastOnce => {
                let packet_id = self.packet_ids.next_id();
                if self.qos1.contains(packet_id) || self.qos2.contains(packet_id) {
                    let _ = waiter.send(Err(Error::from_string(
                        ErrorKind::DuplicatePacketId,
                        format!("packet id {packet_id} already in flight"),
                    )));
                    return;
                }
                packet.set_packet_id(packet_id);
                self.qos1
                    .register(packet.clone(), cancel_token, waiter, Instant::now());
                self.outbound.push_back(MqttPacket::Publish(packet));
            }
            QoS::ExactOnce => {
                let packet_id = self.packet_ids.next_id();
                if self.qos1.contains(packet_id) || self.qos2.contains(packet_id) {
                    let _ = waiter.send(Err(Error::from_string(
                        ErrorKind::DuplicatePacketId,
                        format!("packet id {packet_id} already in flight"),
                    )));
                    return;
                }
                packet.set_packet_id(packet_id);
                self.qos2
                    .register(packet.clone(), cancel_token, waiter, Instant::now());
                self.outbound.push_back(MqttPacket::Publish(packet));
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
        options: SubscriptionOptions,
        waiter: AckWaiter,
    ) {
        // Memoised before the ack and not rolled back on failure; a
        // reconnect re-attempts the subscription either way.
        self.session.remember_subscription(topic, qos, options);
        let packet_id = self.packet_ids.next_id();
        match SubscribePacket::new(topic, qos, packet_id) {
            Ok(packet) => {
                let deadline = Instant::now() + self.options.ack_timeout();
                self.ack_router
                    .register_subscribe(packet_id, Some(waiter), deadline, false);
                self.outbound.push_back(MqttPacket::Subscribe(packet));
            }
            Err(err) => {
                let _ = waiter.send(Err(err.into()));
            }
        }
    }

    fn handle_unsubscribe(&mut self, topic: &str, waiter: AckWaiter) {
        self.session.forget_subscription(topic);
        let packet_id = self.packet_ids.next_id();
        match UnsubscribePacket::new(topic, packet_id) {
            Ok(packet) => {
                let deadline = Instant::now() + self.options.ack_timeout();
                self.ack_router
                    .register_unsubscribe(packet_id, waiter, deadline);
                self.outbound.push_back(MqttPacket::Unsubscribe(packet));
            }
            Err(err) => {
                let _ = waiter.send(Err(err.into()));
            }
        }
    }

    /// Batch-encode and write everything queued. Packets leave the queue
    /// only after the transport accepted their frame, so a failed write
    /// leaves them for the reconnect holding set.
    async fn flush_outbound(&mut self) -> Result<(), Error> {
        while !self.outbound.is_empty() {
            let frame = self.encoder.encode(self.outbound.make_contiguous())?;
            if frame.consumed == 0 {
                break;
            }
            let packed = frame.consumed - frame.dropped.len();
            if frame.written > 0 {
                let link = self
                    .link
                    .as_mut()
                    .ok_or_else(|| Error::transport_lost("not connected"))?;
                link.write(Bytes::from(frame.buf)).await?;
                self.heartbeat.record_write(Instant::now());
                self.telemetry.packets_sent += packed as u64;
            }
            let consumed: Vec<MqttPacket> = self.outbound.drain(..frame.consumed).collect();
            for index in frame.dropped {
                self.fail_oversize(&consumed[index]);
            }
        }
        Ok(())
    }

    /// The frame encoder refused this packet; deliver the failure to
    /// whoever is waiting on it.
    fn fail_oversize(&mut self, packet: &MqttPacket) {
        let err = Error::new(
            ErrorKind::PacketTooLarge,
            "packet exceeds the transport frame budget",
        );
        match packet {
            MqttPacket::Publish(publish) => match publish.qos() {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    self.qos1.fail(publish.packet_id(), err);
                }
                QoS::ExactOnce => {
                    self.qos2.fail(publish.packet_id(), err);
                }
            },
            MqttPacket::Subscribe(subscribe) => {
                if self.ack_router.fail_subscribe(subscribe.packet_id(), err) {
                    self.reconnect_requested = true;
                }
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                self.ack_router.fail_unsubscribe(unsubscribe.packet_id(), err);
            }
            other => {
                log::error!(
                    "supervisor: dropped oversize {:?} packet with no waiter",
                    other.packet_type()
                );
            }
        }
    }

    // ---- inbound path ----

    fn route_packet(&mut self, packet: MqttPacket) {
        self.telemetry.packets_received += 1;
        match packet {
            MqttPacket::ConnectAck(ack) => self.ack_router.on_connect_ack(&ack),
            MqttPacket::SubscribeAck(ack) => {
                if self.ack_router.on_subscribe_ack(&ack) {
                    log::warn!("supervisor: session restoration failed, reconnecting");
                    self.reconnect_requested = true;
                }
            }
            MqttPacket::UnsubscribeAck(ack) => self.ack_router.on_unsubscribe_ack(&ack),
            MqttPacket::PublishAck(ack) => self.qos1.on_publish_ack(ack.packet_id()),
            MqttPacket::PublishReceived(received) => self.qos2.on_publish_received(
                received.packet_id(),
                Instant::now(),
                &mut self.outbound,
            ),
            MqttPacket::PublishComplete(complete) => {
                self.qos2.on_publish_complete(complete.packet_id());
            }
            MqttPacket::PublishRelease(release) => {
                // Receiver half of an inbound exactly-once exchange.
                self.outbound
                    .push_back(MqttPacket::PublishComplete(PublishCompletePacket::new(
                        release.packet_id(),
                    )));
            }
            MqttPacket::Publish(publish) => self.handle_inbound_publish(publish),
            MqttPacket::PingResponse(_) => self.heartbeat.record_ping_response(),
            MqttPacket::Disconnect(_) => {
                log::warn!("supervisor: broker sent disconnect");
                self.reconnect_requested = true;
            }
            other => {
                log::warn!(
                    "supervisor: unexpected {:?} packet from broker",
                    other.packet_type()
                );
            }
        }
    }

    /// Acknowledge per `QoS` rules, then deliver unless the dedup window
    /// says the broker retransmitted something already handed to the
    /// application.
    fn handle_inbound_publish(&mut self, packet: PublishPacket) {
        let packet_id = packet.packet_id();
        let duplicate = match packet.qos() {
            QoS::AtMostOnce => false,
            QoS::AtLeastOnce => {
                self.outbound
                    .push_back(MqttPacket::PublishAck(PublishAckPacket::new(packet_id)));
                self.dedup
                    .observe(packet.topic(), packet_id.value(), Instant::now())
            }
            QoS::ExactOnce => {
                self.outbound
                    .push_back(MqttPacket::PublishReceived(PublishReceivedPacket::new(
                        packet_id,
                    )));
                self.dedup
                    .observe(packet.topic(), packet_id.value(), Instant::now())
            }
        };

        if duplicate {
            log::debug!(
                "supervisor: suppressed duplicate publish id {packet_id} on {}",
                packet.topic()
            );
            return;
        }
        self.telemetry.messages_delivered += 1;
        if self.msg_tx.send(MqttMessage::from(packet)).is_err() {
            log::warn!("supervisor: inbound stream dropped, message discarded");
        }
    }

    // ---- timers ----

    fn on_tick(&mut self) {
        let now = Instant::now();
        if self.ack_router.sweep(now) {
            log::warn!("supervisor: session restoration timed out, reconnecting");
            self.reconnect_requested = true;
        }
        self.qos1.check(now, &mut self.outbound);
        self.qos2.check(now, &mut self.outbound);
        self.dedup.sweep(now);
        match self.heartbeat.poll(now) {
            HeartbeatAction::Wait => {}
            HeartbeatAction::SendPing => {
                self.outbound
                    .push_back(MqttPacket::PingRequest(PingRequestPacket::new()));
            }
            HeartbeatAction::Failed => {
                log::warn!("supervisor: broker missed ping response deadline");
                self.reconnect_requested = true;
            }
        }
    }

    fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}
