// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use codec::{MqttPacket, PacketId, PublishPacket, PublishReleasePacket};

use crate::ack_router::AckWaiter;
use crate::error::Error;

struct PendingQos2 {
    packet: PublishPacket,
    deadline: Instant,

    /// False while awaiting the received packet, true while awaiting the
    /// complete packet.
    pubrec_received: bool,

    retries_remaining: u32,
    cancel_token: u64,
    waiter: AckWaiter,
}

/// Sender half of the exactly-once exchange.
///
/// Each in-flight publish walks publish → received → release → complete.
/// A missing received packet retransmits the publish (dup set), a missing
/// complete packet retransmits the release; both share one retry budget,
/// and exhaustion fails the waiter with `Timeout`. Replayed received or
/// complete packets never complete a waiter twice.
pub(crate) struct Qos2Engine {
    pending: HashMap<u16, PendingQos2>,
    retry_interval: Duration,
    max_retries: u32,
}

impl Qos2Engine {
    pub fn new(retry_interval: Duration, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            retry_interval,
            max_retries,
        }
    }

    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.pending.contains_key(&packet_id.value())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn register(&mut self, packet: PublishPacket, cancel_token: u64, waiter: AckWaiter, now: Instant) {
        let id = packet.packet_id().value();
        self.pending.insert(
            id,
            PendingQos2 {
                packet,
                deadline: now + self.retry_interval,
                pubrec_received: false,
                retries_remaining: self.max_retries,
                cancel_token,
                waiter,
            },
        );
    }

    /// First valid received packet advances the exchange and emits the
    /// release packet; replays re-emit the release only. A received packet
    /// for an unknown id still gets a release so the peer stops
    /// retransmitting.
    pub fn on_publish_received(
        &mut self,
        packet_id: PacketId,
        now: Instant,
        outbound: &mut VecDeque<MqttPacket>,
    ) {
        match self.pending.get_mut(&packet_id.value()) {
            Some(pending) => {
                if !pending.pubrec_received {
                    pending.pubrec_received = true;
                    pending.deadline = now + self.retry_interval;
                }
                outbound.push_back(MqttPacket::PublishRelease(PublishReleasePacket::new(
                    packet_id,
                )));
            }
            None => {
                log::warn!("qos2: received packet for unknown id {packet_id}, releasing anyway");
                outbound.push_back(MqttPacket::PublishRelease(PublishReleasePacket::new(
                    packet_id,
                )));
            }
        }
    }

    /// Terminal step; completes the waiter exactly once. Unsolicited
    /// complete packets are dropped.
    pub fn on_publish_complete(&mut self, packet_id: PacketId) {
        match self.pending.remove(&packet_id.value()) {
            Some(pending) => {
                let _ = pending.waiter.send(Ok(()));
            }
            None => log::debug!("qos2: stale publish complete for id {packet_id}"),
        }
    }

    /// Periodic deadline check. The retransmitted packet depends on which
    /// half of the exchange is stalled.
    pub fn check(&mut self, now: Instant, outbound: &mut VecDeque<MqttPacket>) {
        let mut exhausted = Vec::new();
        for (id, pending) in &mut self.pending {
            if pending.deadline > now {
                continue;
            }
            if pending.retries_remaining == 0 {
                exhausted.push(*id);
                continue;
            }
            pending.retries_remaining -= 1;
            pending.deadline = now + self.retry_interval;
            if pending.pubrec_received {
                log::debug!("qos2: retransmitting release for id {id}");
                outbound.push_back(MqttPacket::PublishRelease(PublishReleasePacket::new(
                    PacketId::new(*id),
                )));
            } else {
                if pending.packet.set_dup(true).is_err() {
                    log::error!("qos2: tracked packet has no qos, dropping entry");
                    exhausted.push(*id);
                    continue;
                }
                log::debug!("qos2: retransmitting publish id {id}");
                outbound.push_back(MqttPacket::Publish(pending.packet.clone()));
            }
        }
        for id in exhausted {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending
                    .waiter
                    .send(Err(Error::timeout("qos2 exchange never completed")));
            }
        }
    }

    pub fn fail(&mut self, packet_id: PacketId, err: Error) -> bool {
        match self.pending.remove(&packet_id.value()) {
            Some(pending) => {
                let _ = pending.waiter.send(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, cancel_token: u64, err: &Error) -> bool {
        let Some(id) = self
            .pending
            .iter()
            .find(|(_, pending)| pending.cancel_token == cancel_token)
            .map(|(id, _)| *id)
        else {
            return false;
        };
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending.waiter.send(Err(err.clone()));
        }
        true
    }

    pub fn fail_all(&mut self, err: &Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.waiter.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use codec::QoS;
    use tokio::sync::oneshot;

    fn publish(id: u16) -> PublishPacket {
        let mut packet = PublishPacket::new("topic", QoS::ExactOnce, &[0, 1, 2, 3]).unwrap();
        packet.set_packet_id(PacketId::new(id));
        packet
    }

    fn release(outbound: &mut VecDeque<MqttPacket>) -> PublishReleasePacket {
        let MqttPacket::PublishRelease(packet) = outbound.pop_front().unwrap() else {
            panic!("expected publish release");
        };
        packet
    }

    #[tokio::test]
    async fn test_four_step_exchange_completes_once() {
        let mut engine = Qos2Engine::new(Duration::from_secs(5), 3);
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        engine.register(publish(2), 1, tx, now);

        let mut outbound = VecDeque::new();
        engine.on_publish_received(PacketId::new(2), now, &mut outbound);
        assert_eq!(release(&mut outbound).packet_id(), PacketId::new(2));
        assert!(rx.try_recv().is_err());

        // Replayed received packet re-emits the release only.
        engine.on_publish_received(PacketId::new(2), now, &mut outbound);
        assert_eq!(release(&mut outbound).packet_id(), PacketId::new(2));

        engine.on_publish_complete(PacketId::new(2));
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(engine.len(), 0);

        // Replayed complete packet is dropped.
        engine.on_publish_complete(PacketId::new(2));
    }

    #[tokio::test]
    async fn test_missing_pubrec_retransmits_publish() {
        let retry = Duration::from_secs(5);
        let mut engine = Qos2Engine::new(retry, 3);
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        engine.register(publish(5), 1, tx, now);

        let mut outbound = VecDeque::new();
        engine.check(now + retry + Duration::from_millis(1), &mut outbound);
        let MqttPacket::Publish(resent) = outbound.pop_front().unwrap() else {
            panic!("expected publish");
        };
        assert!(resent.dup());
        assert_eq!(resent.packet_id(), PacketId::new(5));
    }

    #[tokio::test]
    async fn test_missing_pubcomp_retransmits_release() {
        let retry = Duration::from_secs(5);
        let mut engine = Qos2Engine::new(retry, 3);
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        engine.register(publish(6), 1, tx, now);

        let mut outbound = VecDeque::new();
        engine.on_publish_received(PacketId::new(6), now, &mut outbound);
        outbound.clear();

        engine.check(now + retry * 2, &mut outbound);
        assert_eq!(release(&mut outbound).packet_id(), PacketId::new(6));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_waiter() {
        let retry = Duration::from_secs(5);
        let mut engine = Qos2Engine::new(retry, 2);
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        engine.register(publish(8), 1, tx, now);

        let mut outbound = VecDeque::new();
        for attempt in 1..=2u32 {
            engine.check(now + retry * attempt + Duration::from_millis(1), &mut outbound);
            assert!(rx.try_recv().is_err());
        }
        engine.check(now + retry * 4, &mut outbound);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unsolicited_pubrec_still_releases() {
        let mut engine = Qos2Engine::new(Duration::from_secs(5), 3);
        let mut outbound = VecDeque::new();
        engine.on_publish_received(PacketId::new(100), Instant::now(), &mut outbound);
        assert_eq!(release(&mut outbound).packet_id(), PacketId::new(100));
    }
}
