// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use codec::{MqttPacket, PacketId, PublishPacket};

use crate::ack_router::AckWaiter;
use crate::error::Error;

struct PendingQos1 {
    packet: PublishPacket,
    deadline: Instant,
    retries_remaining: u32,
    cancel_token: u64,
    waiter: AckWaiter,
}

/// Tracks outstanding `QoS` 1 publishes until their acknowledgement
/// arrives.
///
/// A publish that misses its deadline is retransmitted with the dup flag
/// set, up to the retry budget; after that its waiter fails with
/// `Timeout`. Entries survive a reconnect, the deadline keeps governing
/// retransmission on the new transport.
pub(crate) struct Qos1Engine {
    pending: HashMap<u16, PendingQos1>,
    retry_interval: Duration,
    max_retries: u32,
}

impl Qos1Engine {
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

    /// Start tracking `packet`. The caller has already checked the id is
    /// not in flight.
    pub fn register(&mut self, packet: PublishPacket, cancel_token: u64, waiter: AckWaiter, now: Instant) {
        let id = packet.packet_id().value();
        self.pending.insert(
            id,
            PendingQos1 {
                packet,
                deadline: now + self.retry_interval,
                retries_remaining: self.max_retries,
                cancel_token,
                waiter,
            },
        );
    }

    /// One acknowledgement completes the waiter; repeats are stale and
    /// ignored.
    pub fn on_publish_ack(&mut self, packet_id: PacketId) {
        match self.pending.remove(&packet_id.value()) {
            Some(pending) => {
                let _ = pending.waiter.send(Ok(()));
            }
            None => log::debug!("qos1: stale publish ack for id {packet_id}"),
        }
    }

    /// Periodic deadline check. Overdue entries with retries left are
    /// re-enqueued with dup set; exhausted ones fail.
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
            if pending.packet.set_dup(true).is_err() {
                log::error!("qos1: tracked packet has no qos, dropping entry");
                exhausted.push(*id);
                continue;
            }
            log::debug!("qos1: retransmitting publish id {id}");
            outbound.push_back(MqttPacket::Publish(pending.packet.clone()));
        }
        for id in exhausted {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending
                    .waiter
                    .send(Err(Error::timeout("publish ack never arrived")));
            }
        }
    }

    /// Remove an entry and fail its waiter, e.g. oversize drop.
    pub fn fail(&mut self, packet_id: PacketId, err: Error) -> bool {
        match self.pending.remove(&packet_id.value()) {
            Some(pending) => {
                let _ = pending.waiter.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Caller-initiated cancellation, addressed by token because the caller
    /// never learns the packet id.
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
