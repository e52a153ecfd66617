// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use codec::{
    ConnectAckPacket, ConnectReturnCode, PacketId, SubscribeAckPacket, UnsubscribeAckPacket,
};

use crate::error::{Error, ErrorKind};

pub(crate) type AckWaiter = oneshot::Sender<Result<(), Error>>;

struct PendingConnect {
    deadline: Instant,
    waiter: AckWaiter,
}

struct PendingSubscribe {
    deadline: Instant,

    /// Absent for subscriptions replayed during session restoration; their
    /// original waiters completed long ago.
    waiter: Option<AckWaiter>,

    /// A failed restoration forces another reconnect instead of failing a
    /// caller.
    restore: bool,
}

struct PendingUnsubscribe {
    deadline: Instant,
    waiter: AckWaiter,
}

/// Correlates connect, subscribe and unsubscribe acknowledgements with the
/// callers waiting on them, and times out the ones the broker never
/// answers.
///
/// Connect has a single sentinel slot since at most one connect packet is
/// outstanding per transport; the other two tables key by packet id.
pub(crate) struct AckRouter {
    connect: Option<PendingConnect>,
    subscribes: HashMap<u16, PendingSubscribe>,
    unsubscribes: HashMap<u16, PendingUnsubscribe>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self {
            connect: None,
            subscribes: HashMap::new(),
            unsubscribes: HashMap::new(),
        }
    }

    pub fn register_connect(&mut self, waiter: AckWaiter, deadline: Instant) {
        if let Some(old) = self.connect.take() {
            let _ = old
                .waiter
                .send(Err(Error::new(ErrorKind::Cancelled, "connect superseded")));
        }
        self.connect = Some(PendingConnect { deadline, waiter });
    }

    pub fn on_connect_ack(&mut self, ack: &ConnectAckPacket) {
        let Some(pending) = self.connect.take() else {
            log::warn!("router: connect ack without pending connect");
            return;
        };
        let result = if ack.return_code() == ConnectReturnCode::Accepted {
            Ok(())
        } else {
            Err(Error::from_return_code(ack.return_code()))
        };
        let _ = pending.waiter.send(result);
    }

    pub fn fail_connect(&mut self, err: Error) {
        if let Some(pending) = self.connect.take() {
            let _ = pending.waiter.send(Err(err));
        }
    }

    pub fn register_subscribe(
        &mut self,
        packet_id: PacketId,
        waiter: Option<AckWaiter>,
        deadline: Instant,
        restore: bool,
    ) {
        let old = self.subscribes.insert(
            packet_id.value(),
            PendingSubscribe {
                deadline,
                waiter,
                restore,
            },
        );
        if old.is_some() {
            log::warn!("router: subscribe id {packet_id} reused while pending");
        }
    }

    pub fn register_unsubscribe(&mut self, packet_id: PacketId, waiter: AckWaiter, deadline: Instant) {
        let old = self
            .unsubscribes
            .insert(packet_id.value(), PendingUnsubscribe { deadline, waiter });
        if old.is_some() {
            log::warn!("router: unsubscribe id {packet_id} reused while pending");
        }
    }

    /// Route a subscribe acknowledgement. The request succeeded only when
    /// every return code grants a `QoS`. Returns true when a failed or
    /// stale restoration subscription means the session is out of sync and
    /// the supervisor should reconnect.
    pub fn on_subscribe_ack(&mut self, ack: &SubscribeAckPacket) -> bool {
        let Some(pending) = self.subscribes.remove(&ack.packet_id().value()) else {
            log::warn!("router: subscribe ack for unknown id {}", ack.packet_id());
            return false;
        };

        let result = match ack.acknowledgements().iter().find(|a| !a.is_granted()) {
            None if ack.acknowledgements().is_empty() => Err(Error::new(
                ErrorKind::MalformedPacket,
                "subscribe ack carried no return codes",
            )),
            None => Ok(()),
            Some(failed) => Err(Error::from_string(
                ErrorKind::SubscriptionFailed,
                format!("broker refused subscription: {failed:?}"),
            )),
        };

        let failed = result.is_err();
        if let Some(waiter) = pending.waiter {
            let _ = waiter.send(result);
        }
        failed && pending.restore
    }

    /// Protocol 3.1.1 unsubscribe acks carry no result codes, receipt is
    /// success.
    pub fn on_unsubscribe_ack(&mut self, ack: &UnsubscribeAckPacket) {
        let Some(pending) = self.unsubscribes.remove(&ack.packet_id().value()) else {
            log::warn!("router: unsubscribe ack for unknown id {}", ack.packet_id());
            return;
        };
        let _ = pending.waiter.send(Ok(()));
    }

    /// Fail a pending subscribe, e.g. when its packet was dropped as
    /// oversize. Returns true when it was a restoration entry.
    pub fn fail_subscribe(&mut self, packet_id: PacketId, err: Error) -> bool {
        let Some(pending) = self.subscribes.remove(&packet_id.value()) else {
            return false;
        };
        if let Some(waiter) = pending.waiter {
            let _ = waiter.send(Err(err));
        }
        pending.restore
    }

    pub fn fail_unsubscribe(&mut self, packet_id: PacketId, err: Error) {
        if let Some(pending) = self.unsubscribes.remove(&packet_id.value()) {
            let _ = pending.waiter.send(Err(err));
        }
    }

    /// Complete every entry whose deadline passed with `Timeout`. Returns
    /// true when a timed out restoration subscription calls for a
    /// reconnect.
    pub fn sweep(&mut self, now: Instant) -> bool {
        if self
            .connect
            .as_ref()
            .is_some_and(|pending| pending.deadline <= now)
        {
            self.fail_connect(Error::timeout("connect ack overdue"));
        }

        let mut restore_failed = false;
        let overdue: Vec<u16> = self
            .subscribes
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if let Some(pending) = self.subscribes.remove(&id) {
                restore_failed |= pending.restore;
                if let Some(waiter) = pending.waiter {
                    let _ = waiter.send(Err(Error::timeout("subscribe ack overdue")));
                }
            }
        }

        let overdue: Vec<u16> = self
            .unsubscribes
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if let Some(pending) = self.unsubscribes.remove(&id) {
                let _ = pending.waiter.send(Err(Error::timeout("unsubscribe ack overdue")));
            }
        }

        restore_failed
    }

    /// Terminal failure, every waiter is completed with `err`.
    pub fn fail_all(&mut self, err: &Error) {
        self.fail_connect(err.clone());
        for (_, pending) in self.subscribes.drain() {
            if let Some(waiter) = pending.waiter {
                let _ = waiter.send(Err(err.clone()));
            }
        }
        for (_, pending) in self.unsubscribes.drain() {
            let _ = pending.waiter.send(Err(err.clone()));
        }
    }
}
