// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// Nothing due.
    Wait,

    /// The connection was idle for a full keep-alive interval, enqueue a
    /// ping request.
    SendPing,

    /// The broker missed the ping response deadline; treat like transport
    /// loss.
    Failed,
}

/// Keep-alive bookkeeping.
///
/// Any outbound packet counts as traffic, so pings only fill idle gaps.
/// A ping response must arrive within 1.5 keep-alive intervals of the
/// request, the grace the protocol grants brokers before they drop idle
/// clients.
pub(crate) struct Heartbeat {
    /// Zero disables the mechanism entirely.
    keep_alive: Duration,
    last_write: Instant,
    ping_deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(keep_alive_seconds: u16, now: Instant) -> Self {
        Self {
            keep_alive: Duration::from_secs(u64::from(keep_alive_seconds)),
            last_write: now,
            ping_deadline: None,
        }
    }

    /// Fresh transport, forget the old connection's traffic history.
    pub fn reset(&mut self, now: Instant) {
        self.last_write = now;
        self.ping_deadline = None;
    }

    /// Called whenever bytes go out on the wire.
    pub fn record_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    pub fn record_ping_response(&mut self) {
        self.ping_deadline = None;
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if self.keep_alive.is_zero() {
            return HeartbeatAction::Wait;
        }
        if let Some(deadline) = self.ping_deadline {
            if now >= deadline {
                return HeartbeatAction::Failed;
            }
            return HeartbeatAction::Wait;
        }
        if now.duration_since(self.last_write) >= self.keep_alive {
            self.ping_deadline = Some(now + self.keep_alive * 3 / 2);
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Wait
    }
}
