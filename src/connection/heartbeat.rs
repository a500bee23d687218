//! DDP-level liveness check.
//!
//! Every interval: if nothing arrived since the previous tick and no ping is
//! outstanding, send a ping and start the timeout. Any inbound frame cancels
//! the timeout. If it expires the link is declared lost.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    SendPing,
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_tick: Instant,
    timeout_at: Option<Instant>,
    seen_packet: bool,
}

impl Heartbeat {
    pub(crate) fn start(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_tick: now + interval,
            timeout_at: None,
            seen_packet: false,
        }
    }

    pub(crate) fn message_received(&mut self) {
        self.seen_packet = true;
        self.timeout_at = None;
    }

    pub(crate) fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if self.timeout_at.is_some_and(|t| now >= t) {
            self.timeout_at = None;
            return Some(HeartbeatAction::TimedOut);
        }
        if now < self.next_tick {
            return None;
        }
        while self.next_tick <= now {
            self.next_tick += self.interval;
        }

        let action = if !self.seen_packet && self.timeout_at.is_none() {
            self.timeout_at = Some(now + self.timeout);
            Some(HeartbeatAction::SendPing)
        } else {
            None
        };
        self.seen_packet = false;
        action
    }

    pub(crate) fn deadline(&self) -> Instant {
        match self.timeout_at {
            Some(t) if t < self.next_tick => t,
            _ => self.next_tick,
        }
    }
}
