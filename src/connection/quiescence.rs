//! When incoming data may reach the stores.
//!
//! Two independent gates sit in front of the stores:
//!
//! * [`Quiescence`] holds every data message back while revived
//!   subscriptions or wait-methods are still outstanding, then releases the
//!   whole batch in arrival order.
//! * [`WriteBuffer`] coalesces bursts of `added`/`changed`/`removed` writes
//!   and flushes them after a quiet interval or a maximum age.

use crate::protocol::DataMessage;
use crate::store::StoreUpdate;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

// ── Quiescence ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Quiescence {
    subs_being_revived: HashSet<String>,
    methods_blocking: HashSet<String>,
    buffered: Vec<DataMessage>,
}

impl Quiescence {
    pub(crate) fn is_waiting(&self) -> bool {
        !self.subs_being_revived.is_empty() || !self.methods_blocking.is_empty()
    }

    pub(crate) fn block_on_method(&mut self, id: &str) {
        self.methods_blocking.insert(id.to_string());
    }

    /// Start a fresh session: the given previously-ready subscriptions must
    /// deliver `ready` again before data is released. Blocking methods are
    /// forgotten; the caller re-adds those sent on the new link.
    pub(crate) fn start_session(&mut self, ready_subs: impl IntoIterator<Item = String>) {
        self.subs_being_revived = ready_subs.into_iter().collect();
        self.methods_blocking.clear();
    }

    pub(crate) fn clear_buffered(&mut self) {
        self.buffered.clear();
    }

    /// Hold `msg` back. Returns the full buffered batch once nothing blocks
    /// quiescence any more.
    pub(crate) fn hold(&mut self, msg: DataMessage) -> Option<Vec<DataMessage>> {
        match &msg {
            DataMessage::Nosub { id } => {
                self.subs_being_revived.remove(id);
            }
            DataMessage::Ready { subs } => {
                for sub in subs {
                    self.subs_being_revived.remove(sub);
                }
            }
            DataMessage::Updated { methods } => {
                for method in methods {
                    self.methods_blocking.remove(method);
                }
            }
            _ => {}
        }
        self.buffered.push(msg);

        if self.is_waiting() {
            None
        } else {
            Some(std::mem::take(&mut self.buffered))
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

// ── Write buffer ────────────────────────────────────────────────

/// Store writes not yet applied, grouped by collection in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    writes: Vec<(String, Vec<StoreUpdate>)>,
    flush_at: Option<Instant>,
    timer: Option<Instant>,
}

impl WriteBuffer {
    pub(crate) fn push(&mut self, collection: &str, update: StoreUpdate) {
        match self.writes.iter_mut().find(|(name, _)| name == collection) {
            Some((_, updates)) => updates.push(update),
            None => self.writes.push((collection.to_string(), vec![update])),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Take everything buffered and disarm the timers.
    pub(crate) fn take(&mut self) -> Vec<(String, Vec<StoreUpdate>)> {
        self.flush_at = None;
        self.timer = None;
        std::mem::take(&mut self.writes)
    }

    /// Account for a standard write that arrived at `now`. Returns true if
    /// the buffer has outlived `max_age` and must be flushed immediately;
    /// otherwise (re)arms the quiet-period timer.
    pub(crate) fn note_write(&mut self, now: Instant, interval: Duration, max_age: Duration) -> bool {
        match self.flush_at {
            None => self.flush_at = Some(now + max_age),
            Some(flush_at) if flush_at < now => return true,
            Some(_) => {}
        }
        self.timer = Some(now + interval);
        false
    }

    pub(crate) fn timer_due(&self, now: Instant) -> bool {
        self.timer.is_some_and(|t| now >= t)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timer
    }
}

// ── Tests ───────────────────────────────────────────────────────
