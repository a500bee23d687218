//! Session establishment: the `connect` handshake, version negotiation and
//! the resync after a reconnect.

use super::heartbeat::Heartbeat;
use super::server_docs::AfterUpdate;
use super::Connection;
use crate::error::{DdpError, MethodError, Result};
use crate::protocol::{ClientMessage, LEGACY_VERSION};
use crate::stream::{DisconnectOptions, ReconnectOptions};
use tokio::time::Instant;

impl Connection {
    /// The stream opened a new socket. Called for the first connection too.
    ///
    /// Sends `connect`, fails `no_retry` methods that may have been lost,
    /// runs the reconnect hooks ahead of the old outstanding methods and
    /// resends every subscription.
    pub fn on_reset(&mut self) -> Result<()> {
        self.stream.begin_session();

        let version = self
            .version_suggestion
            .clone()
            .or_else(|| self.options.supported_ddp_versions.first().cloned())
            .ok_or_else(|| DdpError::Config("no supported DDP versions".into()))?;
        self.version_suggestion = Some(version.clone());
        self.send_message(&ClientMessage::Connect {
            version,
            support: self.options.supported_ddp_versions.clone(),
            session: self.last_session_id.clone(),
        });

        self.fail_unretriable_methods()?;
        self.blocks.pop_first_if_empty();

        // Nothing has been sent on the new socket yet.
        for invoker in self.invokers.values_mut() {
            invoker.sent_message = false;
        }

        self.run_reconnect_hooks()?;

        // Resubscribe last, after anything the hooks sent (typically login).
        let subs: Vec<ClientMessage> = self
            .subscriptions
            .iter()
            .map(|sub| ClientMessage::Sub {
                id: sub.id.clone(),
                name: sub.name.clone(),
                params: sub.params.clone(),
            })
            .collect();
        for sub in subs {
            self.send_queued(sub);
        }
        Ok(())
    }

    /// `no_retry` methods already sent in the first block may have run on
    /// the server; fail them instead of resending.
    fn fail_unretriable_methods(&mut self) -> Result<()> {
        let failed: Vec<String> = self
            .blocks
            .first_methods()
            .into_iter()
            .filter(|id| {
                self.invokers
                    .get(id)
                    .is_some_and(|i| i.sent_message && i.no_retry)
            })
            .collect();
        if failed.is_empty() {
            return Ok(());
        }

        for id in &failed {
            tracing::debug!(method_id = %id, "failing no-retry method after reconnect");
            if let Some(invoker) = self.invokers.get_mut(id) {
                invoker.receive_result(Err(MethodError::invocation_failed()))?;
            }
        }
        // The block may now be empty; it is only popped once the callbacks
        // have run.
        self.blocks.retain_in_first(|id| !failed.iter().any(|f| f == id));
        Ok(())
    }

    /// Methods called from the hooks go ahead of everything that was
    /// outstanding before the reset.
    fn run_reconnect_hooks(&mut self) -> Result<()> {
        let old_blocks = self.blocks.take();

        let mut hooks = std::mem::take(&mut self.hooks.on_reconnect);
        for hook in hooks.iter_mut() {
            hook(self);
        }
        // Keep hooks that were registered while the others ran.
        hooks.append(&mut self.hooks.on_reconnect);
        self.hooks.on_reconnect = hooks;

        for id in self.blocks.restore_after(old_blocks) {
            self.send_invoker(&id)?;
        }
        Ok(())
    }

    pub(super) fn handle_connected(&mut self, session: Option<String>) -> Result<()> {
        let interval = self.options.heartbeat_interval();
        if self.version.as_deref() != Some(LEGACY_VERSION) && !interval.is_zero() {
            self.heartbeat = Some(Heartbeat::start(
                interval,
                self.options.heartbeat_timeout(),
                Instant::now(),
            ));
        }

        if self.last_session_id.is_some() {
            self.reset_stores = true;
        }
        if let Some(session) = session {
            if self.last_session_id.as_deref() == Some(session.as_str()) {
                // Servers never resume sessions today; resync regardless.
                tracing::debug!(session = %session, "server reports the previous session");
            }
            tracing::info!(session = %session, version = ?self.version, "DDP session established");
            self.last_session_id = Some(session);
        }

        // Still-relevant data for unknown collections will be resent.
        self.unknown_store_updates.clear();
        if self.reset_stores {
            self.server_docs.clear();
        }
        self.after_update.clear();

        // Subscriptions that were ready must report ready again before the
        // new session's data is shown.
        self.quiescence.start_session(self.subscriptions.ready_ids());

        if self.reset_stores {
            let mut ids: Vec<&String> = self.invokers.keys().collect();
            ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
            let mut visible = Vec::new();
            for id in ids {
                let invoker = &self.invokers[id];
                if invoker.got_result() {
                    // Answered but its data never showed: settle at quiescence.
                    visible.push(AfterUpdate::DataVisible(id.clone()));
                } else if invoker.sent_message {
                    self.quiescence.block_on_method(id);
                }
            }
            self.after_update.extend(visible);
        }

        self.quiescence.clear_buffered();

        if !self.quiescence.is_waiting() {
            // Resets the stores (if needed) and runs the deferred callbacks.
            self.perform_writes(Vec::new())?;
        }
        Ok(())
    }

    pub(super) fn handle_failed(&mut self, version: Option<String>) {
        let version = version.unwrap_or_default();
        if self.options.supported_ddp_versions.contains(&version) {
            tracing::info!(version = %version, "server proposed another DDP version; reconnecting");
            self.version_suggestion = Some(version);
            self.stream.reconnect(ReconnectOptions { force: true });
            return;
        }

        let description = DdpError::VersionNegotiation(version).to_string();
        self.stream.disconnect(DisconnectOptions {
            permanent: true,
            error: Some(description.clone()),
        });
        (self.hooks.on_ddp_version_negotiation_failure)(&description);
    }
}
