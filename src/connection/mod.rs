//! The connection engine.
//!
//! [`Connection`] is a synchronous state machine: it never awaits and never
//! touches a socket directly. A driver feeds it stream events
//! ([`Connection::on_reset`], [`Connection::on_message`],
//! [`Connection::on_disconnect`]), calls [`Connection::poll_timers`] at
//! [`Connection::next_deadline`], and runs async stub futures handed out by
//! [`Connection::take_stub_job`]. Application calls (`apply`, `subscribe`,
//! ...) go straight to `&mut self`. [`crate::client::DdpClient`] is the
//! tokio driver; tests drive it by hand.
//!
//! ```text
//!  apply ──► stub (originals) ──► MethodInvoker ──► MethodBlocks ──► Stream
//!                                      ▲                              │
//!   callback ◄── settle ◄── result ────┤◄──── dispatch ◄──────────────┘
//!                           updated ───┘        │ added/changed/removed
//!                                               ▼
//!                   Quiescence ──► ServerDocumentTracker ──► WriteBuffer ──► Store
//! ```

mod admission;
mod blocks;
mod heartbeat;
mod invoker;
mod quiescence;
mod reconnect;
mod server_docs;
mod subscriptions;

#[cfg(test)]
mod tests;

pub use admission::{PendingCall, StubCompletion, StubJob};
pub use subscriptions::{
    SubErrorCallback, SubReadyCallback, SubStopCallback, SubscriptionCallbacks,
    SubscriptionHandle,
};

use crate::config::{ConnectionHooks, ConnectionOptions};
use crate::error::{DdpError, MethodError, Result};
use crate::method::{
    MethodCallback, MethodInvocation, MethodOptions, Stub, StubRegistry, StubResult,
};
use crate::protocol::{
    apply_changes, parse_server_frame, random_id, ClientMessage, DataMessage, Document, Inbound,
    ServerMessage,
};
use crate::store::{Store, StoreUpdate};
use crate::stream::{
    ConnectionStatus, DisconnectOptions, ReconnectOptions, Stream, StreamEvent,
};
use admission::AdmissionQueue;
use blocks::MethodBlocks;
use heartbeat::{Heartbeat, HeartbeatAction};
use invoker::MethodInvoker;
use quiescence::{Quiescence, WriteBuffer};
use serde_json::Value;
use server_docs::{AfterUpdate, ServerDocumentTracker};
use std::collections::{BTreeMap, HashMap};
use subscriptions::{Subscription, Subscriptions};
use tokio::time::Instant;

/// Called once a hot-code migration that was refused may proceed.
pub type MigrateRetry = Box<dyn FnOnce() + Send>;

/// Outcome of running a stub locally.
struct StubRun {
    result: StubResult,
    random_seed: Option<String>,
}

/// Client side of one DDP session (and its reconnections).
pub struct Connection {
    options: ConnectionOptions,
    hooks: ConnectionHooks,
    stream: Box<dyn Stream>,
    stores: BTreeMap<String, Box<dyn Store>>,
    stubs: StubRegistry,
    user_id: Option<String>,

    // Session / version negotiation
    version: Option<String>,
    version_suggestion: Option<String>,
    last_session_id: Option<String>,
    heartbeat: Option<Heartbeat>,

    // Methods
    next_method_id: u64,
    invokers: HashMap<String, MethodInvoker>,
    blocks: MethodBlocks,
    retry_migrate: Option<MigrateRetry>,
    admission: AdmissionQueue,

    // Data path
    server_docs: ServerDocumentTracker,
    after_update: Vec<AfterUpdate>,
    quiescence: Quiescence,
    write_buffer: WriteBuffer,
    reset_stores: bool,
    unknown_store_updates: HashMap<String, Vec<StoreUpdate>>,

    subscriptions: Subscriptions,
}

impl Connection {
    pub fn new(
        stream: Box<dyn Stream>,
        options: ConnectionOptions,
        hooks: ConnectionHooks,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            hooks,
            stream,
            stores: BTreeMap::new(),
            stubs: StubRegistry::default(),
            user_id: None,
            version: None,
            version_suggestion: None,
            last_session_id: None,
            heartbeat: None,
            next_method_id: 1,
            invokers: HashMap::new(),
            blocks: MethodBlocks::default(),
            retry_migrate: None,
            admission: AdmissionQueue::default(),
            server_docs: ServerDocumentTracker::default(),
            after_update: Vec::new(),
            quiescence: Quiescence::default(),
            write_buffer: WriteBuffer::default(),
            reset_stores: false,
            unknown_store_updates: HashMap::new(),
            subscriptions: Subscriptions::default(),
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Negotiated DDP version, once `connected` has been received.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    // ── Stores ──────────────────────────────────────────────────

    /// Attach the store for a collection. Data that arrived for it before
    /// registration is applied now in one transaction. Returns false if a
    /// store with this name already exists.
    pub fn register_store(&mut self, name: &str, mut store: Box<dyn Store>) -> bool {
        if self.stores.contains_key(name) {
            return false;
        }
        if let Some(queued) = self.unknown_store_updates.remove(name) {
            store.begin_update(queued.len(), false);
            for update in queued {
                store.update(update);
            }
            store.end_update();
        }
        self.stores.insert(name.to_string(), store);
        true
    }

    // ── Methods ─────────────────────────────────────────────────

    /// Register stubs. Fails without registering any if a name is taken.
    pub fn methods(&mut self, stubs: impl IntoIterator<Item = (String, Stub)>) -> Result<()> {
        self.stubs.register(stubs)
    }

    pub fn stubs(&self) -> &StubRegistry {
        &self.stubs
    }

    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        self.apply(name, args, MethodOptions::default(), callback)
    }

    /// Invoke a method: run its sync stub now, then send it.
    ///
    /// Returns the stub's value when `return_stub_value` is set. While an
    /// async stub is running, the call is queued behind it and `Ok(None)` is
    /// returned.
    pub fn apply(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        if self.admission.is_busy() {
            self.admission.enqueue_apply(name, args, options, callback);
            return Ok(None);
        }
        self.apply_now(name, args, options, callback)
    }

    fn apply_now(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        let stub_run = match self.stubs.get(name).cloned() {
            Some(Stub::Sync(stub)) => {
                let invocation = self.invocation(name);
                self.save_originals()?;
                let result = stub(&invocation, args.clone());
                Some(self.finish_invocation(&invocation, result))
            }
            Some(Stub::Async(_)) => {
                tracing::warn!(
                    method = name,
                    "method has an async stub; call it with apply_async to simulate it"
                );
                None
            }
            None => None,
        };
        self.send_method(name, args, options, callback, stub_run)
    }

    fn invocation(&self, name: &str) -> MethodInvocation {
        MethodInvocation::simulation(name, self.user_id.clone(), self.stubs.clone())
    }

    fn finish_invocation(&mut self, invocation: &MethodInvocation, result: StubResult) -> StubRun {
        if let Some(user_id) = invocation.take_user_id_change() {
            self.set_user_id(user_id);
        }
        StubRun {
            result,
            random_seed: invocation.generated_seed(),
        }
    }

    /// Assign an id, record stub effects and schedule the RPC.
    fn send_method(
        &mut self,
        name: &str,
        args: Vec<Value>,
        mut options: MethodOptions,
        callback: Option<MethodCallback>,
        stub: Option<StubRun>,
    ) -> Result<Option<Value>> {
        let method_id = self.next_method_id.to_string();
        self.next_method_id += 1;

        let mut random_seed = None;
        let mut stub_value = None;
        if let Some(run) = stub {
            self.retrieve_and_store_originals(&method_id)?;
            random_seed = run.random_seed;
            match run.result {
                Ok(value) => stub_value = Some(value),
                Err(err) if options.throw_stub_exceptions => {
                    self.abandon_stub_writes(&method_id)?;
                    return Err(DdpError::Stub(err));
                }
                Err(err) => {
                    tracing::warn!(
                        method = name,
                        error = %err,
                        "Exception while simulating the effect of invoking method"
                    );
                }
            }
        }

        let callback = callback.unwrap_or_else(|| log_error_callback(name));
        let message = ClientMessage::Method {
            id: method_id.clone(),
            method: name.to_string(),
            params: args,
            random_seed,
        };
        let invoker = MethodInvoker::new(
            method_id.clone(),
            message,
            callback,
            options.on_result_received.take(),
            options.wait,
            options.no_retry,
        );
        self.invokers.insert(method_id.clone(), invoker);
        self.add_outstanding_method(&method_id, options.wait)?;

        Ok(if options.return_stub_value {
            stub_value
        } else {
            None
        })
    }

    /// Before a stub runs: apply pending writes so they are not mistaken for
    /// stub writes, then start recording originals.
    fn save_originals(&mut self) -> Result<()> {
        if !self.quiescence.is_waiting() {
            self.flush_buffered_writes()?;
        }
        for store in self.stores.values_mut() {
            store.save_originals();
        }
        Ok(())
    }

    fn retrieve_and_store_originals(&mut self, method_id: &str) -> Result<()> {
        let mut writes = Vec::new();
        for (name, store) in self.stores.iter_mut() {
            if let Some(originals) = store.retrieve_originals() {
                if !originals.is_empty() {
                    writes.push((name.clone(), originals));
                }
            }
        }
        self.server_docs.record_stub_writes(method_id, writes)
    }

    /// Revert the writes of a stub whose method will never be sent.
    fn abandon_stub_writes(&mut self, method_id: &str) -> Result<()> {
        let (updates, released) = self.server_docs.method_data_done(method_id)?;
        for (collection, update) in updates {
            self.write_buffer.push(&collection, update);
        }
        self.after_update.extend(released);
        self.flush_buffered_writes()
    }

    fn add_outstanding_method(&mut self, method_id: &str, wait: bool) -> Result<()> {
        if self.blocks.enqueue(method_id.to_string(), wait) {
            self.send_invoker(method_id)?;
        }
        Ok(())
    }

    fn send_invoker(&mut self, method_id: &str) -> Result<()> {
        let Some(invoker) = self.invokers.get_mut(method_id) else {
            return Err(DdpError::invariant(format!(
                "no invoker for scheduled method {method_id}"
            )));
        };
        let frame = invoker.frame_for_send()?;
        if invoker.wait {
            self.quiescence.block_on_method(method_id);
        }
        self.stream.send(frame);
        Ok(())
    }

    fn send_outstanding_methods(&mut self) -> Result<()> {
        for method_id in self.blocks.first_methods() {
            self.send_invoker(&method_id)?;
        }
        Ok(())
    }

    fn mark_data_visible(&mut self, method_id: &str) -> Result<()> {
        if let Some(invoker) = self.invokers.get_mut(method_id) {
            invoker.mark_data_visible();
            self.maybe_settle(method_id)?;
        }
        Ok(())
    }

    /// Fire the callback if both result and data are in, then advance the
    /// block schedule.
    fn maybe_settle(&mut self, method_id: &str) -> Result<()> {
        if !self
            .invokers
            .get(method_id)
            .is_some_and(MethodInvoker::is_ready_to_settle)
        {
            return Ok(());
        }
        if let Some(invoker) = self.invokers.remove(method_id) {
            invoker.settle()?;
            self.outstanding_method_finished()?;
        }
        Ok(())
    }

    fn outstanding_method_finished(&mut self) -> Result<()> {
        if self.invokers.values().any(|i| i.sent_message) {
            return Ok(());
        }

        // Nothing in flight: the first block, if any, must be drained.
        if let Some(first) = self.blocks.pop_first() {
            if !first.methods.is_empty() {
                return Err(DdpError::invariant(format!(
                    "no methods outstanding but nonempty block: {:?}",
                    first.methods
                )));
            }
            if !self.blocks.is_empty() {
                self.send_outstanding_methods()?;
            }
        }

        self.maybe_migrate();
        Ok(())
    }

    /// Number of method calls whose callbacks have not fired yet.
    pub fn outstanding_methods(&self) -> usize {
        self.invokers.len()
    }

    // ── User ────────────────────────────────────────────────────

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        if self.user_id != user_id {
            tracing::debug!(user_id = ?user_id, "user changed");
            self.user_id = user_id;
        }
    }

    // ── Migration ───────────────────────────────────────────────

    /// Whether a hot-code migration may proceed now. If not, `retry` is kept
    /// and called once the last outstanding method settles.
    pub fn on_migrate(&mut self, retry: MigrateRetry) -> bool {
        if self.options.reload_with_outstanding || self.ready_to_migrate() {
            return true;
        }
        self.retry_migrate = Some(retry);
        false
    }

    pub fn ready_to_migrate(&self) -> bool {
        self.invokers.is_empty()
    }

    fn maybe_migrate(&mut self) {
        if self.retry_migrate.is_some() && self.ready_to_migrate() {
            if let Some(retry) = self.retry_migrate.take() {
                retry();
            }
        }
    }

    // ── Subscriptions ───────────────────────────────────────────

    /// Subscribe to a publication. An inactive subscription with the same
    /// name and params is reused instead of resubscribing.
    pub fn subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        if let Some(existing) = self.subscriptions.find_reusable(name, &params) {
            existing.reactivate(callbacks);
            return existing.handle();
        }

        let id = random_id();
        let sub = Subscription::new(id.clone(), name.to_string(), params.clone(), callbacks);
        let handle = sub.handle();
        self.subscriptions.insert(sub);
        tracing::debug!(sub_id = %id, name, "subscribing");
        self.send_queued(ClientMessage::Sub {
            id,
            name: name.to_string(),
            params,
        });
        handle
    }

    /// Stop a subscription. `unsub` goes through the same queue as `sub`, so
    /// the server never sees them reversed. Returns false if unknown.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        if self.subscriptions.get(id).is_none() {
            return false;
        }
        self.send_queued(ClientMessage::Unsub { id: id.to_string() });
        if let Some(sub) = self.subscriptions.remove(id) {
            sub.finish(None);
        }
        true
    }

    pub fn subscription_ready(&self, id: &str) -> bool {
        self.subscriptions.get(id).is_some_and(|s| s.ready)
    }

    /// Mark a subscription as belonging to an invalidated scope. A matching
    /// `subscribe` before [`Connection::stop_inactive_subscriptions`] keeps
    /// it alive.
    pub fn invalidate_subscription(&mut self, id: &str) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(sub) => {
                sub.inactive = true;
                true
            }
            None => false,
        }
    }

    /// Stop every subscription still marked inactive.
    pub fn stop_inactive_subscriptions(&mut self) {
        for id in self.subscriptions.inactive_ids() {
            self.unsubscribe(&id);
        }
    }

    pub fn unsubscribe_all(&mut self) {
        for id in self.subscriptions.ids() {
            self.unsubscribe(&id);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Stream control ──────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        self.stream.status()
    }

    pub fn reconnect(&mut self) {
        self.stream.reconnect(ReconnectOptions::default());
    }

    pub fn disconnect(&mut self) {
        self.stream.disconnect(DisconnectOptions::default());
    }

    /// Disconnect for good.
    pub fn close(&mut self) {
        self.stream.disconnect(DisconnectOptions {
            permanent: true,
            error: None,
        });
    }

    fn send_message(&mut self, msg: &ClientMessage) {
        self.stream.send(msg.to_frame());
    }

    /// Send behind any queued async work.
    fn send_queued(&mut self, msg: ClientMessage) {
        if self.admission.is_busy() {
            self.admission.enqueue_send(msg);
        } else {
            self.send_message(&msg);
        }
    }

    // ── Inbound ─────────────────────────────────────────────────

    pub fn handle_stream_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Reset => self.on_reset(),
            StreamEvent::Message(raw) => self.on_message(&raw),
            StreamEvent::Disconnect => {
                self.on_disconnect();
                Ok(())
            }
        }
    }

    pub fn on_disconnect(&mut self) {
        self.heartbeat = None;
    }

    /// Dispatch one inbound frame. Malformed and unknown frames are logged
    /// and dropped; `Err` means the connection state is no longer valid.
    pub fn on_message(&mut self, raw: &str) -> Result<()> {
        let inbound = match parse_server_frame(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(error = %e, "Exception while parsing DDP");
                return Ok(());
            }
        };

        // Any frame proves the server is alive.
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.message_received();
        }

        let msg = match inbound {
            Inbound::Message(msg) => msg,
            Inbound::ServerId => return Ok(()),
            Inbound::Invalid(value) => {
                tracing::debug!(message = %value, "discarding invalid livedata message");
                return Ok(());
            }
            Inbound::Unknown { kind, raw } => {
                tracing::debug!(kind = %kind, message = %raw, "discarding unknown livedata message type");
                return Ok(());
            }
            Inbound::Malformed { kind, error } => {
                tracing::warn!(kind = %kind, error = %error, "discarding malformed livedata message");
                return Ok(());
            }
        };

        match msg {
            ServerMessage::Connected { session } => {
                self.version = self.version_suggestion.clone();
                self.handle_connected(session)?;
                if let Some(on_connected) = self.hooks.on_connected.as_mut() {
                    on_connected();
                }
            }
            ServerMessage::Failed { version } => self.handle_failed(version),
            ServerMessage::Ping { id } => {
                if self.options.respond_to_pings {
                    self.send_message(&ClientMessage::Pong { id });
                }
            }
            ServerMessage::Pong { .. } => {}
            ServerMessage::Added {
                collection,
                id,
                fields,
            } => self.handle_data(DataMessage::Added {
                collection,
                id,
                fields,
            })?,
            ServerMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => self.handle_data(DataMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            })?,
            ServerMessage::Removed { collection, id } => {
                self.handle_data(DataMessage::Removed { collection, id })?
            }
            ServerMessage::Ready { subs } => self.handle_data(DataMessage::Ready { subs })?,
            ServerMessage::Updated { methods } => {
                self.handle_data(DataMessage::Updated { methods })?
            }
            ServerMessage::Nosub { id, error } => self.handle_nosub(id, error)?,
            ServerMessage::Result { id, result, error } => self.handle_result(id, result, error)?,
            ServerMessage::Error {
                reason,
                offending_message,
            } => {
                tracing::warn!(
                    reason = reason.as_deref().unwrap_or(""),
                    offending = ?offending_message,
                    "Received error from server"
                );
            }
        }
        Ok(())
    }

    fn handle_result(
        &mut self,
        id: String,
        result: Option<Value>,
        error: Option<MethodError>,
    ) -> Result<()> {
        // Results must not overtake data that arrived before them.
        if !self.write_buffer.is_empty() {
            self.flush_buffered_writes()?;
        }

        if self.blocks.is_empty() {
            tracing::debug!(method_id = %id, "Received method result but no methods outstanding");
            return Ok(());
        }
        if !self.blocks.remove_from_first(&id) {
            tracing::debug!(method_id = %id, "Can't match method response to original method call");
            return Ok(());
        }

        let outcome = match error {
            Some(err) => Err(err),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let Some(invoker) = self.invokers.get_mut(&id) else {
            return Err(DdpError::invariant(format!("no invoker for method {id}")));
        };
        invoker.receive_result(outcome)?;
        self.maybe_settle(&id)
    }

    fn handle_nosub(&mut self, id: String, error: Option<MethodError>) -> Result<()> {
        self.handle_data(DataMessage::Nosub { id: id.clone() })?;

        if let Some(sub) = self.subscriptions.remove(&id) {
            if let Some(err) = error.as_ref() {
                tracing::debug!(sub_id = %id, error = %err, "subscription stopped by server");
            }
            sub.finish(error);
        }
        Ok(())
    }

    // ── Data path ───────────────────────────────────────────────

    fn handle_data(&mut self, msg: DataMessage) -> Result<()> {
        let standard = msg.is_standard_write();

        if self.quiescence.is_waiting() {
            let Some(batch) = self.quiescence.hold(msg) else {
                return Ok(());
            };
            for held in batch {
                self.process_data_message(held)?;
            }
        } else {
            self.process_data_message(msg)?;
        }

        let interval = self.options.buffered_writes_interval();
        if interval.is_zero() || !standard {
            return self.flush_buffered_writes();
        }
        let max_age = self.options.buffered_writes_max_age();
        if self.write_buffer.note_write(Instant::now(), interval, max_age) {
            return self.flush_buffered_writes();
        }
        Ok(())
    }

    fn process_data_message(&mut self, msg: DataMessage) -> Result<()> {
        match msg {
            DataMessage::Added {
                collection,
                id,
                fields,
            } => self.process_added(collection, id, fields),
            DataMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => self.process_changed(collection, id, fields, cleared),
            DataMessage::Removed { collection, id } => self.process_removed(collection, id),
            DataMessage::Ready { subs } => {
                for sub_id in subs {
                    self.run_when_flushed(AfterUpdate::SubReady(sub_id));
                }
                Ok(())
            }
            DataMessage::Updated { methods } => self.process_updated(methods),
            DataMessage::Nosub { .. } => Ok(()),
        }
    }

    fn process_added(
        &mut self,
        collection: String,
        id: String,
        fields: Option<Document>,
    ) -> Result<()> {
        let Some(server_doc) = self.server_docs.get_mut(&collection, &id) else {
            self.write_buffer.push(
                &collection,
                StoreUpdate::Added {
                    id,
                    fields: fields.unwrap_or_default(),
                },
            );
            return Ok(());
        };

        // A stub wrote this document: the server's version is tracked, not
        // applied.
        let existed = server_doc.document.is_some();
        let mut document = fields.clone().unwrap_or_default();
        document.insert("_id".into(), Value::String(id.clone()));
        server_doc.document = Some(document);

        if self.reset_stores {
            // Stores are about to be wiped: re-add the current local version
            // so the stub's optimistic state survives the reset.
            let current = self
                .stores
                .get(&collection)
                .and_then(|store| store.get_doc(&id));
            let fields = current.or(fields).unwrap_or_default();
            self.write_buffer
                .push(&collection, StoreUpdate::Added { id, fields });
        } else if existed {
            return Err(DdpError::invariant(format!(
                "Server sent add for existing id: {id}"
            )));
        }
        Ok(())
    }

    fn process_changed(
        &mut self,
        collection: String,
        id: String,
        fields: Option<Document>,
        cleared: Option<Vec<String>>,
    ) -> Result<()> {
        match self.server_docs.get_mut(&collection, &id) {
            Some(server_doc) => {
                let Some(document) = server_doc.document.as_mut() else {
                    return Err(DdpError::invariant(format!(
                        "Server sent changed for nonexisting id: {id}"
                    )));
                };
                apply_changes(document, fields.as_ref(), cleared.as_deref());
            }
            None => self.write_buffer.push(
                &collection,
                StoreUpdate::Changed {
                    id,
                    fields,
                    cleared,
                },
            ),
        }
        Ok(())
    }

    fn process_removed(&mut self, collection: String, id: String) -> Result<()> {
        match self.server_docs.get_mut(&collection, &id) {
            Some(server_doc) => {
                if server_doc.document.take().is_none() {
                    return Err(DdpError::invariant(format!(
                        "Server sent removed for nonexisting id: {id}"
                    )));
                }
            }
            None => self
                .write_buffer
                .push(&collection, StoreUpdate::Removed { id }),
        }
        Ok(())
    }

    fn process_updated(&mut self, methods: Vec<String>) -> Result<()> {
        for method_id in methods {
            let (updates, released) = self.server_docs.method_data_done(&method_id)?;
            for (collection, update) in updates {
                self.write_buffer.push(&collection, update);
            }
            self.after_update.extend(released);

            if !self.invokers.contains_key(&method_id) {
                return Err(DdpError::invariant(format!(
                    "No callback invoker for method {method_id}"
                )));
            }
            self.run_when_flushed(AfterUpdate::DataVisible(method_id));
        }
        Ok(())
    }

    /// Defer `action` until every document blocked on a sent method has been
    /// written to its store.
    fn run_when_flushed(&mut self, action: AfterUpdate) {
        let invokers = &self.invokers;
        let is_sent = |method_id: &str| invokers.get(method_id).is_some_and(|i| i.sent_message);
        if let Some(action) = self.server_docs.run_when_flushed(action, is_sent) {
            self.after_update.push(action);
        }
    }

    fn flush_buffered_writes(&mut self) -> Result<()> {
        let writes = self.write_buffer.take();
        self.perform_writes(writes)
    }

    /// Apply writes to every store in one begin/update/end transaction, then
    /// run the deferred after-update actions.
    fn perform_writes(&mut self, writes: Vec<(String, Vec<StoreUpdate>)>) -> Result<()> {
        if self.reset_stores || !writes.is_empty() {
            for (name, store) in self.stores.iter_mut() {
                let count = writes
                    .iter()
                    .find(|(collection, _)| collection == name)
                    .map_or(0, |(_, updates)| updates.len());
                store.begin_update(count, self.reset_stores);
            }
            self.reset_stores = false;

            for (collection, updates) in writes {
                match self.stores.get_mut(&collection) {
                    Some(store) => {
                        for update in updates {
                            store.update(update);
                        }
                    }
                    None => {
                        // Nobody is listening yet; keep it for register_store.
                        self.unknown_store_updates
                            .entry(collection)
                            .or_default()
                            .extend(updates);
                    }
                }
            }

            for store in self.stores.values_mut() {
                store.end_update();
            }
        }

        self.run_after_update_callbacks()
    }

    fn run_after_update_callbacks(&mut self) -> Result<()> {
        for action in std::mem::take(&mut self.after_update) {
            match action {
                AfterUpdate::DataVisible(method_id) => self.mark_data_visible(&method_id)?,
                AfterUpdate::SubReady(sub_id) => {
                    // Already unsubscribed or already ready: nothing to do.
                    if let Some(sub) = self.subscriptions.get_mut(&sub_id) {
                        sub.mark_ready();
                    }
                }
            }
        }
        Ok(())
    }

    // ── Timers ──────────────────────────────────────────────────

    /// Run whatever timers are due: heartbeat, buffered-write flush, slow
    /// stub diagnostic.
    pub fn poll_timers(&mut self) -> Result<()> {
        let now = Instant::now();

        match self.heartbeat.as_mut().and_then(|hb| hb.poll(now)) {
            Some(HeartbeatAction::SendPing) => {
                self.send_message(&ClientMessage::Ping { id: None });
            }
            Some(HeartbeatAction::TimedOut) => {
                self.heartbeat = None;
                tracing::warn!("DDP heartbeat timed out");
                self.stream.lost_connection("DDP heartbeat timed out");
            }
            None => {}
        }

        // A running async stub is recording originals; server writes wait.
        if !self.admission.is_busy() && self.write_buffer.timer_due(now) {
            self.flush_buffered_writes()?;
        }

        self.admission
            .check_stalled(now, self.options.async_stub_warn_after());
        Ok(())
    }

    /// Earliest instant at which [`Connection::poll_timers`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        // The flush is deferred while an async stub runs; its deadline comes
        // back once the stub completes.
        let flush = if self.admission.is_busy() {
            None
        } else {
            self.write_buffer.deadline()
        };
        let candidates = [
            self.heartbeat.as_ref().map(Heartbeat::deadline),
            flush,
            self.admission
                .stall_deadline(self.options.async_stub_warn_after()),
        ];
        candidates.into_iter().flatten().min()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version)
            .field("session", &self.last_session_id)
            .field("outstanding_methods", &self.invokers.len())
            .field("method_blocks", &self.blocks.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Default callback when the caller supplies none: errors are logged.
fn log_error_callback(name: &str) -> MethodCallback {
    let name = name.to_string();
    Box::new(move |result: StubResult| {
        if let Err(err) = result {
            tracing::warn!(method = %name, error = %err, "Error invoking method");
        }
    })
}
