//! Subscription records and the handles given to callers.

use crate::error::MethodError;
use serde_json::Value;
use tokio::sync::watch;

pub type SubReadyCallback = Box<dyn FnOnce() + Send>;
/// Receives the error that ended the subscription, if any.
pub type SubStopCallback = Box<dyn FnOnce(Option<MethodError>) + Send>;
pub type SubErrorCallback = Box<dyn FnOnce(MethodError) + Send>;

/// Callbacks for one `subscribe` call.
#[derive(Default)]
pub struct SubscriptionCallbacks {
    pub on_ready: Option<SubReadyCallback>,
    pub on_stop: Option<SubStopCallback>,
    /// Older error-only callback; runs before `on_stop` when the server
    /// ends the subscription with an error.
    pub on_error: Option<SubErrorCallback>,
}

impl SubscriptionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl FnOnce(Option<MethodError>) + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(MethodError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallbacks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What the caller holds on to: the id and a live view of readiness.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    ready: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once the initial data set is visible; false again after the
    /// subscription is stopped.
    pub fn ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until ready. Returns false if the subscription ended first.
    pub async fn wait_ready(&mut self) -> bool {
        loop {
            if *self.ready.borrow_and_update() {
                return true;
            }
            if self.ready.changed().await.is_err() {
                return *self.ready.borrow();
            }
        }
    }
}

// ── Records ─────────────────────────────────────────────────────

pub(crate) struct Subscription {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) params: Vec<Value>,
    /// Marked by an invalidated scope; reused by a matching `subscribe` or
    /// stopped by `stop_inactive_subscriptions`.
    pub(crate) inactive: bool,
    pub(crate) ready: bool,
    ready_tx: watch::Sender<bool>,
    callbacks: SubscriptionCallbacks,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        name: String,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            id,
            name,
            params,
            inactive: false,
            ready: false,
            ready_tx,
            callbacks,
        }
    }

    pub(crate) fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id.clone(),
            ready: self.ready_tx.subscribe(),
        }
    }

    pub(crate) fn matches(&self, name: &str, params: &[Value]) -> bool {
        self.inactive && self.name == name && self.params == params
    }

    /// Reuse this record for a new `subscribe` call with the same arguments.
    /// Callbacks replace the old ones; `on_ready` runs now if already ready.
    pub(crate) fn reactivate(&mut self, callbacks: SubscriptionCallbacks) {
        self.inactive = false;
        if let Some(on_ready) = callbacks.on_ready {
            if self.ready {
                on_ready();
            } else {
                self.callbacks.on_ready = Some(on_ready);
            }
        }
        if callbacks.on_error.is_some() {
            self.callbacks.on_error = callbacks.on_error;
        }
        if callbacks.on_stop.is_some() {
            self.callbacks.on_stop = callbacks.on_stop;
        }
    }

    pub(crate) fn mark_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        if let Some(on_ready) = self.callbacks.on_ready.take() {
            on_ready();
        }
        self.ready_tx.send_replace(true);
    }

    /// Tear down: readiness observers see false, then the stop callbacks
    /// run.
    pub(crate) fn finish(mut self, error: Option<MethodError>) {
        self.ready_tx.send_replace(false);
        if let (Some(on_error), Some(err)) = (self.callbacks.on_error.take(), error.as_ref()) {
            on_error(err.clone());
        }
        if let Some(on_stop) = self.callbacks.on_stop.take() {
            on_stop(error);
        }
    }
}

/// Subscriptions in creation order.
#[derive(Default)]
pub(crate) struct Subscriptions {
    subs: Vec<Subscription>,
}

impl Subscriptions {
    pub(crate) fn get(&self, id: &str) -> Option<&Subscription> {
        self.subs.iter().find(|s| s.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Subscription> {
        self.subs.iter_mut().find(|s| s.id == id)
    }

    pub(crate) fn find_reusable(&mut self, name: &str, params: &[Value]) -> Option<&mut Subscription> {
        self.subs.iter_mut().find(|s| s.matches(name, params))
    }

    pub(crate) fn insert(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Subscription> {
        let idx = self.subs.iter().position(|s| s.id == id)?;
        Some(self.subs.remove(idx))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.iter()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.subs.iter().map(|s| s.id.clone()).collect()
    }

    pub(crate) fn ready_ids(&self) -> Vec<String> {
        self.subs
            .iter()
            .filter(|s| s.ready)
            .map(|s| s.id.clone())
            .collect()
    }

    pub(crate) fn inactive_ids(&self) -> Vec<String> {
        self.subs
            .iter()
            .filter(|s| s.inactive)
            .map(|s| s.id.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────
