//! Method stubs and the simulation context they run in.
//!
//! A stub is the local, optimistic version of a remote method. It runs with
//! an explicit [`MethodInvocation`] describing the simulation: calls a stub
//! makes through its invocation are nested simulations and never reach the
//! network.

use crate::error::{DdpError, MethodError, Result};
use crate::protocol::rpc_seed;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type StubResult = std::result::Result<Value, MethodError>;

pub type SyncStubFn = dyn Fn(&MethodInvocation, Vec<Value>) -> StubResult + Send + Sync;
pub type AsyncStubFn =
    dyn Fn(MethodInvocation, Vec<Value>) -> BoxFuture<'static, StubResult> + Send + Sync;

/// Delivered exactly once with the method's outcome.
pub type MethodCallback = Box<dyn FnOnce(StubResult) + Send>;

/// Called as soon as the server's result arrives, before data is visible.
pub type ResultReceivedCallback = Box<dyn FnOnce(&StubResult) + Send>;

/// A registered stub body.
#[derive(Clone)]
pub enum Stub {
    Sync(Arc<SyncStubFn>),
    Async(Arc<AsyncStubFn>),
}

impl Stub {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&MethodInvocation, Vec<Value>) -> StubResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(MethodInvocation, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StubResult> + Send + 'static,
    {
        Self::Async(Arc::new(
            move |invocation: MethodInvocation, args: Vec<Value>| -> BoxFuture<'static, StubResult> {
                f(invocation, args).boxed()
            },
        ))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_async() { "Stub::Async" } else { "Stub::Sync" })
    }
}

// ── Registry ────────────────────────────────────────────────────

/// Name -> stub. Cheap to clone; invocations carry a snapshot so nested
/// calls can find their stubs.
#[derive(Debug, Clone, Default)]
pub struct StubRegistry {
    stubs: Arc<HashMap<String, Stub>>,
}

impl StubRegistry {
    pub fn get(&self, name: &str) -> Option<&Stub> {
        self.stubs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stubs.contains_key(name)
    }

    /// Register a batch of stubs. Fails without registering anything if any
    /// name is already taken or repeated in the batch.
    pub fn register(&mut self, stubs: impl IntoIterator<Item = (String, Stub)>) -> Result<()> {
        let batch: Vec<(String, Stub)> = stubs.into_iter().collect();
        {
            let mut seen = std::collections::HashSet::new();
            for (name, _) in &batch {
                if self.stubs.contains_key(name) || !seen.insert(name.as_str()) {
                    return Err(DdpError::DuplicateMethod(name.clone()));
                }
            }
        }
        let stubs = Arc::make_mut(&mut self.stubs);
        for (name, stub) in batch {
            stubs.insert(name, stub);
        }
        Ok(())
    }
}

// ── Options ─────────────────────────────────────────────────────

/// Per-call options.
#[derive(Default)]
pub struct MethodOptions {
    /// Run in isolation: nothing before it may still be in flight when it is
    /// sent, nothing after it is sent until it settles.
    pub wait: bool,
    /// Fail with `invocation-failed` instead of resending after a reconnect.
    pub no_retry: bool,
    pub on_result_received: Option<ResultReceivedCallback>,
    /// `apply` returns the stub's value instead of `None`.
    pub return_stub_value: bool,
    /// A failing stub aborts the call and is returned to the caller.
    pub throw_stub_exceptions: bool,
    /// `apply_async` resolves to the server's result rather than the stub's.
    pub return_server_result: bool,
}

impl MethodOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn with_no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    pub fn with_return_stub_value(mut self) -> Self {
        self.return_stub_value = true;
        self
    }

    pub fn with_throw_stub_exceptions(mut self) -> Self {
        self.throw_stub_exceptions = true;
        self
    }

    pub fn with_return_server_result(mut self) -> Self {
        self.return_server_result = true;
        self
    }

    pub fn on_result_received(mut self, f: impl FnOnce(&StubResult) + Send + 'static) -> Self {
        self.on_result_received = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for MethodOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodOptions")
            .field("wait", &self.wait)
            .field("no_retry", &self.no_retry)
            .field("return_stub_value", &self.return_stub_value)
            .field("throw_stub_exceptions", &self.throw_stub_exceptions)
            .field("return_server_result", &self.return_server_result)
            .finish_non_exhaustive()
    }
}

// ── Invocation context ──────────────────────────────────────────

/// The context a stub runs in.
#[derive(Clone)]
pub struct MethodInvocation {
    name: String,
    is_simulation: bool,
    user_id: Option<String>,
    random_seed: Arc<Mutex<Option<String>>>,
    pending_user_id: Arc<Mutex<Option<Option<String>>>>,
    registry: StubRegistry,
}

impl MethodInvocation {
    pub(crate) fn simulation(name: &str, user_id: Option<String>, registry: StubRegistry) -> Self {
        Self {
            name: name.to_string(),
            is_simulation: true,
            user_id,
            random_seed: Arc::new(Mutex::new(None)),
            pending_user_id: Arc::new(Mutex::new(None)),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_simulation(&self) -> bool {
        self.is_simulation
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Seed shared with the server so ids generated by the stub match the
    /// ones the server generates. Created on first use; only sent if used.
    pub fn random_seed(&self) -> String {
        self.random_seed.lock().get_or_insert_with(rpc_seed).clone()
    }

    /// Change the connection's user id once this stub returns.
    pub fn set_user_id(&self, user_id: Option<String>) {
        *self.pending_user_id.lock() = Some(user_id);
    }

    pub(crate) fn generated_seed(&self) -> Option<String> {
        self.random_seed.lock().clone()
    }

    pub(crate) fn take_user_id_change(&self) -> Option<Option<String>> {
        self.pending_user_id.lock().take()
    }

    fn nested(&self, name: &str) -> Self {
        Self::simulation(name, self.user_id.clone(), self.registry.clone())
    }

    /// Call another method from inside a stub. Only its stub runs; nothing
    /// is sent. A method with no stub yields `null`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> StubResult {
        self.apply(name, args)
    }

    pub fn apply(&self, name: &str, args: Vec<Value>) -> StubResult {
        match self.registry.get(name) {
            Some(Stub::Sync(stub)) => {
                let nested = self.nested(name);
                let result = stub(&nested, args);
                self.adopt_user_id_change(&nested);
                result
            }
            Some(Stub::Async(_)) => Err(MethodError::new(
                400,
                format!("Can't call async method '{name}' synchronously from a stub"),
            )),
            None => Ok(Value::Null),
        }
    }

    /// Nested call that may await an async stub.
    pub async fn apply_async(&self, name: &str, args: Vec<Value>) -> StubResult {
        let nested = self.nested(name);
        let result = match self.registry.get(name).cloned() {
            Some(Stub::Sync(stub)) => stub(&nested, args),
            Some(Stub::Async(stub)) => stub(nested.clone(), args).await,
            None => Ok(Value::Null),
        };
        self.adopt_user_id_change(&nested);
        result
    }

    fn adopt_user_id_change(&self, nested: &MethodInvocation) {
        if let Some(change) = nested.take_user_id_change() {
            self.set_user_id(change);
        }
    }
}

impl std::fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInvocation")
            .field("name", &self.name)
            .field("is_simulation", &self.is_simulation)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────
