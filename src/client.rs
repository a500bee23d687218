//! Async front end: a tokio task that owns a [`Connection`].
//!
//! The task multiplexes four sources with `tokio::select!`: requests from
//! [`DdpClient`] handles, stream events, the connection's timers, and the
//! future of the async stub currently running. Stream events are held back
//! while a stub runs so server writes cannot interleave with its simulation.

use crate::config::{ConnectionHooks, ConnectionOptions};
use crate::connection::{
    Connection, PendingCall, StubCompletion, SubscriptionCallbacks, SubscriptionHandle,
};
use crate::error::{DdpError, Result};
use crate::method::{MethodCallback, MethodOptions, Stub};
use crate::store::Store;
use crate::stream::{ConnectionStatus, StreamEvent};
use crate::transport::WebSocketStream;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

/// Cloneable handle to a running connection.
#[derive(Clone, Debug)]
pub struct DdpClient {
    jobs: mpsc::UnboundedSender<Job>,
}

impl DdpClient {
    /// Open a WebSocket to `url` and start the connection task.
    pub async fn connect(
        url: &str,
        options: ConnectionOptions,
        hooks: ConnectionHooks,
    ) -> Result<Self> {
        options.validate()?;
        let (stream, events) = WebSocketStream::spawn(url, &options);
        let connection = Connection::new(Box::new(stream), options, hooks)?;
        tracing::info!(url, "DDP client started");
        Ok(Self::spawn(connection, events))
    }

    /// Drive an existing connection from `events`.
    pub fn spawn(connection: Connection, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        let (jobs, job_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(connection, events, job_rx));
        Self { jobs }
    }

    /// Run `f` on the connection task and return its result.
    pub async fn with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |conn: &mut Connection| {
                let _ = tx.send(f(conn));
            }))
            .map_err(|_| DdpError::Closed)?;
        rx.await.map_err(|_| DdpError::Closed)
    }

    /// Call a method and wait for the server's result.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.call_async(name, args).await?.result().await
    }

    /// Fire-and-forget `apply`: the stub runs and the method is sent; the
    /// outcome goes to `callback`. Returns the stub value if requested.
    pub async fn apply(
        &self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>> {
        let name = name.to_string();
        self.with(move |conn| conn.apply(&name, args, options, callback))
            .await?
    }

    pub async fn apply_async(
        &self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
    ) -> Result<PendingCall> {
        let name = name.to_string();
        self.with(move |conn| conn.apply_async(&name, args, options))
            .await?
    }

    pub async fn call_async(&self, name: &str, args: Vec<Value>) -> Result<PendingCall> {
        let name = name.to_string();
        self.with(move |conn| conn.call_async(&name, args)).await?
    }

    pub async fn methods(&self, stubs: Vec<(String, Stub)>) -> Result<()> {
        self.with(move |conn| conn.methods(stubs)).await?
    }

    pub async fn register_store(&self, name: &str, store: Box<dyn Store>) -> Result<bool> {
        let name = name.to_string();
        self.with(move |conn| conn.register_store(&name, store))
            .await
    }

    pub async fn subscribe(
        &self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> Result<ClientSubscription> {
        let name = name.to_string();
        let handle = self
            .with(move |conn| conn.subscribe(&name, params, callbacks))
            .await?;
        Ok(ClientSubscription {
            handle,
            client: self.clone(),
        })
    }

    pub async fn status(&self) -> Result<ConnectionStatus> {
        self.with(|conn| conn.status()).await
    }

    pub async fn user_id(&self) -> Result<Option<String>> {
        self.with(|conn| conn.user_id().map(str::to_string)).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.with(|conn| conn.reconnect()).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.with(|conn| conn.disconnect()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.with(|conn| conn.close()).await
    }
}

/// A subscription made through a [`DdpClient`].
#[derive(Debug)]
pub struct ClientSubscription {
    handle: SubscriptionHandle,
    client: DdpClient,
}

impl ClientSubscription {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn ready(&self) -> bool {
        self.handle.ready()
    }

    pub async fn wait_ready(&mut self) -> bool {
        self.handle.wait_ready().await
    }

    pub async fn stop(self) -> Result<bool> {
        let id = self.handle.id().to_string();
        self.client.with(move |conn| conn.unsubscribe(&id)).await
    }
}

// ── Driver ──────────────────────────────────────────────────────

enum Wake {
    Stub(StubCompletion),
    Job(Option<Job>),
    Event(Option<StreamEvent>),
    Timer,
}

async fn drive(
    mut conn: Connection,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    let mut running: Option<BoxFuture<'static, StubCompletion>> = None;

    loop {
        if running.is_none() {
            running = conn.take_stub_job().map(|job| job.run().boxed());
        }
        let deadline = conn.next_deadline();
        let hold_events = conn.is_stub_running();

        let wake = tokio::select! {
            completion = next_completion(&mut running), if running.is_some() => Wake::Stub(completion),
            job = jobs.recv() => Wake::Job(job),
            event = events.recv(), if !hold_events => Wake::Event(event),
            () = sleep_until(deadline) => Wake::Timer,
        };

        let outcome = match wake {
            Wake::Stub(completion) => {
                running = None;
                conn.complete_stub(completion)
            }
            Wake::Job(Some(job)) => {
                job(&mut conn);
                Ok(())
            }
            Wake::Job(None) => {
                tracing::debug!("all client handles dropped; closing connection");
                conn.close();
                return;
            }
            Wake::Event(Some(event)) => conn.handle_stream_event(event),
            Wake::Event(None) => {
                tracing::debug!("stream ended; connection task exiting");
                return;
            }
            Wake::Timer => conn.poll_timers(),
        };

        if let Err(e) = outcome {
            if e.is_fatal() {
                tracing::error!(error = %e, "DDP connection state corrupted; closing");
                conn.close();
                return;
            }
            tracing::warn!(error = %e, "DDP connection error");
        }
    }
}

async fn next_completion(running: &mut Option<BoxFuture<'static, StubCompletion>>) -> StubCompletion {
    match running {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────
