//! Async stubs and the queue behind them.
//!
//! While an async stub runs, the stores are recording originals for it, so
//! nothing else may touch them: later calls, subscription frames and inbound
//! data all wait. The connection owns the queue; the driver owns the stub's
//! future. [`Connection::take_stub_job`] hands the future out and
//! [`Connection::complete_stub`] takes the result back.

use super::{Connection, StubRun};
use crate::error::{DdpError, Result};
use crate::method::{MethodCallback, MethodInvocation, MethodOptions, Stub, StubResult};
use crate::protocol::ClientMessage;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Where an async call reports back to its caller.
pub(crate) struct CallReply {
    stub_tx: oneshot::Sender<StubResult>,
    server_tx: oneshot::Sender<Result<Value>>,
}

pub(crate) enum QueuedWork {
    Apply {
        name: String,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    },
    ApplyAsync {
        name: String,
        args: Vec<Value>,
        options: MethodOptions,
        reply: CallReply,
    },
    Send(ClientMessage),
}

struct ActiveStub {
    ticket: u64,
    name: String,
    args: Vec<Value>,
    options: MethodOptions,
    invocation: MethodInvocation,
    reply: CallReply,
    started: Instant,
    warned: bool,
}

#[derive(Default)]
pub(crate) struct AdmissionQueue {
    active: Option<ActiveStub>,
    queue: VecDeque<QueuedWork>,
    job: Option<StubJob>,
    next_ticket: u64,
}

impl AdmissionQueue {
    /// True while anything must wait its turn.
    pub(crate) fn is_busy(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    pub(crate) fn enqueue_apply(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    ) {
        self.queue.push_back(QueuedWork::Apply {
            name: name.to_string(),
            args,
            options,
            callback,
        });
    }

    pub(crate) fn enqueue_send(&mut self, msg: ClientMessage) {
        self.queue.push_back(QueuedWork::Send(msg));
    }

    fn begin(
        &mut self,
        name: String,
        args: Vec<Value>,
        options: MethodOptions,
        invocation: MethodInvocation,
        reply: CallReply,
        future: BoxFuture<'static, StubResult>,
    ) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.job = Some(StubJob { ticket, future });
        self.active = Some(ActiveStub {
            ticket,
            name,
            args,
            options,
            invocation,
            reply,
            started: Instant::now(),
            warned: false,
        });
    }

    fn finish(&mut self, ticket: u64) -> Option<ActiveStub> {
        if self.active.as_ref().is_some_and(|a| a.ticket == ticket) {
            self.active.take()
        } else {
            None
        }
    }

    /// Log once if the running stub has taken longer than `warn_after`.
    pub(crate) fn check_stalled(&mut self, now: Instant, warn_after: Duration) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.warned && now >= active.started + warn_after {
            active.warned = true;
            tracing::warn!(
                method = %active.name,
                queued = self.queue.len(),
                elapsed_ms = (now - active.started).as_millis() as u64,
                "async stub is still running; queued calls are waiting on it"
            );
        }
    }

    pub(crate) fn stall_deadline(&self, warn_after: Duration) -> Option<Instant> {
        self.active
            .as_ref()
            .filter(|a| !a.warned)
            .map(|a| a.started + warn_after)
    }
}

/// An async stub's future, to be polled by the driver.
pub struct StubJob {
    ticket: u64,
    future: BoxFuture<'static, StubResult>,
}

impl StubJob {
    pub async fn run(self) -> StubCompletion {
        let result = self.future.await;
        StubCompletion {
            ticket: self.ticket,
            result,
        }
    }
}

impl std::fmt::Debug for StubJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubJob").field("ticket", &self.ticket).finish()
    }
}

/// The outcome of a [`StubJob`], fed back through
/// [`Connection::complete_stub`].
#[derive(Debug)]
pub struct StubCompletion {
    ticket: u64,
    result: StubResult,
}

/// Handle to an `apply_async` call.
#[derive(Debug)]
pub struct PendingCall {
    stub: oneshot::Receiver<StubResult>,
    server: oneshot::Receiver<Result<Value>>,
    return_server_result: bool,
}

impl PendingCall {
    /// The server's result if the call asked for it, otherwise the stub's
    /// value (`null` when there is no stub).
    pub async fn result(self) -> Result<Value> {
        if self.return_server_result {
            self.server_result().await
        } else {
            self.stub_value().await
        }
    }

    pub async fn server_result(self) -> Result<Value> {
        self.server.await.map_err(|_| DdpError::Closed)?
    }

    pub async fn stub_value(self) -> Result<Value> {
        match self.stub.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DdpError::Stub(err)),
            Err(_) => Err(DdpError::Closed),
        }
    }

    /// Both halves, for callers that want the stub value and then the
    /// server result.
    pub fn split(
        self,
    ) -> (
        oneshot::Receiver<StubResult>,
        oneshot::Receiver<Result<Value>>,
    ) {
        (self.stub, self.server)
    }
}

impl Connection {
    /// Invoke a method whose stub may be async.
    ///
    /// The stub's future is handed to the driver via
    /// [`Connection::take_stub_job`]; until it completes, later calls and
    /// subscription frames queue behind it.
    pub fn apply_async(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
    ) -> Result<PendingCall> {
        let (stub_tx, stub) = oneshot::channel();
        let (server_tx, server) = oneshot::channel();
        let pending = PendingCall {
            stub,
            server,
            return_server_result: options.return_server_result,
        };
        let reply = CallReply { stub_tx, server_tx };

        if self.admission.is_busy() {
            self.admission.queue.push_back(QueuedWork::ApplyAsync {
                name: name.to_string(),
                args,
                options,
                reply,
            });
        } else {
            self.start_async(name.to_string(), args, options, reply)?;
        }
        Ok(pending)
    }

    /// `apply_async` resolving to the server's result.
    pub fn call_async(&mut self, name: &str, args: Vec<Value>) -> Result<PendingCall> {
        self.apply_async(name, args, MethodOptions::default().with_return_server_result())
    }

    pub fn is_stub_running(&self) -> bool {
        self.admission.active.is_some()
    }

    pub fn take_stub_job(&mut self) -> Option<StubJob> {
        self.admission.job.take()
    }

    /// Finish the running async stub and admit whatever queued behind it.
    pub fn complete_stub(&mut self, completion: StubCompletion) -> Result<()> {
        let Some(active) = self.admission.finish(completion.ticket) else {
            tracing::warn!(
                ticket = completion.ticket,
                "completion for a stub that is not running"
            );
            return Ok(());
        };
        let run = self.finish_invocation(&active.invocation, completion.result);
        self.finish_async(&active.name, active.args, active.options, active.reply, Some(run))?;
        self.drain_admission_queue()
    }

    fn start_async(
        &mut self,
        name: String,
        args: Vec<Value>,
        options: MethodOptions,
        reply: CallReply,
    ) -> Result<()> {
        match self.stubs.get(&name).cloned() {
            Some(Stub::Async(stub)) => {
                let invocation = self.invocation(&name);
                self.save_originals()?;
                let future = stub(invocation.clone(), args.clone());
                tracing::debug!(method = %name, "async stub started");
                self.admission
                    .begin(name, args, options, invocation, reply, future);
                Ok(())
            }
            Some(Stub::Sync(stub)) => {
                let invocation = self.invocation(&name);
                self.save_originals()?;
                let result = stub(&invocation, args.clone());
                let run = self.finish_invocation(&invocation, result);
                self.finish_async(&name, args, options, reply, Some(run))
            }
            None => self.finish_async(&name, args, options, reply, None),
        }
    }

    fn finish_async(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        reply: CallReply,
        stub: Option<StubRun>,
    ) -> Result<()> {
        let CallReply { stub_tx, server_tx } = reply;
        let stub_value = stub
            .as_ref()
            .map_or(Ok(Value::Null), |run| run.result.clone());

        let server_tx = Arc::new(Mutex::new(Some(server_tx)));
        let callback_tx = server_tx.clone();
        let callback: MethodCallback = Box::new(move |result: StubResult| {
            if let Some(tx) = callback_tx.lock().take() {
                let _ = tx.send(result.map_err(DdpError::Method));
            }
        });

        match self.send_method(name, args, options, Some(callback), stub) {
            Ok(_) => {
                let _ = stub_tx.send(stub_value);
                Ok(())
            }
            Err(DdpError::Stub(err)) => {
                let _ = stub_tx.send(Err(err.clone()));
                if let Some(tx) = server_tx.lock().take() {
                    let _ = tx.send(Err(DdpError::Stub(err)));
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn drain_admission_queue(&mut self) -> Result<()> {
        while self.admission.active.is_none() {
            let Some(work) = self.admission.queue.pop_front() else {
                break;
            };
            match work {
                QueuedWork::Apply {
                    name,
                    args,
                    options,
                    callback,
                } => match self.apply_now(&name, args, options, callback) {
                    Ok(_) => {}
                    Err(DdpError::Stub(err)) => {
                        tracing::warn!(method = %name, error = %err, "queued method stub failed");
                    }
                    Err(e) => return Err(e),
                },
                QueuedWork::ApplyAsync {
                    name,
                    args,
                    options,
                    reply,
                } => self.start_async(name, args, options, reply)?,
                QueuedWork::Send(msg) => self.send_message(&msg),
            }
        }
        Ok(())
    }
}
