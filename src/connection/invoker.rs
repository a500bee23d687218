//! One outstanding method call.

use crate::error::{DdpError, Result};
use crate::method::{MethodCallback, ResultReceivedCallback, StubResult};
use crate::protocol::ClientMessage;

/// Tracks a method from its first send until its callback fires.
///
/// The callback runs only once both the server's result has arrived and
/// every write the method caused is visible in the stores; the two events
/// may come in either order.
pub(crate) struct MethodInvoker {
    pub(crate) id: String,
    message: ClientMessage,
    callback: Option<MethodCallback>,
    on_result_received: Option<ResultReceivedCallback>,
    pub(crate) wait: bool,
    pub(crate) no_retry: bool,
    pub(crate) sent_message: bool,
    result: Option<StubResult>,
    data_visible: bool,
}

impl MethodInvoker {
    pub(crate) fn new(
        id: String,
        message: ClientMessage,
        callback: MethodCallback,
        on_result_received: Option<ResultReceivedCallback>,
        wait: bool,
        no_retry: bool,
    ) -> Self {
        Self {
            id,
            message,
            callback: Some(callback),
            on_result_received,
            wait,
            no_retry,
            sent_message: false,
            result: None,
            data_visible: false,
        }
    }

    /// The frame to put on the wire. Resending after a result is a bug: the
    /// server has already answered.
    pub(crate) fn frame_for_send(&mut self) -> Result<String> {
        if self.got_result() {
            return Err(DdpError::invariant(format!(
                "sending method {} that has already received a result",
                self.id
            )));
        }
        self.data_visible = false;
        self.sent_message = true;
        Ok(self.message.to_frame())
    }

    pub(crate) fn got_result(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn receive_result(&mut self, result: StubResult) -> Result<()> {
        if self.got_result() {
            return Err(DdpError::invariant(format!(
                "method {} received two results",
                self.id
            )));
        }
        if let Some(on_result) = self.on_result_received.take() {
            on_result(&result);
        }
        self.result = Some(result);
        Ok(())
    }

    pub(crate) fn mark_data_visible(&mut self) {
        self.data_visible = true;
    }

    pub(crate) fn is_ready_to_settle(&self) -> bool {
        self.data_visible && self.got_result()
    }

    /// Consume the invoker, delivering its result to the callback.
    pub(crate) fn settle(mut self) -> Result<()> {
        let (Some(callback), Some(result)) = (self.callback.take(), self.result.take()) else {
            return Err(DdpError::invariant(format!(
                "method {} settled twice or without a result",
                self.id
            )));
        };
        callback(result);
        Ok(())
    }
}

impl std::fmt::Debug for MethodInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInvoker")
            .field("id", &self.id)
            .field("wait", &self.wait)
            .field("no_retry", &self.no_retry)
            .field("sent_message", &self.sent_message)
            .field("got_result", &self.got_result())
            .field("data_visible", &self.data_visible)
            .finish()
    }
}
