//! Transport contract consumed by the connection.
//!
//! A [`Stream`] carries text frames and reports its lifecycle as
//! [`StreamEvent`]s: `Reset` once per physical (re)connection including the
//! first, `Message` per inbound frame, `Disconnect` when the link drops.
//! The connection only ever sends `connect` in response to `Reset`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle notifications from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Reset,
    Message(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Connecting,
    Connected,
    /// Permanently failed; will not retry.
    Failed,
    /// Waiting for the next retry.
    Waiting,
    /// Deliberately disconnected.
    Offline,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: StatusKind,
    pub connected: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionStatus {
    pub fn connecting() -> Self {
        Self {
            status: StatusKind::Connecting,
            connected: false,
            retry_count: 0,
            retry_time: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Drop the current link even if it is up.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Never reconnect again.
    pub permanent: bool,
    /// Reason recorded in the status when failing permanently.
    pub error: Option<String>,
}

/// The transport a [`Connection`](crate::connection::Connection) talks through.
pub trait Stream: Send {
    fn send(&mut self, frame: String);

    fn reconnect(&mut self, options: ReconnectOptions);

    fn disconnect(&mut self, options: DisconnectOptions);

    fn status(&self) -> ConnectionStatus;

    /// Called while handling `Reset`, before `connect` is sent. Frames sent
    /// earlier belong to the previous link.
    fn begin_session(&mut self) {}

    /// The link is considered dead (e.g. heartbeat timeout).
    fn lost_connection(&mut self, reason: &str) {
        tracing::debug!(reason, "connection lost");
        self.reconnect(ReconnectOptions { force: true });
    }
}

// ── Recording stream ────────────────────────────────────────────

#[cfg(any(test, feature = "mock"))]
pub use mock::MockStream;

#[cfg(any(test, feature = "mock"))]
mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug)]
    struct MockState {
        sent: Vec<String>,
        reconnects: Vec<ReconnectOptions>,
        disconnects: Vec<DisconnectOptions>,
        lost: Vec<String>,
        status: ConnectionStatus,
    }

    /// An in-memory stream that records everything sent through it.
    ///
    /// Clones share state, so a test can keep one handle and give another to the
    /// connection.
    #[derive(Debug, Clone)]
    pub struct MockStream {
        state: Arc<Mutex<MockState>>,
    }

    impl Default for MockStream {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockStream {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    sent: Vec::new(),
                    reconnects: Vec::new(),
                    disconnects: Vec::new(),
                    lost: Vec::new(),
                    status: ConnectionStatus::connecting(),
                })),
            }
        }

        /// Frames sent so far, parsed as JSON.
        pub fn sent(&self) -> Vec<serde_json::Value> {
            self.state
                .lock()
                .sent
                .iter()
                .filter_map(|frame| serde_json::from_str(frame).ok())
                .collect()
        }

        /// Drain the sent frames.
        pub fn take_sent(&self) -> Vec<serde_json::Value> {
            let frames = std::mem::take(&mut self.state.lock().sent);
            frames
                .iter()
                .filter_map(|frame| serde_json::from_str(frame).ok())
                .collect()
        }

        pub fn reconnects(&self) -> Vec<ReconnectOptions> {
            self.state.lock().reconnects.clone()
        }

        pub fn disconnects(&self) -> Vec<DisconnectOptions> {
            self.state.lock().disconnects.clone()
        }

        pub fn lost(&self) -> Vec<String> {
            self.state.lock().lost.clone()
        }

        pub fn set_status(&self, status: ConnectionStatus) {
            self.state.lock().status = status;
        }
    }

    impl Stream for MockStream {
        fn send(&mut self, frame: String) {
            self.state.lock().sent.push(frame);
        }

        fn reconnect(&mut self, options: ReconnectOptions) {
            self.state.lock().reconnects.push(options);
        }

        fn disconnect(&mut self, options: DisconnectOptions) {
            let mut state = self.state.lock();
            state.status = ConnectionStatus {
                status: if options.permanent {
                    StatusKind::Failed
                } else {
                    StatusKind::Offline
                },
                connected: false,
                retry_count: 0,
                retry_time: None,
                reason: options.error.clone(),
            };
            state.disconnects.push(options);
        }

        fn status(&self) -> ConnectionStatus {
            self.state.lock().status.clone()
        }

        fn lost_connection(&mut self, reason: &str) {
            self.state.lock().lost.push(reason.to_string());
        }
    }
}
