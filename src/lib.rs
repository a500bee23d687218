//! Client-side DDP connection engine.
//!
//! [`Connection`] is the sans-IO core: it runs method stubs against local
//! stores, tracks which documents the server has confirmed, buffers server
//! writes until quiescent, and replays state across reconnects.
//! [`DdpClient`] drives a connection over a WebSocket on a tokio task.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod method;
pub mod protocol;
pub mod store;
pub mod stream;
pub mod transport;

pub use client::{ClientSubscription, DdpClient};
pub use config::{ConnectionHooks, ConnectionOptions};
pub use connection::{
    Connection, PendingCall, StubCompletion, StubJob, SubscriptionCallbacks, SubscriptionHandle,
};
pub use error::{DdpError, MethodError, Result};
pub use method::{MethodInvocation, MethodOptions, Stub, StubResult};
pub use protocol::Document;
pub use store::{MemoryStore, Store, StoreUpdate};
pub use stream::{ConnectionStatus, Stream, StreamEvent};
#[cfg(any(test, feature = "mock"))]
pub use stream::MockStream;
