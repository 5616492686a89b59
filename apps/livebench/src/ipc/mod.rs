//! Command delivery to remote viewer hosts.
//!
//! [`queue`] holds the delivery rules, [`client`] runs them over a TCP
//! connection and [`server`] is the receiving end.

pub mod client;
pub mod error;
pub mod queue;
pub mod server;

use livebench_wire::Frame;

pub use client::{ClientConfig, IpcClient};
pub use error::SocketErrorKind;
pub use queue::{CommandQueue, CorrelationId, FailureReason, RETRY_BACKOFF, RETRY_CEILING};
pub use server::{IpcServer, ReceivedCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Failed(SocketErrorKind),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Notifications published by an [`IpcClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The connection itself is unusable, independent of any command.
    ConnectionError(SocketErrorKind),
    SentSuccessfully(CorrelationId),
    SendingError(CorrelationId, FailureReason),
    Received(Frame),
}

/// Outcome of [`IpcClient::wait_for_sent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed(FailureReason),
    TimedOut,
}
