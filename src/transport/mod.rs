//! Framed bidirectional message channels.
//!
//! A transport delivers whole [`Message`]s in both directions. Sending is
//! safe from any number of threads; receiving surfaces a distinguished EOF
//! after closure, idempotently, and a decode failure poisons every
//! subsequent `recv` on that channel.

pub mod pair;
pub mod socket;

use std::time::Duration;

use thiserror::Error;

use crate::message::Message;

pub use pair::{PairTransport, pair};
pub use socket::SocketTransport;

/// Outcome of a successful `recv`.
#[derive(Clone, Debug, PartialEq)]
pub enum Received {
    Message(Message),
    Eof,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was closed locally before or during the call.
    #[error("transport closed")]
    Closed,
    /// The peer sent bytes that do not decode; fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
}

pub trait Transport: Send + Sync {
    /// Write one message. Serialization of concurrent senders is the
    /// transport's responsibility.
    fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// Block until a message arrives or the channel terminates.
    fn recv(&self) -> Result<Received, TransportError>;

    /// Like `recv` with an upper bound; `Ok(None)` on expiry. Expiry does
    /// not poison the channel. `Duration::MAX` waits indefinitely.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Received>, TransportError>;

    /// Close both directions; unblocks pending `recv` calls.
    fn close(&self);
}
