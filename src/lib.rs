#![forbid(unsafe_code)]

pub mod bencode;
pub mod config;
pub mod error;
pub mod eval;
pub mod message;
pub mod middleware;
pub mod runtime;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Crate version reported by the `describe` op.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version reported by the `describe` op.
pub const PROTOCOL_VERSION: &str = "1";
