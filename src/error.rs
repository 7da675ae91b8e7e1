use thiserror::Error;

use crate::bencode::BencodeError;
use crate::config::ConfigFileError;
use crate::middleware::ConfigError;
use crate::server::ServerError;
use crate::transport::TransportError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; request-scoped failures
/// never reach this type, they surface in response status sets instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Middleware(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Config(#[from] ConfigFileError),
}
