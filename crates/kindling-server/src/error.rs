use std::{io, net::SocketAddr};

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to start or supervise a server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Worker processes were already configured for this server.
    #[error("worker processes already configured")]
    OverLimit,
    #[error("failed to listen on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn worker")]
    Spawn(#[source] BoxError),
    /// The in-process worker stopped with an error.
    #[error("worker failed")]
    Worker(#[source] BoxError),
}

/// Invalid configuration value.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}
