//! Error types shared by the relay engines, the configuration loader and
//! the mutation pipeline.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect upstream {addr}: {source}")]
    UpstreamConnect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Failures of a single mutator invocation. The composed mutation
/// operations swallow these and fall back to the unmutated input.
#[derive(Debug, Error)]
pub enum MutatorError {
    #[error("failed to spawn mutator: {0}")]
    Spawn(#[source] io::Error),
    #[error("mutator pipe error: {0}")]
    Pipe(#[source] io::Error),
    #[error("mutator produced no output")]
    Empty,
    #[error("mutator did not finish within {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to reap mutator: {0}")]
    Wait(#[source] io::Error),
}
