use std::io;
use thiserror::Error;

/// Central error type for the mapserve engine.
///
/// Protocol failures (malformed requests, missing files) never show up here;
/// they are [`HttpCode`](crate::http::HttpCode) outcomes answered on the wire.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A configuration value is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker pool was asked for an impossible shape.
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// A worker thread could not be spawned.
    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The connection table has no free slot left.
    #[error("Connection table is full")]
    TableFull,
}

pub type ServerResult<T> = Result<T, ServerError>;
