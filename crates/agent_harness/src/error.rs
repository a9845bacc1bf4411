use std::path::PathBuf;

use thiserror::Error;

/// Programming errors raised directly by the drivers. Everything else — every
/// adapter failure — is surfaced as events on the session stream instead.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    #[error("adapter `{0}` is already registered")]
    DuplicateAdapter(String),
}

/// Failures an adapter production can yield mid-stream.
///
/// An `Err` item ends the production; the driver converts it into a
/// synthesized `error{ADAPTER_ERROR}` + `done{error}` pair unless the adapter
/// already emitted its terminal event.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn `{}`: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("thread resume requested but this adapter does not support resume")]
    ResumeUnsupported,

    #[error("{0}")]
    Message(String),
}
