use crate::invoke::RemoteException;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the executor, the interchange and the fabric.
///
/// Per-task failures (a remote exception, an undecodable exception payload)
/// settle the task's handle; everything else is fatal to the operation that
/// returned it.
#[derive(Debug, Error)]
pub enum Error {
    /// The interchange did not report its worker-facing ports within the
    /// rendezvous window.
    #[error("interchange did not report worker ports within {0:?}")]
    InitTimeout(Duration),

    /// The provider returned no handle for a block submission.
    #[error("provider {provider} failed to provision blocks: {reason}")]
    ScalingFailed { provider: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A result-channel message that is not a well-formed result: missing
    /// task id, or neither/both of result and exception set.
    #[error("bad message on the result channel: {0}")]
    BadMessage(String),

    /// A remote exception arrived but its payload could not be decoded.
    #[error("failed to decode remote exception: {0}")]
    Deserialization(String),

    /// The task raised on the worker; carries the reconstructed error.
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// The executor has not been started yet.
    #[error("executor is not running")]
    NotStarted,

    /// The result demultiplexer died; no further submission can complete.
    #[error("executor failed: result demultiplexer is down")]
    ExecutorFailed,

    /// The executor shut down before the task settled.
    #[error("executor shut down before the task settled")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}
