use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by queue operations.
///
/// `Busy`, `NoMoreItems`, `IoPending` and `IoIncomplete` are expected while
/// streaming and leave the queue untouched. `Transport` from `read` or
/// `write_status` means the queue has been torn down; from `create_queue` it
/// means the pipe could not be configured and no queue was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Missing, short or wrong-direction argument, or a stale queue handle.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The queue is at capacity.
    #[error("queue is full")]
    Busy,
    /// Nothing is buffered.
    #[error("no more items")]
    NoMoreItems,
    /// A write is queued but has not been handed to the transport yet.
    #[error("I/O pending")]
    IoPending,
    /// The oldest request has not completed yet.
    #[error("I/O incomplete")]
    IoIncomplete,
    /// Memory or a completion token could not be allocated.
    #[error("no system resources")]
    NoSystemResources,
    /// A queue already exists for this transport and pipe.
    #[error("pipe already reserved")]
    PipeReserved,
    /// Fatal transport status; the queue has been destroyed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl QueueError {
    /// Whether the same call may succeed later without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Busy | QueueError::NoMoreItems | QueueError::IoPending | QueueError::IoIncomplete
        )
    }
}
