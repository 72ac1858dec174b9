// transport.rs

use std::fmt;
use thiserror::Error;

/// Bit that marks a pipe as an IN (device-to-host) endpoint.
pub const PIPE_DIRECTION_IN: u8 = 0x80;

/// Status codes reported by the asynchronous transport.
///
/// `IoPending` and `IoIncomplete` mean "not finished yet, ask again". Everything
/// else returned from a submission or a completion poll is fatal for the queue
/// that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("I/O pending")]
    IoPending,
    #[error("I/O incomplete")]
    IoIncomplete,
    #[error("I/O error")]
    IoError,
    #[error("operation aborted")]
    Aborted,
    #[error("device not connected")]
    DeviceNotConnected,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("timeout occurred")]
    Timeout,
    #[error("transport status {0:#x}")]
    Other(u32),
}

impl TransportError {
    /// Whether the status only means the request has not finished yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::IoPending | TransportError::IoIncomplete)
    }

    /// Whether observing this status must tear the queue down.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

/// Identifier of a device endpoint. The top bit selects the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u8);

impl PipeId {
    pub fn direction(self) -> Direction {
        if self.0 & PIPE_DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_in(self) -> bool {
        self.direction() == Direction::In
    }

    /// Endpoint number with the direction bit stripped.
    pub fn number(self) -> u8 {
        self.0 & !PIPE_DIRECTION_IN
    }
}

impl From<u8> for PipeId {
    fn from(raw: u8) -> Self {
        PipeId(raw)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host, serviced with reads.
    In,
    /// Host to device, serviced with writes.
    Out,
}

/// Result of polling an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The request finished and moved this many bytes.
    Done(usize),
    /// The request is still in flight.
    Pending,
}

/// How to pick a device when opening a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Index(u32),
    SerialNumber(String),
    Description(String),
}

/// Trait defining the asynchronous transport interface
///
/// A transport issues overlapped reads and writes against pipes of one open
/// device. Every request is correlated with a completion token obtained from
/// [`acquire_token`](Transport::acquire_token); tokens are owned by the caller
/// and handed back through [`release_token`](Transport::release_token).
///
/// All methods must be non-blocking except `poll_completion` with `wait` set.
pub trait Transport: Send + Sync {
    /// Per-request bookkeeping object.
    type Token: Send;

    /// Allocate a completion token for one request.
    ///
    /// # Returns
    ///
    /// * `Result<Self::Token, TransportError>` - A fresh token or the reason none is available
    fn acquire_token(&self) -> Result<Self::Token, TransportError>;

    /// Return a token. The request tied to it must be finished or aborted.
    fn release_token(&self, token: Self::Token);

    /// Start an asynchronous read of `len` bytes from `pipe`.
    ///
    /// # Arguments
    ///
    /// * `pipe` - IN pipe to read from
    /// * `len` - Number of bytes requested
    /// * `token` - Token the completion will be reported on
    ///
    /// # Returns
    ///
    /// * `Result<(), TransportError>` - Ok if the request was accepted, pending or complete
    fn submit_read(&self, pipe: PipeId, len: usize, token: &mut Self::Token) -> Result<(), TransportError>;

    /// Start an asynchronous write of `data` to `pipe`.
    ///
    /// # Arguments
    ///
    /// * `pipe` - OUT pipe to write to
    /// * `data` - Bytes to send; the transport must not keep the borrow
    /// * `token` - Token the completion will be reported on
    ///
    /// # Returns
    ///
    /// * `Result<(), TransportError>` - Ok if the request was accepted, pending or complete
    fn submit_write(&self, pipe: PipeId, data: &[u8], token: &mut Self::Token) -> Result<(), TransportError>;

    /// Check on the request tied to `token`.
    ///
    /// For reads, received bytes are copied into `buffer` once the request is
    /// done. With `wait` set the call blocks until the request finishes, fails,
    /// or the pipe is aborted.
    ///
    /// # Returns
    ///
    /// * `Result<Completion, TransportError>` - Progress of the request or its failure status
    fn poll_completion(
        &self,
        token: &mut Self::Token,
        buffer: &mut [u8],
        wait: bool,
    ) -> Result<Completion, TransportError>;

    /// Cancel every outstanding request on `pipe`. Pending polls resolve to
    /// [`TransportError::Aborted`].
    fn abort_pipe(&self, pipe: PipeId) -> Result<(), TransportError>;

    /// Fix the transfer size of `pipe` to `chunk_size` bytes.
    fn configure_stream(&self, pipe: PipeId, chunk_size: usize) -> Result<(), TransportError>;

    /// Undo [`configure_stream`](Transport::configure_stream).
    fn clear_stream(&self, pipe: PipeId) -> Result<(), TransportError>;

    /// Close the device. Queues on this transport must be destroyed first.
    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transports that can be opened from a [`Selector`].
pub trait Open: Transport + Sized {
    fn open(selector: &Selector) -> Result<Self, TransportError>;
}
