//! Threaded pipe queue library
//!
//! This library keeps asynchronous pipe transports busy: a dedicated requester
//! thread per pipe continuously issues reads (or drains queued writes) while
//! callers read and write whole chunks at their own pace.

pub mod buffer_list;
pub mod error;
pub mod loopback;
pub mod queue;
pub mod registry;
pub mod transport;

mod requester;

// Re-export main types for convenience
pub use error::QueueError;
pub use loopback::LoopbackTransport;
pub use queue::{QueueConfig, QueueMetrics};
pub use registry::{QueueHandle, Registry};
pub use transport::{Completion, Direction, Open, PipeId, Selector, Transport, TransportError};

/// Library version packed as `0xAABBCCDD` for version AA.BB.CC.DD.
///
/// The crate's MAJOR.MINOR.PATCH maps to AA.BB.0.DD, so 1.0.15 reads as
/// 1.0.0.15.
pub fn version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0) & 0xff;
    (part(env!("CARGO_PKG_VERSION_MAJOR")) << 24)
        | (part(env!("CARGO_PKG_VERSION_MINOR")) << 16)
        | part(env!("CARGO_PKG_VERSION_PATCH"))
}
