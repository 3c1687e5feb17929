//! Multiplexed dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! caller enqueues requests
//!     → dispatcher.rs (FIFO queue, window accounting, sequence IDs)
//!     → handle.rs (request → transfer options)
//!     → multi.rs (register with transport, drive exchanges)
//!     → finished handle → Completion
//!     → ResponseHandler decides: accept, or replace and retry
//!     → slot refilled from a retry first, then from the queue
//! ```
//!
//! # Design Decisions
//! - One execution context drives every exchange; no task per request
//! - The active set never exceeds `window_size`, retries included
//! - Sequence IDs identify logical requests and survive retries
//! - Only an empty queue aborts `process()`; everything else is diagnostics

pub mod dispatcher;
pub mod handle;
pub mod multi;

use std::fmt;
use std::time::Duration;

use crate::http::{PendingRequest, Request, Response};
use crate::transport::{TransferCode, TransferError};

pub use dispatcher::{DispatchError, Dispatcher, RunReport};
pub use handle::{Handle, HandleConfig, HandleError, UploadReader, MEMORY_BODY_LIMIT};
pub use multi::{HandleToken, MultiLoop};

/// Correlation number of one logical request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(pub u64);

impl From<u64> for SequenceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SequenceId> for u64 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostics for one finished exchange.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    /// Native completion code.
    pub code: TransferCode,
    /// Classified failure, `None` when the exchange completed.
    pub error: Option<TransferError>,
    pub effective_url: Option<String>,
    pub total_time: Duration,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

/// Everything the response handler learns about a finished exchange.
#[derive(Debug)]
pub struct Completion {
    pub response: Response,
    /// The request this exchange performed.
    pub request: PendingRequest,
    pub sequence: SequenceId,
    /// How many times this logical request was retried before this exchange.
    pub retries: u32,
    /// Retries the dispatcher would still honour for this logical request.
    pub retries_remaining: u32,
    pub info: TransferInfo,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.info.error.is_none()
    }
}

/// Decides what happens to each finished exchange.
///
/// Returning a request asks the dispatcher to perform it under the same
/// sequence ID; returning `None` accepts the completion as final.
pub trait ResponseHandler: Send {
    fn on_response(&mut self, completion: Completion) -> Option<Request>;
}

impl<F> ResponseHandler for F
where
    F: FnMut(Completion) -> Option<Request> + Send,
{
    fn on_response(&mut self, completion: Completion) -> Option<Request> {
        self(completion)
    }
}
