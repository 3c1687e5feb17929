//! HTTP message values.
//!
//! # Data Flow
//! ```text
//! caller builds Request
//!     → request.rs (immutable, shared as PendingRequest)
//!     → dispatcher queue → handle → transport
//!     → response.rs (assembled by handle callbacks)
//!     → delivered to the response handler
//! ```
//!
//! # Design Decisions
//! - Requests never change after enqueue; retries submit a replacement
//! - Responses are assembled in place and handed off by value

pub mod request;
pub mod response;

pub use request::{BodySource, FileBody, PendingRequest, ReaderBody, Request, RequestBody, RequestError};
pub use response::{DefaultResponseFactory, Response, ResponseFactory};
