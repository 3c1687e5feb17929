//! Concurrent multiplexed HTTP request dispatcher.
//!
//! # Architecture Overview
//!
//! ```text
//!     caller
//!       │ enqueue(Request)                         ┌──────────────────────────┐
//!       ▼                                          │   Cross-Cutting Concerns │
//!   ┌──────────┐  admit   ┌────────┐  register    │  config  observability   │
//!   │  queue   │────────▶│ Handle │────────────┐ │  lifecycle  resilience   │
//!   │  (FIFO)  │         │ init() │            │ └──────────────────────────┘
//!   └──────────┘         └────────┘            ▼
//!        ▲                              ┌─────────────┐   perform   ┌───────────┐
//!        │ refill                       │  MultiLoop  │────────────▶│ Transport │
//!        │                              │ (event loop)│◀────────────│ (reqwest) │
//!   ┌──────────┐  replacement           └──────┬──────┘  callbacks  └───────────┘
//!   │ Response │◀──────────────────────────────┘
//!   │ Handler  │  Completion (response, request, sequence, diagnostics)
//!   └──────────┘
//! ```
//!
//! Requests are admitted into a bounded window, driven concurrently from one
//! execution context, and handed to a response handler that may ask for a
//! retry under the same sequence ID.

// Core subsystems
pub mod dispatch;
pub mod http;
pub mod transport;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::DispatchConfig;
pub use dispatch::{
    Completion, DispatchError, Dispatcher, ResponseHandler, RunReport, SequenceId, TransferInfo,
};
pub use http::{Request, Response};
pub use lifecycle::{Cancellation, Shutdown};
pub use resilience::RetryPolicy;
pub use transport::{ReqwestTransport, TransferCode, TransferError, Transport};
