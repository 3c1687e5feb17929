//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Finished exchange:
//!     → retries.rs (RetryPolicy decides: replace or accept)
//!     → dispatcher enforces max_retries and keeps the sequence ID
//!
//! Stalled admission:
//!     → backoff.rs (jittered exponential delay between rounds)
//! ```
//!
//! # Design Decisions
//! - The dispatcher never judges retryability; policies live here
//! - HTTP statuses are retried only when explicitly configured

pub mod backoff;
pub mod retries;

pub use retries::RetryPolicy;
