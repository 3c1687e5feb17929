//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGINT → Shutdown::trigger
//!
//! Cancellation (shutdown.rs):
//!     Shutdown::trigger → every Cancellation token observes it
//!     → dispatcher stops admitting, drops in-flight exchanges, reports
//! ```
//!
//! # Design Decisions
//! - Cancellation is checked before each wait and also wakes the wait
//! - A cancelled run still returns a report; it is not an error

pub mod shutdown;
pub mod signals;

pub use shutdown::{Cancellation, Shutdown};
