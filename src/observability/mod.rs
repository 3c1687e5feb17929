//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher, transport:
//!     → logging.rs (structured log events, one span per run)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stderr (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields, never interpolated messages
//! - Every run carries a run ID span field
//! - Metric calls are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
