//! Retry logic.
//!
//! # Responsibilities
//! - Determine if a finished exchange is worth repeating
//! - Resubmit the original request unchanged
//! - Forward terminal completions to a sink
//!
//! # Design Decisions
//! - Network errors are always retryable; HTTP statuses only when listed
//! - Non-idempotent methods are not retried unless explicitly allowed
//! - The dispatcher's `max_retries` is final: a completion with no retries
//!   remaining always reaches the sink

use http::{Method, StatusCode};
use std::collections::BTreeSet;

use crate::dispatch::{Completion, ResponseHandler};
use crate::http::Request;

/// Statuses retried by [`RetryPolicy::new`].
pub const DEFAULT_RETRY_STATUSES: [u16; 3] = [502, 503, 504];

/// Response handler that retries transient failures.
pub struct RetryPolicy<F> {
    statuses: BTreeSet<u16>,
    non_idempotent: bool,
    sink: F,
}

impl<F> RetryPolicy<F>
where
    F: FnMut(Completion) + Send,
{
    pub fn new(sink: F) -> Self {
        Self {
            statuses: DEFAULT_RETRY_STATUSES.into_iter().collect(),
            non_idempotent: false,
            sink,
        }
    }

    /// Replace the set of HTTP statuses that trigger a retry.
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Allow retrying POST and PATCH.
    pub fn retry_non_idempotent(mut self, allow: bool) -> Self {
        self.non_idempotent = allow;
        self
    }

    /// Whether `completion` should be repeated, ignoring the retry budget.
    pub fn is_retryable(&self, completion: &Completion) -> bool {
        if !self.non_idempotent && !is_idempotent(completion.request.method()) {
            return false;
        }
        match &completion.info.error {
            Some(error) => error.is_network(),
            None => completion
                .response
                .status()
                .is_some_and(|status| self.statuses.contains(&status.as_u16())),
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    ![Method::POST, Method::PATCH]
        .iter()
        .any(|m| m.as_str().eq_ignore_ascii_case(method.as_str()))
}

impl<F> ResponseHandler for RetryPolicy<F>
where
    F: FnMut(Completion) + Send,
{
    fn on_response(&mut self, completion: Completion) -> Option<Request> {
        if completion.retries_remaining > 0 && self.is_retryable(&completion) {
            tracing::debug!(
                sequence = %completion.sequence,
                code = %completion.info.code,
                status = completion.response.status().map(|s: StatusCode| s.as_u16()),
                "Transient failure, scheduling retry"
            );
            return Some((*completion.request).clone());
        }
        (self.sink)(completion);
        None
    }
}
