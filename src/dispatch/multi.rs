//! Shared multiplexing event loop.
//!
//! # Responsibilities
//! - Register configured handles with the transport and hand out tokens
//! - Drive every in-flight exchange from one execution context
//! - Report finished exchanges by token
//!
//! # Design Decisions
//! - Exchanges only make progress while the loop is polled
//! - A bounded wait never spins: it parks until a completion or the deadline
//! - Closing drops every in-flight exchange; a closed loop refuses handles

use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::handle::Handle;
use crate::transport::{RegistrationError, TransferCode, Transport};

/// Opaque identity of a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleToken(u64);

impl fmt::Display for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// A handle whose exchange has ended.
pub struct Finished {
    pub token: HandleToken,
    pub handle: Handle,
    pub code: TransferCode,
}

/// The event loop shared by all handles of one dispatcher.
pub struct MultiLoop {
    transport: Arc<dyn Transport>,
    in_flight: FuturesUnordered<BoxFuture<'static, Finished>>,
    next_token: u64,
    closed: bool,
}

impl MultiLoop {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_flight: FuturesUnordered::new(),
            next_token: 1,
            closed: false,
        }
    }

    /// Register a configured handle.
    ///
    /// On refusal the handle is returned to the caller untouched.
    pub fn add(&mut self, handle: Handle) -> Result<HandleToken, (Handle, RegistrationError)> {
        if self.closed {
            return Err((handle, RegistrationError::Closed));
        }
        if let Err(err) = self.transport.register(&handle) {
            return Err((handle, err));
        }

        let token = HandleToken(self.next_token);
        self.next_token += 1;

        let exchange = match handle.aborted() {
            Some(code) => future::ready((handle, code)).boxed(),
            None => self.transport.perform(handle),
        };
        self.in_flight
            .push(exchange.map(move |(handle, code)| Finished { token, handle, code }).boxed());

        Ok(token)
    }

    /// Number of exchanges still in flight.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drive all exchanges once without blocking and collect those that ended.
    pub fn poll_ready(&mut self) -> Vec<Finished> {
        let mut done = Vec::new();
        while let Some(Some(finished)) = self.in_flight.next().now_or_never() {
            done.push(finished);
        }
        done
    }

    /// Drive the loop until at least one exchange ends or `timeout` elapses.
    pub async fn wait(&mut self, timeout: Duration) -> Vec<Finished> {
        let mut done = self.poll_ready();
        if !done.is_empty() || self.in_flight.is_empty() {
            return done;
        }

        if let Ok(Some(finished)) = tokio::time::timeout(timeout, self.in_flight.next()).await {
            done.push(finished);
            done.extend(self.poll_ready());
        }
        done
    }

    /// Release the loop, dropping every in-flight exchange.
    ///
    /// Returns how many exchanges were dropped. Safe to call repeatedly.
    pub fn close(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight = FuturesUnordered::new();
        self.closed = true;
        dropped
    }
}

impl fmt::Debug for MultiLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLoop")
            .field("in_flight", &self.in_flight.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handle::HandleConfig;
    use crate::http::{Request, Response};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Delayed {
        delay: Duration,
        refuse: AtomicBool,
    }

    impl Transport for Delayed {
        fn register(&self, _handle: &Handle) -> Result<(), RegistrationError> {
            if self.refuse.load(Ordering::SeqCst) {
                Err(RegistrationError::Refused("full".into()))
            } else {
                Ok(())
            }
        }

        fn perform(&self, handle: Handle) -> BoxFuture<'static, (Handle, TransferCode)> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                (handle, TransferCode::Ok)
            })
        }
    }

    fn handle() -> Handle {
        let request = Arc::new(Request::get("http://example.test/").unwrap());
        Handle::new(request, Response::new(), Arc::new(HandleConfig::default()))
    }

    fn transport(delay_ms: u64) -> Arc<Delayed> {
        Arc::new(Delayed {
            delay: Duration::from_millis(delay_ms),
            refuse: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn tokens_are_distinct_and_completions_reported() {
        let mut multi = MultiLoop::new(transport(5));
        let a = multi.add(handle()).ok().unwrap();
        let b = multi.add(handle()).ok().unwrap();
        assert_ne!(a, b);
        assert_eq!(multi.len(), 2);

        let mut seen = Vec::new();
        while !multi.is_empty() {
            seen.extend(multi.wait(Duration::from_secs(1)).await.into_iter().map(|f| f.token));
        }
        seen.sort();
        assert_eq!(seen, vec![a, b]);
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let mut multi = MultiLoop::new(transport(10_000));
        multi.add(handle()).ok().unwrap();

        let start = std::time::Instant::now();
        let done = multi.wait(Duration::from_millis(20)).await;
        assert!(done.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn aborted_handles_finish_without_transport() {
        let mut multi = MultiLoop::new(transport(10_000));
        let mut h = handle();
        h.abort(TransferCode::ReadError, "unreadable");
        multi.add(h).ok().unwrap();

        let done = multi.wait(Duration::from_millis(50)).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].code, TransferCode::ReadError);
    }

    #[tokio::test]
    async fn refusal_returns_the_handle() {
        let t = transport(1);
        t.refuse.store(true, Ordering::SeqCst);
        let mut multi = MultiLoop::new(t);

        let (_handle, err) = multi.add(handle()).err().unwrap();
        assert_eq!(err, RegistrationError::Refused("full".into()));
        assert!(multi.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_refuses_new_handles() {
        let mut multi = MultiLoop::new(transport(10_000));
        multi.add(handle()).ok().unwrap();

        assert_eq!(multi.close(), 1);
        assert_eq!(multi.close(), 0);
        assert!(multi.is_closed());
        let (_, err) = multi.add(handle()).err().unwrap();
        assert_eq!(err, RegistrationError::Closed);
    }
}
