//! Multiplexed dispatcher.
//!
//! # Responsibilities
//! - Hold the FIFO queue of unstarted requests
//! - Admit handles into a bounded active set, assigning sequence IDs
//! - Drive the shared event loop and route finished exchanges to the handler
//! - Re-admit replacement requests under the original sequence ID
//!
//! # Data Flow
//! ```text
//! process()
//!     → fill: pop queue front → Handle::init → MultiLoop::add
//!         refused → back to queue front, stop filling this tick
//!     → wait (bounded, wakes on cancellation)
//!     → per finished handle: Completion → handler
//!         replacement && retries < max_retries → admit now, same sequence
//!         otherwise → delivered, slot refilled from the queue
//!     → until queue and active set are both empty
//! ```
//!
//! # Design Decisions
//! - Sequence IDs are committed only once registration succeeds, so refusals
//!   never leave gaps
//! - Pacing applies after every admission, retries included
//! - A round in which nothing at all can be registered backs off and
//!   eventually gives up; leftover requests stay queued

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::handle::{Handle, HandleConfig};
use crate::dispatch::multi::{Finished, HandleToken, MultiLoop};
use crate::dispatch::{ResponseHandler, SequenceId};
use crate::http::{DefaultResponseFactory, PendingRequest, ResponseFactory};
use crate::lifecycle::Cancellation;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::transport::{TransferCode, Transport};

const STALL_BACKOFF_BASE_MS: u64 = 50;
const STALL_BACKOFF_MAX_MS: u64 = 2_000;

/// Hard failures of a dispatch run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// `process()` was called with nothing queued.
    #[error("no requests queued")]
    EmptyStack,
}

/// Summary of one `process()` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Completions accepted as final.
    pub delivered: usize,
    /// Exchanges registered, retries included.
    pub attempts: usize,
    /// Replacement requests admitted.
    pub retries: usize,
    /// Requests left unfinished when the run ended.
    pub abandoned: usize,
    /// Registrations refused by the transport.
    pub registration_failures: usize,
    /// Whether the run was cut short by cancellation.
    pub cancelled: bool,
    /// Whether fresh requests were left queued because no sequence IDs remained.
    pub sequence_exhausted: bool,
}

struct QueuedRequest {
    request: PendingRequest,
    /// Set for replacement requests, which keep their logical identity.
    sequence: Option<SequenceId>,
    retries: u32,
}

struct ActiveEntry {
    sequence: SequenceId,
    retries: u32,
}

/// Runs queued requests through a bounded window of concurrent exchanges.
pub struct Dispatcher {
    config: DispatchConfig,
    transport: Arc<dyn Transport>,
    handle_config: Arc<HandleConfig>,
    factory: Arc<dyn ResponseFactory>,
    cancellation: Option<Cancellation>,
    queue: VecDeque<QueuedRequest>,
    active: HashMap<HandleToken, ActiveEntry>,
    next_sequence: u64,
    multi: Option<MultiLoop>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            handle_config: Arc::new(HandleConfig::from(&config)),
            next_sequence: config.sequence_origin,
            config,
            transport,
            factory: Arc::new(DefaultResponseFactory),
            cancellation: None,
            queue: VecDeque::new(),
            active: HashMap::new(),
            multi: None,
        }
    }

    /// Stop runs early once `cancellation` fires.
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Use `factory` to create the response each handle assembles into.
    pub fn with_response_factory(mut self, factory: Arc<dyn ResponseFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Append a request to the queue.
    pub fn enqueue(&mut self, request: impl Into<PendingRequest>) {
        self.queue.push_back(QueuedRequest {
            request: request.into(),
            sequence: None,
            retries: 0,
        });
    }

    pub fn extend<I, R>(&mut self, requests: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<PendingRequest>,
    {
        for request in requests {
            self.enqueue(request);
        }
    }

    /// Requests waiting for admission.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Exchanges currently in the active set.
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Sequence ID the next fresh admission will receive.
    pub fn next_sequence(&self) -> SequenceId {
        SequenceId(self.next_sequence)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Drop every queued request. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    /// Run until the queue and the active set are both empty.
    ///
    /// Every finished exchange is handed to `handler`. Fails only when the
    /// queue is empty on entry.
    pub async fn process<H: ResponseHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<RunReport, DispatchError> {
        if self.queue.is_empty() {
            return Err(DispatchError::EmptyStack);
        }

        let span = tracing::info_span!(
            "dispatch",
            run_id = %Uuid::new_v4(),
            queued = self.queue.len(),
            window = self.window(),
        );
        Ok(self.run(handler).instrument(span).await)
    }

    /// Release the event loop, dropping in-flight exchanges.
    ///
    /// Safe to call repeatedly; a later `process()` opens a fresh loop.
    pub fn close(&mut self) {
        if let Some(mut multi) = self.multi.take() {
            let dropped = multi.close();
            self.active.clear();
            metrics::set_active_handles(0);
            tracing::debug!(dropped, "Event loop closed");
        }
    }

    fn window(&self) -> usize {
        self.config.window_size.max(1)
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
    }

    async fn run<H: ResponseHandler>(&mut self, handler: &mut H) -> RunReport {
        let mut report = RunReport::default();
        let mut stalled_rounds = 0u32;

        loop {
            if self.is_cancelled() {
                let dropped = self.active.len();
                self.close();
                report.cancelled = true;
                report.abandoned = dropped + self.queue.len();
                tracing::warn!(
                    in_flight = dropped,
                    queued = self.queue.len(),
                    "Run cancelled"
                );
                break;
            }

            self.fill(&mut report).await;

            if self.active.is_empty() {
                if self.queue.is_empty() {
                    break;
                }
                if report.sequence_exhausted {
                    report.abandoned = self.queue.len();
                    break;
                }
                if self.is_cancelled() {
                    continue;
                }
                stalled_rounds += 1;
                if stalled_rounds > self.config.registration_retries {
                    report.abandoned = self.queue.len();
                    tracing::warn!(
                        abandoned = report.abandoned,
                        rounds = stalled_rounds - 1,
                        "Registration keeps failing, leaving requests queued"
                    );
                    break;
                }
                let delay = calculate_backoff(
                    stalled_rounds,
                    STALL_BACKOFF_BASE_MS,
                    STALL_BACKOFF_MAX_MS,
                );
                tracing::debug!(
                    round = stalled_rounds,
                    delay_ms = delay.as_millis() as u64,
                    "Nothing admitted, backing off"
                );
                self.pause(delay).await;
                continue;
            }
            stalled_rounds = 0;

            for Finished {
                token,
                handle,
                code,
            } in self.wait().await
            {
                self.complete(token, handle, code, handler, &mut report)
                    .await;
            }
        }

        tracing::info!(
            delivered = report.delivered,
            attempts = report.attempts,
            retries = report.retries,
            abandoned = report.abandoned,
            registration_failures = report.registration_failures,
            cancelled = report.cancelled,
            sequence_exhausted = report.sequence_exhausted,
            "Dispatch run finished"
        );
        report
    }

    /// Admit queued requests until the window is full or a registration is refused.
    async fn fill(&mut self, report: &mut RunReport) {
        while self.active.len() < self.window() && !self.is_cancelled() {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            if !self.admit(item, report).await {
                break;
            }
        }
    }

    /// Build, bind and register one handle.
    ///
    /// A refused request goes back to the queue front and `false` is returned.
    async fn admit(&mut self, item: QueuedRequest, report: &mut RunReport) -> bool {
        let (sequence, following) = match item.sequence {
            Some(sequence) => (sequence, self.next_sequence),
            None => match self.next_sequence.checked_add(1) {
                Some(following) => (SequenceId(self.next_sequence), following),
                None => {
                    if !report.sequence_exhausted {
                        tracing::error!(
                            next_sequence = self.next_sequence,
                            queued = self.queue.len() + 1,
                            "Sequence IDs exhausted, fresh requests stay queued"
                        );
                    }
                    report.sequence_exhausted = true;
                    self.queue.push_front(item);
                    return false;
                }
            },
        };

        let mut handle = Handle::new(
            Arc::clone(&item.request),
            self.factory.create_response(),
            Arc::clone(&self.handle_config),
        );
        handle.bind(sequence, item.retries);
        if let Err(e) = handle.init().map(|_| ()) {
            tracing::warn!(%sequence, error = %e, "Request could not be prepared");
            handle.abort(TransferCode::ReadError, e.to_string());
        }

        let transport = &self.transport;
        let multi = self
            .multi
            .get_or_insert_with(|| MultiLoop::new(Arc::clone(transport)));

        match multi.add(handle) {
            Ok(token) => {
                self.next_sequence = following;
                self.active.insert(
                    token,
                    ActiveEntry {
                        sequence,
                        retries: item.retries,
                    },
                );
                report.attempts += 1;
                if item.retries > 0 {
                    report.retries += 1;
                }
                metrics::record_admission(item.retries > 0);
                metrics::set_active_handles(self.active.len());
                tracing::debug!(
                    %sequence,
                    %token,
                    retries = item.retries,
                    url = %item.request.url(),
                    "Admitted"
                );

                let pacing = self.config.pacing_delay();
                if !pacing.is_zero() {
                    self.pause(pacing).await;
                }
                true
            }
            Err((_handle, e)) => {
                report.registration_failures += 1;
                metrics::record_registration_failure();
                tracing::warn!(
                    %sequence,
                    error = %e,
                    active = self.active.len(),
                    "Registration refused, request re-queued"
                );
                self.queue.push_front(item);
                false
            }
        }
    }

    /// Wait for finished exchanges, waking early on cancellation.
    async fn wait(&mut self) -> Vec<Finished> {
        let timeout = self.config.select_timeout();
        let Some(multi) = self.multi.as_mut() else {
            return Vec::new();
        };
        match &self.cancellation {
            Some(token) => tokio::select! {
                done = multi.wait(timeout) => done,
                _ = token.cancelled() => Vec::new(),
            },
            None => multi.wait(timeout).await,
        }
    }

    async fn complete<H: ResponseHandler>(
        &mut self,
        token: HandleToken,
        handle: Handle,
        code: TransferCode,
        handler: &mut H,
        report: &mut RunReport,
    ) {
        let Some(entry) = self.active.remove(&token) else {
            tracing::warn!(%token, "Finished handle is not in the active set");
            return;
        };
        metrics::set_active_handles(self.active.len());

        let remaining = self.config.max_retries.saturating_sub(entry.retries);
        let completion = handle.into_completion(code, remaining);
        let outcome = match &completion.info.error {
            None => "ok",
            Some(e) if e.is_network() => "network",
            Some(_) => "request",
        };
        metrics::record_exchange(completion.info.total_time);
        tracing::debug!(
            sequence = %entry.sequence,
            %code,
            status = completion.response.status().map(|s| s.as_u16()),
            "Exchange finished"
        );

        match handler.on_response(completion) {
            Some(replacement) if entry.retries < self.config.max_retries => {
                tracing::info!(
                    sequence = %entry.sequence,
                    retry = entry.retries + 1,
                    "Retrying request"
                );
                let item = QueuedRequest {
                    request: Arc::new(replacement),
                    sequence: Some(entry.sequence),
                    retries: entry.retries + 1,
                };
                self.admit(item, report).await;
            }
            decision => {
                if decision.is_some() {
                    tracing::debug!(
                        sequence = %entry.sequence,
                        retries = entry.retries,
                        "Retry limit reached, replacement ignored"
                    );
                }
                report.delivered += 1;
                metrics::record_delivery(outcome);
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        match &self.cancellation {
            Some(token) => tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            },
            None => tokio::time::sleep(delay).await,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("window", &self.window())
            .field("queued", &self.queue.len())
            .field("active", &self.active.len())
            .field("next_sequence", &self.next_sequence)
            .field("multi", &self.multi)
            .finish()
    }
}
