//! Per-task pipelined retrieval.
//!
//! A [`Fetcher`] keeps what survives between attempts: which segments have
//! arrived, the forwarding hint and the retry pause. Each attempt runs a
//! fresh sliding window of up to `pipeline_width` outstanding interests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use driftsync_core::FetchTask;
use driftsync_sync::{Data, Interest, Transport};

use crate::handler::{FetchHandler, ForwardingHint, NameResolver};
use crate::manager::FetchConfig;

/// Smallest pause between failed attempts.
pub const MIN_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Exponential pause between failed attempts.
///
/// `pause = max(1s, min(2 * pause, max))`, reset by any received segment.
#[derive(Debug, Clone)]
pub struct RetryPause {
    current: Duration,
    max: Duration,
}

impl RetryPause {
    pub fn new(max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            max,
        }
    }

    /// The pause applied after the most recent failure.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Register a failure and return the pause before the next attempt.
    pub fn fail(&mut self) -> Duration {
        let doubled = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = doubled.min(self.max).max(MIN_RETRY_PAUSE);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Which segments of a range have arrived.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Every segment below this has arrived.
    next_in_order: u64,
    /// Arrived segments at or above `next_in_order`.
    out_of_order: BTreeSet<u64>,
}

impl Progress {
    pub fn new(min_seq: u64) -> Self {
        Self {
            next_in_order: min_seq,
            out_of_order: BTreeSet::new(),
        }
    }

    /// Lowest segment that has not arrived.
    pub fn next_in_order(&self) -> u64 {
        self.next_in_order
    }

    pub fn is_received(&self, seq: u64) -> bool {
        seq < self.next_in_order || self.out_of_order.contains(&seq)
    }

    /// Record `seq` as received.
    pub fn mark(&mut self, seq: u64) {
        if seq < self.next_in_order {
            return;
        }
        if seq > self.next_in_order {
            self.out_of_order.insert(seq);
            return;
        }
        self.next_in_order += 1;
        while self.out_of_order.remove(&self.next_in_order) {
            self.next_in_order += 1;
        }
    }

    /// Whether every segment up to and including `max_seq` has arrived.
    pub fn is_complete(&self, max_seq: u64) -> bool {
        self.next_in_order > max_seq
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Every segment arrived and the handler was told.
    Completed,
    /// A segment timed out without recent positive activity.
    Failed,
}

/// Retrieval state for one fetch task.
pub struct Fetcher {
    task: FetchTask,
    handler: Arc<dyn FetchHandler>,
    progress: Progress,
    hint: ForwardingHint,
    pause: RetryPause,
    next_retry: Instant,
    attempts: u32,
}

impl Fetcher {
    pub fn new(
        task: FetchTask,
        handler: Arc<dyn FetchHandler>,
        hint: ForwardingHint,
        max_retry_pause: Duration,
    ) -> Self {
        Self {
            progress: Progress::new(task.min_seq),
            task,
            handler,
            hint,
            pause: RetryPause::new(max_retry_pause),
            next_retry: Instant::now(),
            attempts: 0,
        }
    }

    pub fn task(&self) -> &FetchTask {
        &self.task
    }

    pub fn hint(&self) -> &ForwardingHint {
        &self.hint
    }

    pub fn retry_pause(&self) -> Duration {
        self.pause.current()
    }

    /// Earliest time the next attempt may start.
    pub fn next_retry(&self) -> Instant {
        self.next_retry
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Switch hints and back off after a failed attempt.
    pub fn fail_attempt(&mut self, resolver: &dyn NameResolver) -> Duration {
        self.hint = self.hint.alternate(resolver, &self.task.producer);
        let pause = self.pause.fail();
        self.next_retry = Instant::now() + pause;
        pause
    }

    /// Run one attempt until completion or a no-data timeout.
    pub async fn run_attempt(
        &mut self,
        transport: &Arc<dyn Transport>,
        config: &FetchConfig,
    ) -> Attempt {
        self.attempts += 1;
        debug!(
            producer = %self.task.producer,
            base = %self.task.base_name,
            from = self.progress.next_in_order(),
            to = self.task.max_seq,
            hint = ?self.hint,
            attempt = self.attempts,
            "starting fetch pipeline"
        );

        if self.progress.is_complete(self.task.max_seq) {
            self.handler.on_finish(&self.task).await;
            return Attempt::Completed;
        }

        let mut window = Window::new(self.progress.next_in_order());
        let mut in_flight: JoinSet<(u64, Option<Data>)> = JoinSet::new();
        self.fill(&mut window, &mut in_flight, transport, config);

        while let Some(joined) = in_flight.join_next().await {
            let (seq, data) = match joined {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "segment request task failed");
                    in_flight.abort_all();
                    return Attempt::Failed;
                }
            };
            window.in_flight.remove(&seq);

            match data {
                Some(data) => {
                    self.handler.on_segment(&self.task, seq, data.content).await;
                    self.progress.mark(seq);
                    self.pause.reset();
                    window.last_activity = Some(Instant::now());

                    if self.progress.is_complete(self.task.max_seq) {
                        in_flight.abort_all();
                        self.handler.on_finish(&self.task).await;
                        return Attempt::Completed;
                    }
                }
                None if window.recently_active(config.segment_timeout) => {
                    trace!(seq, "segment gap, re-requesting");
                    self.request(seq, &mut window, &mut in_flight, transport, config);
                }
                None => {
                    debug!(
                        producer = %self.task.producer,
                        seq,
                        "no data before timeout, attempt failed"
                    );
                    in_flight.abort_all();
                    return Attempt::Failed;
                }
            }

            self.fill(&mut window, &mut in_flight, transport, config);
        }

        Attempt::Failed
    }

    /// Request unreceived segments until the window is full.
    fn fill(
        &self,
        window: &mut Window,
        in_flight: &mut JoinSet<(u64, Option<Data>)>,
        transport: &Arc<dyn Transport>,
        config: &FetchConfig,
    ) {
        let width = config.pipeline_width.max(1);
        while window.in_flight.len() < width {
            let Some(seq) = self.next_unrequested(window) else {
                break;
            };
            window.next_request = seq + 1;
            self.request(seq, window, in_flight, transport, config);
        }
    }

    fn next_unrequested(&self, window: &Window) -> Option<u64> {
        (window.next_request..=self.task.max_seq)
            .find(|seq| !self.progress.is_received(*seq) && !window.in_flight.contains(seq))
    }

    fn request(
        &self,
        seq: u64,
        window: &mut Window,
        in_flight: &mut JoinSet<(u64, Option<Data>)>,
        transport: &Arc<dyn Transport>,
        config: &FetchConfig,
    ) {
        let name = self.hint.segment_name(&self.task.base_name, seq);
        let interest = Interest::new(name).with_lifetime(config.segment_timeout);
        let transport = Arc::clone(transport);

        window.in_flight.insert(seq);
        in_flight.spawn(async move {
            match transport.express_interest(interest).await {
                Ok(data) => (seq, data),
                Err(e) => {
                    warn!(seq, error = %e, "segment interest failed");
                    (seq, None)
                }
            }
        });
    }
}

/// Per-attempt window state.
struct Window {
    next_request: u64,
    in_flight: BTreeSet<u64>,
    last_activity: Option<Instant>,
}

impl Window {
    fn new(start: u64) -> Self {
        Self {
            next_request: start,
            in_flight: BTreeSet::new(),
            last_activity: None,
        }
    }

    fn recently_active(&self, within: Duration) -> bool {
        self.last_activity.is_some_and(|at| at.elapsed() < within)
    }
}
