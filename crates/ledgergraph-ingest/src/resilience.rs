//! Resilience for calls against the node: retry, circuit breaker, timeout.
//!
//! Layering is outermost-in: the retry layer wraps the breaker, which wraps
//! the per-attempt timeout. Every retry attempt consults the breaker first,
//! an open circuit fails the attempt without touching the network, and a
//! timed-out attempt is sampled by the breaker as a failure. Cancellation
//! cuts through all three layers: it is never retried and never counted.

use crate::config::ResilienceOptions;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Breaker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    /// Calls flow; outcomes are sampled over a rolling window.
    Closed,
    /// Calls fail fast until the break expires.
    Open,
    /// One probe call is admitted; its outcome decides the next state.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    /// `(when, failed)` outcomes inside the sampling window.
    samples: VecDeque<(Instant, bool)>,
    /// When an open break expires.
    open_until: Instant,
    /// Whether the half-open probe is currently in flight.
    probe_in_flight: bool,
}

/// Rate-based circuit breaker over a rolling sample window.
///
/// Opens when, with at least `minimum_throughput` sampled calls in the
/// window, the failure rate reaches `failure_threshold`. After
/// `break_duration` one probe call is admitted; success recloses the
/// breaker, failure re-opens it for another full break.
pub struct CircuitBreaker {
    options: ResilienceOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(options: ResilienceOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                samples: VecDeque::new(),
                open_until: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    /// Ask to place a call. `Err(CircuitOpen)` means the call must not be
    /// attempted; every `Ok` must be paired with exactly one of
    /// [`on_success`](Self::on_success), [`on_failure`](Self::on_failure),
    /// or [`on_abandoned`](Self::on_abandoned).
    pub fn acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if now >= inner.open_until {
                    debug!("circuit break expired, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(inner.open_until - now))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen(self.options.break_duration))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                debug!("probe succeeded, closing circuit");
                inner.state = BreakerState::Closed;
                inner.probe_in_flight = false;
                inner.samples.clear();
            }
            _ => self.sample(&mut inner, false),
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(
                    "probe failed, re-opening circuit for {:?}",
                    self.options.break_duration
                );
                self.open(&mut inner);
            }
            _ => {
                self.sample(&mut inner, true);
                if self.over_threshold(&mut inner) {
                    warn!(
                        "failure rate over {} with {} sampled calls, opening circuit for {:?}",
                        self.options.failure_threshold,
                        inner.samples.len(),
                        self.options.break_duration
                    );
                    self.open(&mut inner);
                }
            }
        }
    }

    /// The admitted call ended without an outcome (cancelled mid-flight).
    pub fn on_abandoned(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn sample(&self, inner: &mut BreakerInner, failed: bool) {
        let now = Instant::now();
        inner.samples.push_back((now, failed));
        let horizon = now - self.options.sampling_duration;
        while inner
            .samples
            .front()
            .is_some_and(|(when, _)| *when < horizon)
        {
            inner.samples.pop_front();
        }
    }

    fn over_threshold(&self, inner: &mut BreakerInner) -> bool {
        let total = inner.samples.len();
        if total < self.options.minimum_throughput as usize {
            return false;
        }
        let failures = inner.samples.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / total as f64 >= self.options.failure_threshold
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.open_until = Instant::now() + self.options.break_duration;
        inner.probe_in_flight = false;
        inner.samples.clear();
    }
}

/// Retry + breaker + timeout around an async operation.
///
/// Clone-cheap: clones share the breaker, so every caller sees the same
/// circuit state.
#[derive(Clone)]
pub struct ResiliencePolicy {
    options: ResilienceOptions,
    breaker: Arc<CircuitBreaker>,
    cancel: CancellationToken,
}

impl ResiliencePolicy {
    pub fn new(options: ResilienceOptions, cancel: CancellationToken) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(options.clone()));
        Self {
            options,
            breaker,
            cancel,
        }
    }

    /// Run `op` under the full policy.
    ///
    /// Transient failures (transport, timeout, open circuit) are retried up
    /// to `retry_count` times with decorrelated-jitter backoff; anything
    /// else returns immediately. The breaker samples only attempts it
    /// admitted, so fail-fast rejections never feed back into the rate.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut prev_delay = self.options.median_first_retry_delay;
        let mut last_err;

        for attempt in 0..=self.options.retry_count {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.attempt(&mut op).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    last_err = err;
                }
            }

            if attempt == self.options.retry_count {
                return Err(last_err);
            }

            let delay = self.next_delay(&mut prev_delay);
            debug!(
                attempt = attempt + 1,
                ?delay,
                error = %last_err,
                "transient failure, backing off"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        unreachable!("retry loop returns from within");
    }

    async fn attempt<F, Fut, T>(&self, op: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.acquire()?;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.breaker.on_abandoned();
                return Err(Error::Cancelled);
            }
            outcome = tokio::time::timeout(self.options.timeout, op()) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => {
                self.breaker.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.is_cancellation() {
                    self.breaker.on_abandoned();
                } else {
                    self.breaker.on_failure();
                }
                Err(err)
            }
            Err(_elapsed) => {
                self.breaker.on_failure();
                Err(Error::Timeout(self.options.timeout))
            }
        }
    }

    /// Decorrelated jitter: uniform between the median first delay and three
    /// times the previous delay, capped at ten medians.
    fn next_delay(&self, prev: &mut Duration) -> Duration {
        let base = self.options.median_first_retry_delay;
        let cap = base * 10;
        let high = (*prev * 3).min(cap).max(base);
        let millis = rand::thread_rng().gen_range(base.as_millis()..=high.as_millis());
        let delay = Duration::from_millis(millis as u64);
        *prev = delay;
        delay
    }
}
