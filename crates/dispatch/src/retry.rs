//! Retry with backoff on credential exhaustion
//!
//! Pure state machine: `transition` receives the result kind of an attempt
//! and returns (new_state, action). `RetryOrchestrator` executes the actions
//! (dispatching, sleeping) around it.
//!
//! Only `CredentialsExhausted` is retried. Every other result, successful or
//! not, ends the call on the attempt that produced it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use claude_api::Outcome;
use rand::RngExt;
use tracing::warn;

use crate::Dispatch;
use crate::dispatcher::Request;
use crate::error::{Error, Result};

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry. Retry `n` waits `min_delay * 2^n`.
    pub min_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Fractional jitter: the capped delay is scaled by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(70),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Capped, un-jittered delay before retry `retry` (0-indexed).
    pub fn base_delay(&self, retry: u32) -> Duration {
        // 2^retry via checked shift so large retry counts saturate
        let multiplier = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.min_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.effective_jitter();
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }

    /// Smallest and largest delay `retry` can produce after jitter.
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        let base = self.base_delay(retry);
        let jitter = self.effective_jitter();
        (base.mul_f64(1.0 - jitter), base.mul_f64(1.0 + jitter))
    }

    /// `jitter` clamped to `[0, 1]`; NaN counts as no jitter.
    fn effective_jitter(&self) -> f64 {
        if self.jitter > 0.0 {
            self.jitter.min(1.0)
        } else {
            0.0
        }
    }
}

/// Progress of one retried call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt number `attempt` (1-indexed) is about to run or running
    Attempting { attempt: u32 },
    /// An attempt produced a result other than exhaustion
    Succeeded,
    /// The attempt budget ran out while credentials stayed exhausted
    ExhaustedFinal { attempts: u32 },
}

impl RetryState {
    pub fn start() -> Self {
        RetryState::Attempting { attempt: 1 }
    }
}

/// What an attempt produced, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// Any result other than `CredentialsExhausted`
    Completed,
    /// `CredentialsExhausted`
    Exhausted,
}

/// Actions the orchestrator should execute after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Sleep (after applying jitter), then run the next attempt
    Backoff { retry: u32, delay: Duration },
    /// Return the last result to the caller
    Finish,
}

/// Handle a retry transition. Pure function: no I/O, no randomness.
pub fn transition(
    policy: &RetryPolicy,
    state: RetryState,
    event: RetryEvent,
) -> (RetryState, RetryAction) {
    match (state, event) {
        (RetryState::Attempting { .. }, RetryEvent::Completed) => {
            (RetryState::Succeeded, RetryAction::Finish)
        }

        (RetryState::Attempting { attempt }, RetryEvent::Exhausted)
            if attempt < policy.max_attempts =>
        {
            let retry = attempt - 1;
            (
                RetryState::Attempting {
                    attempt: attempt + 1,
                },
                RetryAction::Backoff {
                    retry,
                    delay: policy.base_delay(retry),
                },
            )
        }

        (RetryState::Attempting { attempt }, RetryEvent::Exhausted) => (
            RetryState::ExhaustedFinal { attempts: attempt },
            RetryAction::Finish,
        ),

        // Terminal states absorb further events
        (terminal @ (RetryState::Succeeded | RetryState::ExhaustedFinal { .. }), _) => {
            (terminal, RetryAction::Finish)
        }
    }
}

/// Wraps a dispatcher with bounded retry on credential exhaustion.
pub struct RetryOrchestrator<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: Dispatch> RetryOrchestrator<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Run `request` until it produces something other than exhaustion or
    /// the attempt budget is spent.
    ///
    /// Nothing is held across the backoff sleep; only this call waits.
    pub async fn execute(&self, request: &Request) -> Result<Outcome> {
        let mut state = RetryState::start();
        loop {
            let result = self.inner.dispatch(request).await;
            let event = if result.as_ref().err().is_some_and(Error::is_retryable) {
                RetryEvent::Exhausted
            } else {
                RetryEvent::Completed
            };

            let (next, action) = transition(&self.policy, state, event);
            state = next;

            match action {
                RetryAction::Backoff { retry, delay } => {
                    let delay = self.policy.jittered(delay);
                    metrics::counter!("claude_retries_total").increment(1);
                    warn!(
                        attempt = retry + 1,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "credentials exhausted, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryAction::Finish => {
                    if let RetryState::ExhaustedFinal { attempts } = state {
                        warn!(attempts, "credentials still exhausted after final attempt");
                    }
                    return result;
                }
            }
        }
    }
}

impl<D: Dispatch> Dispatch for RetryOrchestrator<D> {
    fn dispatch<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted results; once the script runs out, repeats the last.
    struct Scripted {
        script: Mutex<VecDeque<Result<Outcome>>>,
        last: Result<Outcome>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<Outcome>>) -> Self {
            let last = script
                .last()
                .cloned()
                .unwrap_or(Ok(Outcome::Empty));
            Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicU32::new(0),
            }
        }

        fn always(result: Result<Outcome>) -> Self {
            Self::new(vec![result])
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Dispatch for Scripted {
        fn dispatch<'a>(
            &'a self,
            _request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone());
            Box::pin(async move { next })
        }
    }

    fn exhausted() -> Result<Outcome> {
        Err(Error::CredentialsExhausted("all throttled".into()))
    }

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn request() -> Request {
        Request::new(Some("hi".into()), 64, "")
    }

    #[test]
    fn base_delays_double_then_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..9).map(|r| policy.base_delay(r).as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 70, 70, 70, 70, 70, 70]);
        assert_eq!(policy.base_delay(200), Duration::from_secs(70));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for retry in 0..9 {
            let (low, high) = policy.delay_bounds(retry);
            assert!(low >= Duration::from_millis(7_500));
            assert!(high <= Duration::from_millis(87_500));
            for _ in 0..50 {
                let delay = policy.jittered(policy.base_delay(retry));
                assert!(delay >= low && delay <= high, "retry {retry}: {delay:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = no_jitter();
        assert_eq!(policy.jittered(Duration::from_secs(40)), Duration::from_secs(40));
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let delay = Duration::from_secs(40);
        for jitter in [f64::NAN, f64::NEG_INFINITY, -0.5] {
            let policy = RetryPolicy {
                jitter,
                ..RetryPolicy::default()
            };
            assert_eq!(policy.jittered(delay), delay, "jitter {jitter}");
            assert_eq!(policy.delay_bounds(0), (Duration::from_secs(10), Duration::from_secs(10)));
        }

        let wide = RetryPolicy {
            jitter: f64::INFINITY,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            assert!(wide.jittered(delay) <= Duration::from_secs(80));
        }
        assert_eq!(wide.delay_bounds(0), (Duration::ZERO, Duration::from_secs(20)));
    }

    #[test]
    fn completed_attempt_finishes() {
        let (state, action) = transition(
            &RetryPolicy::default(),
            RetryState::start(),
            RetryEvent::Completed,
        );
        assert_eq!(state, RetryState::Succeeded);
        assert_eq!(action, RetryAction::Finish);
    }

    #[test]
    fn exhausted_attempt_schedules_backoff() {
        let policy = RetryPolicy::default();
        let (state, action) = transition(
            &policy,
            RetryState::Attempting { attempt: 3 },
            RetryEvent::Exhausted,
        );
        assert_eq!(state, RetryState::Attempting { attempt: 4 });
        assert_eq!(
            action,
            RetryAction::Backoff {
                retry: 2,
                delay: Duration::from_secs(40),
            }
        );
    }

    #[test]
    fn final_exhausted_attempt_does_not_sleep() {
        let policy = RetryPolicy::default();
        let (state, action) = transition(
            &policy,
            RetryState::Attempting { attempt: 10 },
            RetryEvent::Exhausted,
        );
        assert_eq!(state, RetryState::ExhaustedFinal { attempts: 10 });
        assert_eq!(action, RetryAction::Finish);
    }

    #[test]
    fn terminal_states_absorb_events() {
        let policy = RetryPolicy::default();
        for terminal in [RetryState::Succeeded, RetryState::ExhaustedFinal { attempts: 10 }] {
            for event in [RetryEvent::Completed, RetryEvent::Exhausted] {
                assert_eq!(
                    transition(&policy, terminal, event),
                    (terminal, RetryAction::Finish)
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_exhaustion_uses_every_attempt() {
        let orchestrator = RetryOrchestrator::new(Scripted::always(exhausted()), no_jitter());
        let started = tokio::time::Instant::now();

        let result = orchestrator.execute(&request()).await;

        assert!(matches!(result, Err(Error::CredentialsExhausted(_))));
        assert_eq!(orchestrator.inner().calls(), 10);
        // 10 + 20 + 40 + 70 * 6: nine sleeps, none after the last attempt
        assert_eq!(started.elapsed(), Duration::from_secs(490));
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_total_wait_stays_within_bounds() {
        let orchestrator =
            RetryOrchestrator::new(Scripted::always(exhausted()), RetryPolicy::default());
        let started = tokio::time::Instant::now();

        let result = orchestrator.execute(&request()).await;

        assert!(result.is_err());
        assert_eq!(orchestrator.inner().calls(), 10);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(367_500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(612_500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_exhaustion() {
        let script = vec![exhausted(), exhausted(), Ok(Outcome::RateLimited)];
        let orchestrator = RetryOrchestrator::new(Scripted::new(script), no_jitter());
        let started = tokio::time::Instant::now();

        let result = orchestrator.execute(&request()).await;

        assert_eq!(result, Ok(Outcome::RateLimited));
        assert_eq!(orchestrator.inner().calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn non_exhaustion_results_are_not_retried() {
        let results = [
            Ok(Outcome::Empty),
            Ok(Outcome::RateLimited),
            Ok(Outcome::UpstreamFailure {
                error_type: "overloaded_error".into(),
                message: "Overloaded".into(),
            }),
            Err(Error::Internal("credential pool is empty".into())),
        ];
        for expected in results {
            let orchestrator =
                RetryOrchestrator::new(Scripted::always(expected.clone()), no_jitter());
            let started = tokio::time::Instant::now();

            assert_eq!(orchestrator.execute(&request()).await, expected);
            assert_eq!(orchestrator.inner().calls(), 1);
            assert_eq!(started.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..no_jitter()
        };
        let orchestrator = RetryOrchestrator::new(Scripted::always(exhausted()), policy);
        let started = tokio::time::Instant::now();

        assert!(orchestrator.execute(&request()).await.is_err());
        assert_eq!(orchestrator.inner().calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
