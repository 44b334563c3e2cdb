//! Completion detection for the remote runtime.
//!
//! The runtime never says "done". A command is considered finished once the
//! runtime's message count has stopped growing for `stable_polls` consecutive
//! polls. The detector is a plain state machine (Idle → Polling → Stable or
//! TimedOut) fed with timestamps and counts, so it runs the same under a real
//! or a virtual clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use crate::errors::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceState {
    Idle,
    Polling {
        previous_count: usize,
        stable_streak: u32,
    },
    Stable {
        message_count: usize,
    },
    TimedOut {
        elapsed: Duration,
    },
}

impl QuiescenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stable { .. } | Self::TimedOut { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiescenceSettings {
    pub poll_interval: Duration,
    pub stable_polls: u32,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct QuiescenceDetector {
    settings: QuiescenceSettings,
    started_at: Option<Instant>,
    state: QuiescenceState,
}

impl QuiescenceDetector {
    pub fn new(settings: QuiescenceSettings) -> Self {
        Self {
            settings,
            started_at: None,
            state: QuiescenceState::Idle,
        }
    }

    pub fn state(&self) -> QuiescenceState {
        self.state
    }

    /// Idle → Polling. The deadline counts from `started_at`.
    pub fn start(&mut self, started_at: Instant) {
        if self.state == QuiescenceState::Idle {
            self.started_at = Some(started_at);
            self.state = QuiescenceState::Polling {
                previous_count: 0,
                stable_streak: 0,
            };
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    /// Move to TimedOut if the deadline has passed. Returns the new state.
    pub fn check_deadline(&mut self, now: Instant) -> QuiescenceState {
        if let QuiescenceState::Polling { .. } = self.state {
            let elapsed = self.elapsed(now);
            if elapsed >= self.settings.timeout {
                self.state = QuiescenceState::TimedOut { elapsed };
            }
        }
        self.state
    }

    /// Feed the message count seen by one poll.
    pub fn observe(&mut self, count: usize) -> QuiescenceState {
        if let QuiescenceState::Polling {
            previous_count,
            stable_streak,
        } = self.state
        {
            let stable_streak = if count > previous_count {
                0
            } else {
                stable_streak + 1
            };
            let previous_count = previous_count.max(count);
            self.state = if stable_streak >= self.settings.stable_polls {
                QuiescenceState::Stable {
                    message_count: count,
                }
            } else {
                QuiescenceState::Polling {
                    previous_count,
                    stable_streak,
                }
            };
        }
        self.state
    }

    /// Time to sleep before the next poll, capped so the deadline is not overshot.
    pub fn next_delay(&self, now: Instant) -> Duration {
        let remaining = self.settings.timeout.saturating_sub(self.elapsed(now));
        self.settings.poll_interval.min(remaining)
    }
}

/// Poll until quiescence, timeout or cancellation.
///
/// `poll` returns the current list of runtime-originated messages; the list
/// seen by the final poll is returned on success.
pub async fn wait_for_quiescence<T, F, Fut>(
    clock: &dyn Clock,
    settings: QuiescenceSettings,
    started_at: Instant,
    cancel: &CancellationToken,
    mut poll: F,
) -> WorkflowResult<Vec<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkflowResult<Vec<T>>>,
{
    let mut detector = QuiescenceDetector::new(settings);
    detector.start(started_at);
    let mut polls = 0u32;

    loop {
        if let QuiescenceState::TimedOut { elapsed } = detector.check_deadline(clock.now()) {
            tracing::warn!(
                polls,
                elapsed_ms = elapsed.as_millis() as u64,
                "Runtime did not settle before the deadline"
            );
            return Err(WorkflowError::Timeout {
                elapsed,
                timeout: settings.timeout,
            });
        }

        let messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            result = poll() => result?,
        };
        polls += 1;

        let state = detector.observe(messages.len());
        tracing::debug!(polls, message_count = messages.len(), ?state, "Polled agent runtime");
        if let QuiescenceState::Stable { .. } = state {
            return Ok(messages);
        }

        let delay = detector.next_delay(clock.now());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            _ = clock.sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::test_support::StepClock;
    use std::sync::Mutex;

    fn settings(timeout_secs: u64) -> QuiescenceSettings {
        QuiescenceSettings {
            poll_interval: Duration::from_secs(2),
            stable_polls: 2,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Poll function returning `counts[i]` items on the i-th call; the last
    /// count repeats once the script runs out.
    fn scripted(
        counts: Vec<usize>,
    ) -> (
        impl FnMut() -> std::future::Ready<WorkflowResult<Vec<()>>>,
        std::sync::Arc<Mutex<usize>>,
    ) {
        let calls = std::sync::Arc::new(Mutex::new(0usize));
        let seen = calls.clone();
        let poll = move || {
            let mut n = seen.lock().unwrap();
            let count = counts
                .get(*n)
                .or(counts.last())
                .copied()
                .unwrap_or(0);
            *n += 1;
            std::future::ready(Ok(vec![(); count]))
        };
        (poll, calls)
    }

    #[test]
    fn detector_stable_after_two_unchanged_polls() {
        let mut d = QuiescenceDetector::new(settings(300));
        assert_eq!(d.state(), QuiescenceState::Idle);
        d.start(Instant::now());
        assert!(!d.observe(1).is_terminal());
        assert!(!d.observe(1).is_terminal());
        assert_eq!(d.observe(1), QuiescenceState::Stable { message_count: 1 });
    }

    #[test]
    fn detector_growth_resets_streak() {
        let mut d = QuiescenceDetector::new(settings(300));
        d.start(Instant::now());
        d.observe(1);
        d.observe(1);
        assert_eq!(
            d.observe(2),
            QuiescenceState::Polling {
                previous_count: 2,
                stable_streak: 0
            }
        );
    }

    #[test]
    fn detector_empty_first_poll_counts_as_stable() {
        let mut d = QuiescenceDetector::new(settings(300));
        d.start(Instant::now());
        assert_eq!(
            d.observe(0),
            QuiescenceState::Polling {
                previous_count: 0,
                stable_streak: 1
            }
        );
        assert_eq!(d.observe(0), QuiescenceState::Stable { message_count: 0 });
    }

    #[test]
    fn detector_ignores_input_before_start_and_after_terminal() {
        let mut d = QuiescenceDetector::new(settings(300));
        assert_eq!(d.observe(5), QuiescenceState::Idle);
        d.start(Instant::now());
        d.observe(0);
        d.observe(0);
        assert_eq!(d.observe(9), QuiescenceState::Stable { message_count: 0 });
    }

    #[test]
    fn next_delay_is_capped_by_deadline() {
        let mut d = QuiescenceDetector::new(settings(5));
        let t0 = Instant::now();
        d.start(t0);
        assert_eq!(d.next_delay(t0), Duration::from_secs(2));
        assert_eq!(d.next_delay(t0 + Duration::from_secs(4)), Duration::from_secs(1));
        assert_eq!(
            d.check_deadline(t0 + Duration::from_secs(5)),
            QuiescenceState::TimedOut {
                elapsed: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn steady_counts_complete_on_third_poll() {
        let clock = StepClock::new();
        let (poll, calls) = scripted(vec![1, 1, 1]);
        let cancel = CancellationToken::new();

        let messages = wait_for_quiescence(&clock, settings(6), clock.now(), &cancel, poll)
            .await
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn ever_growing_counts_time_out_at_deadline() {
        let clock = StepClock::new();
        let calls = std::sync::Arc::new(Mutex::new(0usize));
        let seen = calls.clone();
        let poll = move || {
            let mut n = seen.lock().unwrap();
            *n += 1;
            std::future::ready(Ok::<_, WorkflowError>(vec![(); *n]))
        };
        let cancel = CancellationToken::new();

        let err = wait_for_quiescence(&clock, settings(7), clock.now(), &cancel, poll)
            .await
            .unwrap_err();

        match err {
            WorkflowError::Timeout { elapsed, timeout } => {
                assert_eq!(timeout, Duration::from_secs(7));
                assert_eq!(elapsed, Duration::from_secs(7));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(7));
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn poll_error_propagates() {
        let clock = StepClock::new();
        let cancel = CancellationToken::new();
        let poll = || {
            std::future::ready(Err::<Vec<()>, _>(WorkflowError::Execution("bad".into())))
        };
        let err = wait_for_quiescence(&clock, settings(6), clock.now(), &cancel, poll)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let clock = StepClock::new();
        let (poll, calls) = scripted(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_quiescence(&clock, settings(60), clock.now(), &cancel, poll)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
        assert!(*calls.lock().unwrap() <= 1);
    }
}
