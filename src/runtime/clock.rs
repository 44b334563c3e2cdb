//! Time source for polling loops.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real time, via tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time for tests: `sleep` returns immediately and moves `now`
/// forward by the requested duration.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub struct StepClock {
        start: Instant,
        elapsed: Mutex<Duration>,
    }

    impl StepClock {
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
                elapsed: Mutex::new(Duration::ZERO),
            }
        }

        pub fn elapsed(&self) -> Duration {
            *self.elapsed.lock().unwrap()
        }
    }

    #[async_trait]
    impl Clock for StepClock {
        fn now(&self) -> Instant {
            self.start + self.elapsed()
        }

        async fn sleep(&self, duration: Duration) {
            *self.elapsed.lock().unwrap() += duration;
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StepClock;
    use super::*;

    #[tokio::test]
    async fn step_clock_advances_only_on_sleep() {
        let clock = StepClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(clock.now() - t0, Duration::from_secs(2));
    }
}
