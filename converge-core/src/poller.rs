//! Convergence poller.
//!
//! Re-runs a completion check until it reports done or failed, or the
//! policy's budget runs out. Suspension between attempts is cooperative
//! (`tokio::time::sleep`), so many convergence loops can share a runtime.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::resource::{CompletionFailure, CompletionStatus};

/// The budget that bounds a convergence loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// At most this many check invocations.
    Attempts(u32),
    /// Checks keep running until this much time has elapsed.
    Deadline(Duration),
}

/// How often and for how long to re-run a completion check.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub budget: PollBudget,
    pub backoff: f64,
    pub max_interval: Duration,
}

impl PollPolicy {
    /// Fixed interval, bounded by a number of attempts.
    pub fn attempts(attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            budget: PollBudget::Attempts(attempts),
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Fixed interval, bounded by a deadline.
    pub fn deadline(deadline: Duration, interval: Duration) -> Self {
        Self {
            interval,
            budget: PollBudget::Deadline(deadline),
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Grow the interval by `factor` after every pending attempt, capped
    /// at `max_interval`. Factors below 1.0 are treated as 1.0.
    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff <= 1.0 {
            return current;
        }
        let scaled = current.as_secs_f64() * self.backoff;
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

/// Run `check` until it settles or the policy budget is exhausted.
///
/// The check runs at least once. `Done` and `Failed` return immediately;
/// an exhausted budget yields `Failed(Timeout)` carrying the number of
/// checks that ran. The returned status is never `Pending`.
pub async fn poll_until_complete<C, F>(mut check: C, policy: &PollPolicy) -> CompletionStatus
where
    C: FnMut() -> F,
    F: Future<Output = CompletionStatus>,
{
    let started = Instant::now();
    let mut interval = policy.interval;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match check().await {
            CompletionStatus::Done => return CompletionStatus::Done,
            CompletionStatus::Failed(failure) => return CompletionStatus::Failed(failure),
            CompletionStatus::Pending => {}
        }
        let exhausted = match policy.budget {
            PollBudget::Attempts(max) => attempts >= max,
            PollBudget::Deadline(deadline) => started.elapsed() >= deadline,
        };
        if exhausted {
            return CompletionStatus::Failed(CompletionFailure::Timeout { attempts });
        }
        debug!("Check {} pending, sleeping {:?}", attempts, interval);
        sleep(interval).await;
        interval = policy.next_interval(interval);
    }
}
