//! Bounded polling.
//!
//! Every wait in the pipeline (node readiness, ingress controller, namespace
//! existence, workload readiness, HTTP health) goes through [`poll_until`].
//! A poll probes immediately, then sleeps `interval` between probes, and
//! stops at the first of: a successful probe, `max_attempts` probes, or the
//! optional `deadline`. What an exhausted poll *means* is carried by
//! [`OnTimeout`] and decided by the caller.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    /// Exhaustion aborts the run.
    Fatal,
    /// Exhaustion is logged and the run continues.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// At least one probe always happens, even when this is 0.
    pub max_attempts: u32,
    pub deadline: Option<Duration>,
    pub on_timeout: OnTimeout,
}

impl PollPolicy {
    /// `max_attempts` probes spaced `interval` apart.
    pub fn attempts(max_attempts: u32, interval: Duration, on_timeout: OnTimeout) -> Self {
        Self {
            interval,
            max_attempts,
            deadline: None,
            on_timeout,
        }
    }

    /// Probe until `deadline` has elapsed, sleeping `interval` between
    /// probes that return quickly.
    pub fn deadline(deadline: Duration, interval: Duration, on_timeout: OnTimeout) -> Self {
        Self {
            interval,
            max_attempts: u32::MAX,
            deadline: Some(deadline),
            on_timeout,
        }
    }
}

/// Handed to each probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    /// Time left before the deadline, if the policy has one. Blocking probes
    /// use this as their own timeout.
    pub remaining: Option<Duration>,
}

impl Attempt {
    /// `remaining` rounded up to whole seconds, for CLI `--timeout` flags.
    pub fn remaining_secs(&self, fallback: Duration) -> u64 {
        let left = self.remaining.unwrap_or(fallback);
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        secs.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        on_timeout: OnTimeout,
    },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Ready { elapsed, .. } | PollOutcome::Exhausted { elapsed, .. } => *elapsed,
        }
    }
}

/// Run `probe` under `policy` until it yields `Some`.
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, mut probe: F) -> PollOutcome<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut number = 0u32;
    loop {
        number += 1;
        let remaining = policy
            .deadline
            .map(|d| d.saturating_sub(start.elapsed()));
        if let Some(value) = probe(Attempt { number, remaining }).await {
            return PollOutcome::Ready {
                value,
                attempts: number,
                elapsed: start.elapsed(),
            };
        }

        let exhausted = PollOutcome::Exhausted {
            attempts: number,
            elapsed: start.elapsed(),
            on_timeout: policy.on_timeout,
        };
        if number >= policy.max_attempts {
            return exhausted;
        }
        let pause = match policy.deadline {
            Some(deadline) => {
                let left = deadline.saturating_sub(start.elapsed());
                if left.is_zero() {
                    return exhausted;
                }
                policy.interval.min(left)
            }
            None => policy.interval,
        };
        tokio::time::sleep(pause).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn returns_on_first_success_without_waiting_for_the_bound() {
        let policy = PollPolicy::attempts(60, Duration::from_secs(2), OnTimeout::Fatal);
        let outcome =
            poll_until(&policy, |a| async move { (a.number == 3).then_some(a.number) }).await;
        let PollOutcome::Ready {
            value,
            attempts,
            elapsed,
        } = outcome
        else {
            panic!("expected Ready");
        };
        assert_eq!((value, attempts), (3, 3));
        // Probe 1 at t=0, two intervals later probe 3 succeeds.
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_exactly_max_attempts() {
        let probes = Cell::new(0u32);
        let policy = PollPolicy::attempts(7, Duration::from_secs(3), OnTimeout::Fatal);
        let outcome: PollOutcome<()> = poll_until(&policy, |_| {
            probes.set(probes.get() + 1);
            async { None }
        })
        .await;
        assert_eq!(probes.get(), 7);
        assert_eq!(outcome.attempts(), 7);
        assert!(matches!(
            outcome,
            PollOutcome::Exhausted {
                on_timeout: OnTimeout::Fatal,
                ..
            }
        ));
        // No trailing sleep after the last probe.
        assert!(outcome.elapsed() >= Duration::from_secs(18));
        assert!(outcome.elapsed() < Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_probes_once() {
        let policy = PollPolicy::attempts(0, Duration::from_secs(1), OnTimeout::Degraded);
        let outcome: PollOutcome<()> = poll_until(&policy, |_| async { None }).await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_fast_failing_probes() {
        let policy = PollPolicy::deadline(
            Duration::from_secs(20),
            Duration::from_secs(5),
            OnTimeout::Degraded,
        );
        let seen = std::cell::RefCell::new(Vec::new());
        let outcome: PollOutcome<()> = poll_until(&policy, |a| {
            seen.borrow_mut().push(a.remaining);
            async { None }
        })
        .await;
        assert_eq!(outcome.attempts(), 5);
        assert!(outcome.elapsed() >= Duration::from_secs(20));
        assert!(outcome.elapsed() < Duration::from_secs(21));
        assert_eq!(seen.borrow()[0], Some(Duration::from_secs(20)));
        assert_eq!(seen.borrow()[4], Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_probe_consumes_the_deadline_in_one_attempt() {
        let policy = PollPolicy::deadline(
            Duration::from_secs(30),
            Duration::from_secs(5),
            OnTimeout::Degraded,
        );
        let outcome: PollOutcome<()> = poll_until(&policy, |a| async move {
            tokio::time::sleep(a.remaining.unwrap()).await;
            None
        })
        .await;
        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(
            outcome,
            PollOutcome::Exhausted {
                on_timeout: OnTimeout::Degraded,
                ..
            }
        ));
    }

    #[test]
    fn remaining_secs_rounds_up_and_never_hits_zero() {
        let a = Attempt {
            number: 1,
            remaining: Some(Duration::from_millis(1500)),
        };
        assert_eq!(a.remaining_secs(Duration::from_secs(9)), 2);

        let a = Attempt {
            number: 1,
            remaining: Some(Duration::ZERO),
        };
        assert_eq!(a.remaining_secs(Duration::from_secs(9)), 1);

        let a = Attempt {
            number: 1,
            remaining: None,
        };
        assert_eq!(a.remaining_secs(Duration::from_secs(9)), 9);
    }
}
