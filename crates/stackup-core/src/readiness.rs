//! Readiness polling against the cluster API.
//!
//! Namespace existence is polled at a fixed interval with a bounded attempt
//! count; never seeing it is fatal because nothing downstream can exist.
//! Workload readiness is bounded by a per-target deadline and *degrades*
//! on timeout: diagnostics are collected and the pipeline moves on to the
//! health check, which is the more representative signal.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, StackupError};
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use crate::poll::{poll_until, Attempt, OnTimeout, PollOutcome, PollPolicy};

/// Number of event lines kept in a diagnostic dump.
const EVENT_TAIL: usize = 20;

/// A workload identified by namespace and label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessTarget {
    pub name: String,
    pub namespace: String,
    pub selector: String,
    #[serde(with = "secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub pods: String,
    pub events: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkloadReadiness {
    Ready {
        attempts: u32,
    },
    Degraded {
        attempts: u32,
        diagnostics: Diagnostics,
    },
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// Poll for `name` every `interval`, at most `max_attempts` times. Returns the
/// number of probes it took.
pub async fn wait_for_namespace<R: CommandRunner>(
    runner: &R,
    name: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<u32> {
    info!(namespace = name, max_attempts, "waiting for namespace");
    let policy = PollPolicy::attempts(max_attempts, interval, OnTimeout::Fatal);
    let outcome = poll_until(&policy, move |_attempt| {
        let probe = Invocation::new("kubectl").args(["get", "namespace", name, "-o", "name"]);
        async move { settle(runner.run(&probe).await) }
    })
    .await;

    match lift(outcome)? {
        PollOutcome::Ready { attempts, .. } => {
            info!(namespace = name, attempts, "namespace present");
            Ok(attempts)
        }
        PollOutcome::Exhausted { attempts, .. } => Err(StackupError::NamespaceMissing {
            name: name.to_string(),
            attempts,
        }),
    }
}

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

/// Repeated `kubectl wait --for=condition=Ready pod` under `policy`. Each call
/// blocks for at most the time left before the deadline; calls that fail fast
/// (no pod matches the selector yet) are retried after `policy.interval`.
pub async fn wait_pods_ready<R: CommandRunner>(
    runner: &R,
    namespace: &str,
    selector: &str,
    policy: &PollPolicy,
) -> Result<PollOutcome<()>> {
    let fallback = policy.interval;
    let outcome = poll_until(policy, move |attempt: Attempt| {
        let probe = Invocation::new("kubectl").args([
            "wait".to_string(),
            "--for=condition=Ready".to_string(),
            "pod".to_string(),
            "-l".to_string(),
            selector.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("--timeout={}s", attempt.remaining_secs(fallback)),
        ]);
        async move { settle(runner.run(&probe).await) }
    })
    .await;
    lift(outcome)
}

/// Wait for one workload. Never fatal on timeout.
pub async fn wait_for_workload_ready<R: CommandRunner>(
    runner: &R,
    target: &ReadinessTarget,
    interval: Duration,
) -> Result<WorkloadReadiness> {
    info!(
        workload = %target.name,
        namespace = %target.namespace,
        selector = %target.selector,
        timeout_secs = target.timeout.as_secs(),
        "waiting for workload"
    );
    let policy = PollPolicy::deadline(target.timeout, interval, OnTimeout::Degraded);
    match wait_pods_ready(runner, &target.namespace, &target.selector, &policy).await? {
        PollOutcome::Ready { attempts, .. } => {
            info!(workload = %target.name, "workload ready");
            Ok(WorkloadReadiness::Ready { attempts })
        }
        PollOutcome::Exhausted { attempts, .. } => {
            let diagnostics = collect_diagnostics(runner, &target.namespace).await;
            warn!(
                workload = %target.name,
                timeout_secs = target.timeout.as_secs(),
                "workload not ready in time; continuing\n--- pods ---\n{}\n--- recent events ---\n{}",
                diagnostics.pods,
                diagnostics.events
            );
            Ok(WorkloadReadiness::Degraded {
                attempts,
                diagnostics,
            })
        }
    }
}

/// Current pod listing and the most recent events of `namespace`. Listings
/// that cannot be produced are replaced by the reason.
pub async fn collect_diagnostics<R: CommandRunner>(runner: &R, namespace: &str) -> Diagnostics {
    let pods = runner
        .run(&Invocation::new("kubectl").args(["get", "pods", "-n", namespace, "-o", "wide"]))
        .await;
    let events = runner
        .run(&Invocation::new("kubectl").args([
            "get",
            "events",
            "-n",
            namespace,
            "--sort-by=.lastTimestamp",
        ]))
        .await;
    Diagnostics {
        pods: listing(pods),
        events: tail_lines(&listing(events), EVENT_TAIL),
    }
}

fn listing(result: Result<CommandOutput>) -> String {
    match result {
        Ok(out) if out.success() => out.stdout.trim_end().to_string(),
        Ok(out) => format!("(unavailable: {})", out.diagnostic()),
        Err(e) => format!("(unavailable: {e})"),
    }
}

/// Keep the header line plus the last `keep - 1` lines.
fn tail_lines(text: &str, keep: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= keep {
        return text.to_string();
    }
    let mut kept = vec![lines[0]];
    kept.extend_from_slice(&lines[lines.len() - (keep - 1)..]);
    kept.join("\n")
}

/// A probe result for [`poll_until`]: success stops the poll, a non-zero exit
/// retries, and a spawn error stops it with the error.
pub(crate) fn settle(result: Result<CommandOutput>) -> Option<Result<()>> {
    match result {
        Ok(out) if out.success() => Some(Ok(())),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}

/// Turn a poll whose probe may have hit a spawn error into a plain outcome.
pub(crate) fn lift(outcome: PollOutcome<Result<()>>) -> Result<PollOutcome<()>> {
    match outcome {
        PollOutcome::Ready {
            value,
            attempts,
            elapsed,
        } => value.map(|()| PollOutcome::Ready {
            value: (),
            attempts,
            elapsed,
        }),
        PollOutcome::Exhausted {
            attempts,
            elapsed,
            on_timeout,
        } => Ok(PollOutcome::Exhausted {
            attempts,
            elapsed,
            on_timeout,
        }),
    }
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use tokio::time::Instant;

    fn not_found() -> CommandOutput {
        CommandOutput::failed(1, "Error from server (NotFound): namespaces \"keycloak\" not found")
    }

    fn target(timeout_secs: u64) -> ReadinessTarget {
        ReadinessTarget {
            name: "application".into(),
            namespace: "keycloak".into(),
            selector: "app.kubernetes.io/name=keycloak".into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_found_on_third_probe_returns_early() {
        let runner = FakeRunner::new().on("kubectl get namespace keycloak", |n| {
            if n >= 3 {
                CommandOutput::ok("namespace/keycloak")
            } else {
                not_found()
            }
        });
        let start = Instant::now();
        let attempts = wait_for_namespace(&runner, "keycloak", 60, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(runner.count("kubectl get namespace"), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_never_appearing_fails_after_exactly_n_probes() {
        let runner = FakeRunner::new().on("kubectl get namespace", |_| not_found());
        let err = wait_for_namespace(&runner, "keycloak", 60, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StackupError::NamespaceMissing { attempts: 60, .. }
        ));
        assert_eq!(runner.count("kubectl get namespace"), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn workload_with_no_pods_degrades_after_the_full_window() {
        let runner = FakeRunner::new()
            .on("kubectl wait", |_| {
                CommandOutput::failed(1, "error: no matching resources found")
            })
            .on("kubectl get pods", |_| {
                CommandOutput::ok("NAME   READY   STATUS\npostgresql-0   1/1   Running\n")
            })
            .on("kubectl get events", |_| {
                CommandOutput::ok("LAST SEEN   TYPE   REASON\n10s   Warning   FailedScheduling\n")
            });
        let start = Instant::now();
        let readiness = wait_for_workload_ready(&runner, &target(600), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(600));

        let WorkloadReadiness::Degraded {
            attempts,
            diagnostics,
        } = readiness
        else {
            panic!("expected Degraded");
        };
        assert!(attempts > 1);
        assert!(diagnostics.pods.contains("postgresql-0"));
        assert!(diagnostics.events.contains("FailedScheduling"));
    }

    #[tokio::test(start_paused = true)]
    async fn workload_ready_on_second_wait() {
        let runner = FakeRunner::new().on("kubectl wait", |n| {
            if n == 2 {
                CommandOutput::ok("pod/keycloak-0 condition met")
            } else {
                CommandOutput::failed(1, "error: no matching resources found")
            }
        });
        let readiness = wait_for_workload_ready(&runner, &target(1200), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(readiness, WorkloadReadiness::Ready { attempts: 2 });
        assert_eq!(runner.count("kubectl get pods"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_passes_the_remaining_budget_as_timeout() {
        let runner = FakeRunner::new();
        wait_for_workload_ready(&runner, &target(900), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "kubectl wait --for=condition=Ready pod -l app.kubernetes.io/name=keycloak -n keycloak --timeout=900s"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn diagnostics_survive_failing_listings() {
        let runner = FakeRunner::new()
            .on("kubectl get pods", |_| CommandOutput::failed(1, "connection refused"));
        let diag = collect_diagnostics(&runner, "keycloak").await;
        assert!(diag.pods.contains("unavailable"));
        assert!(diag.pods.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn unstartable_listing_still_degrades_instead_of_failing() {
        let runner = FakeRunner::new()
            .on("kubectl wait", |_| {
                CommandOutput::failed(1, "error: no matching resources found")
            })
            .unstartable("kubectl get");
        let readiness = wait_for_workload_ready(&runner, &target(30), Duration::from_secs(10))
            .await
            .unwrap();
        let WorkloadReadiness::Degraded { diagnostics, .. } = readiness else {
            panic!("expected Degraded");
        };
        assert!(
            diagnostics.pods.contains("failed to spawn 'kubectl'"),
            "{}",
            diagnostics.pods
        );
        assert!(diagnostics.events.contains("unavailable"));
    }

    #[test]
    fn tail_keeps_header_and_latest_lines() {
        let text: String = std::iter::once("HEADER".to_string())
            .chain((1..=30).map(|i| format!("event {i}")))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = tail_lines(&text, 5);
        assert_eq!(tail, "HEADER\nevent 27\nevent 28\nevent 29\nevent 30");
    }
}
