//! End-to-end health verification through a port-forward tunnel.
//!
//! The tunnel is opened before the first request and closed on every exit
//! path: healthy, exhausted, interrupted, or a probe error.

use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::poll::{poll_until, OnTimeout, PollOutcome, PollPolicy};
use crate::tunnel::{TunnelSession, TunnelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSpec {
    pub tunnel: TunnelSpec,
    pub path: String,
    pub max_attempts: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl HealthSpec {
    pub fn from_config(cfg: &HealthConfig, namespace: &str) -> Self {
        Self {
            tunnel: TunnelSpec {
                namespace: namespace.to_string(),
                service: cfg.service.clone(),
                local_port: cfg.local_port,
                remote_port: cfg.remote_port,
            },
            path: cfg.path.clone(),
            max_attempts: cfg.max_attempts,
            interval: Duration::from_secs(cfg.interval_secs),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.tunnel.local_port, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy { attempts: u32 },
    Unhealthy { attempts: u32, last_error: String },
    Interrupted,
}

/// Poll the health endpoint until it reports `UP`, the attempts run out, or
/// `shutdown` resolves.
///
/// Never fails: a tunnel that cannot be started or kept alive is reported as
/// [`HealthVerdict::Unhealthy`] with the cause in `last_error`.
pub async fn verify_http_health<R, S>(runner: &R, spec: &HealthSpec, shutdown: S) -> HealthVerdict
where
    R: CommandRunner,
    S: Future<Output = ()>,
{
    let verdict = match poll_health(runner, spec, shutdown).await {
        Ok(verdict) => verdict,
        Err(e) => HealthVerdict::Unhealthy {
            attempts: 0,
            last_error: e.to_string(),
        },
    };
    match &verdict {
        HealthVerdict::Healthy { attempts } => info!(attempts, "application healthy"),
        HealthVerdict::Unhealthy {
            attempts,
            last_error,
        } => warn!(attempts, %last_error, "application did not report healthy"),
        HealthVerdict::Interrupted => warn!("health verification interrupted"),
    }
    verdict
}

async fn poll_health<R, S>(runner: &R, spec: &HealthSpec, shutdown: S) -> Result<HealthVerdict>
where
    R: CommandRunner,
    S: Future<Output = ()>,
{
    let client = reqwest::Client::builder()
        .timeout(spec.request_timeout)
        .build()?;
    let url = spec.url();
    info!(tunnel = %spec.tunnel, %url, attempts = spec.max_attempts, "verifying health");

    let mut session = TunnelSession::open(spec.tunnel.clone(), runner)?;
    let pid = session.pid();
    let last_error = RefCell::new(String::from("no attempt made"));
    let last_error_slot = &last_error;

    let verdict = {
        let policy = PollPolicy::attempts(spec.max_attempts, spec.interval, OnTimeout::Degraded);
        let polled = poll_until(&policy, |attempt| {
            let respawned = session.ensure_alive(runner);
            let client = client.clone();
            let url = url.clone();
            async move {
                if let Err(e) = respawned {
                    return Some(Err(e));
                }
                match check_status(&client, &url).await {
                    Ok(()) => Some(Ok(())),
                    Err(reason) => {
                        debug!(attempt = attempt.number, %reason, "not healthy yet");
                        *last_error_slot.borrow_mut() = reason;
                        None
                    }
                }
            }
        });

        tokio::select! {
            outcome = polled => match outcome {
                PollOutcome::Ready { value: Ok(()), attempts, .. } => {
                    HealthVerdict::Healthy { attempts }
                }
                PollOutcome::Ready { value: Err(e), attempts, .. } => HealthVerdict::Unhealthy {
                    attempts,
                    last_error: format!("tunnel lost: {e}"),
                },
                PollOutcome::Exhausted { attempts, .. } => HealthVerdict::Unhealthy {
                    attempts,
                    last_error: last_error.borrow().clone(),
                },
            },
            () = shutdown => HealthVerdict::Interrupted,
        }
    };

    session.close().await;
    debug!(?pid, "health tunnel released");
    Ok(verdict)
}

/// One request. `Err` carries a human-readable reason.
async fn check_status(client: &reqwest::Client, url: &str) -> std::result::Result<(), String> {
    let resp = client.get(url).send().await.map_err(|e| e.to_string())?;
    let code = resp.status();
    let body: Value = resp
        .json()
        .await
        .map_err(|e| format!("HTTP {code}: unreadable body: {e}"))?;
    match body.get("status").and_then(Value::as_str) {
        Some(status) if status.eq_ignore_ascii_case("UP") => Ok(()),
        Some(status) => Err(format!("HTTP {code}: status {status}")),
        None => Err(format!("HTTP {code}: no status field")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pid_alive, FakeRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spec_for(server: &mockito::ServerGuard, max_attempts: u32) -> HealthSpec {
        let port = server
            .host_with_port()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap();
        HealthSpec {
            tunnel: TunnelSpec {
                namespace: "keycloak".into(),
                service: "keycloak".into(),
                local_port: port,
                remote_port: 9000,
            },
            path: "/health/ready".into(),
            max_attempts,
            interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn up_on_fifth_attempt_is_healthy_after_exactly_five_requests() {
        let mut server = mockito::Server::new_async().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mock = server
            .mock("GET", "/health/ready")
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 5 {
                    br#"{"status":"UP"}"#.to_vec()
                } else {
                    br#"{"status":"DOWN"}"#.to_vec()
                }
            })
            .expect(5)
            .create_async()
            .await;

        let runner = FakeRunner::new();
        let verdict =
            verify_http_health(&runner, &spec_for(&server, 90), std::future::pending()).await;

        assert_eq!(verdict, HealthVerdict::Healthy { attempts: 5 });
        mock.assert_async().await;
        let pids = runner.spawned();
        assert_eq!(pids.len(), 1);
        assert!(!pid_alive(pids[0]));
        assert_eq!(
            runner.calls()[0],
            format!(
                "kubectl port-forward -n keycloak svc/keycloak {}:9000",
                spec_for(&server, 90).tunnel.local_port
            )
        );
    }

    #[tokio::test]
    async fn exhaustion_is_unhealthy_and_releases_the_tunnel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health/ready")
            .with_status(503)
            .with_body(r#"{"status":"DOWN","checks":[]}"#)
            .expect(3)
            .create_async()
            .await;

        let runner = FakeRunner::new();
        let verdict =
            verify_http_health(&runner, &spec_for(&server, 3), std::future::pending()).await;

        match verdict {
            HealthVerdict::Unhealthy {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("DOWN"), "{last_error}");
            }
            other => panic!("expected Unhealthy, got {other:?}"),
        }
        mock.assert_async().await;
        assert!(runner.spawned().iter().all(|pid| !pid_alive(*pid)));
    }

    #[tokio::test]
    async fn shutdown_interrupts_and_releases_the_tunnel() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health/ready")
            .with_body(r#"{"status":"DOWN"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let runner = FakeRunner::new();
        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let verdict = verify_http_health(&runner, &spec_for(&server, 10_000), shutdown).await;

        assert_eq!(verdict, HealthVerdict::Interrupted);
        let pids = runner.spawned();
        assert!(!pids.is_empty());
        assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    }

    #[tokio::test]
    async fn lowercase_up_counts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health/ready")
            .with_body(r#"{"status":"up"}"#)
            .create_async()
            .await;
        let runner = FakeRunner::new();
        let verdict =
            verify_http_health(&runner, &spec_for(&server, 2), std::future::pending()).await;
        assert_eq!(verdict, HealthVerdict::Healthy { attempts: 1 });
    }

    #[tokio::test]
    async fn tunnel_that_cannot_start_is_unhealthy_not_an_error() {
        let server = mockito::Server::new_async().await;
        let runner = FakeRunner::new().failing_spawn();
        let verdict =
            verify_http_health(&runner, &spec_for(&server, 3), std::future::pending()).await;
        match verdict {
            HealthVerdict::Unhealthy {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 0);
                assert!(last_error.contains("kubectl"), "{last_error}");
            }
            other => panic!("expected Unhealthy, got {other:?}"),
        }
        assert!(runner.spawned().is_empty());
    }

    #[test]
    fn url_targets_the_local_end_of_the_tunnel() {
        let spec = HealthSpec::from_config(&HealthConfig::default(), "keycloak");
        assert_eq!(spec.url(), "http://127.0.0.1:19000/health/ready");
        assert_eq!(spec.tunnel.remote_port, 9000);
    }
}
