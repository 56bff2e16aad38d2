//! Cluster lifecycle and the ingress addon.
//!
//! Both waits here are fatal on timeout: with no ready node or no ingress
//! controller, nothing applied afterwards can become reachable.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ClusterConfig, IngressConfig};
use crate::error::{Result, StackupError};
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use crate::poll::{poll_until, OnTimeout, PollOutcome, PollPolicy};
use crate::readiness::{lift, settle, wait_pods_ready};

/// Interval between node-readiness probes that fail fast.
const NODE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const INGRESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAction {
    AlreadyRunning,
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "addon", rename_all = "snake_case")]
pub enum AddonAction {
    Enabled,
    /// The enable call failed; the controller wait still decides the stage.
    EnableFailed { detail: String },
}

/// Host, node, and pod view for `stackup status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSnapshot {
    pub profile: String,
    pub host: String,
    pub nodes: String,
    pub pods: String,
}

/// `minikube status` host field, or `None` when the profile does not exist
/// or the command fails.
pub async fn host_status<R: CommandRunner>(runner: &R, profile: &str) -> Result<Option<String>> {
    let out = runner
        .run(&Invocation::new("minikube").args([
            "status",
            "-p",
            profile,
            "--format={{.Host}}",
        ]))
        .await?;
    // A stopped host exits non-zero but still prints its state.
    let host = out.stdout.trim();
    Ok((!host.is_empty()).then(|| host.to_string()))
}

/// Start the cluster unless it is already running, then wait for every node
/// to report Ready.
pub async fn start_cluster<R: CommandRunner>(
    cfg: &ClusterConfig,
    runner: &R,
) -> Result<ClusterAction> {
    let action = match host_status(runner, &cfg.profile).await? {
        Some(host) if host == "Running" => {
            info!(profile = %cfg.profile, "cluster already running");
            ClusterAction::AlreadyRunning
        }
        host => {
            info!(
                profile = %cfg.profile,
                host = host.as_deref().unwrap_or("absent"),
                driver = %cfg.driver,
                cpus = cfg.cpus,
                memory_mb = cfg.memory_mb,
                "starting cluster"
            );
            let start = Invocation::new("minikube")
                .args([
                    "start".to_string(),
                    "-p".to_string(),
                    cfg.profile.clone(),
                    format!("--driver={}", cfg.driver),
                    format!("--cpus={}", cfg.cpus),
                    format!("--memory={}mb", cfg.memory_mb),
                    format!("--kubernetes-version={}", cfg.kubernetes_version),
                ])
                .inherit();
            let out = runner.run(&start).await?;
            if !out.success() {
                return Err(StackupError::ClusterStartFailed(format!(
                    "`{start}` {}",
                    out.diagnostic()
                )));
            }
            ClusterAction::Started
        }
    };

    wait_nodes_ready(runner, Duration::from_secs(cfg.ready_timeout_secs)).await?;
    Ok(action)
}

async fn wait_nodes_ready<R: CommandRunner>(runner: &R, timeout: Duration) -> Result<()> {
    info!(timeout_secs = timeout.as_secs(), "waiting for cluster node");
    let policy = PollPolicy::deadline(timeout, NODE_POLL_INTERVAL, OnTimeout::Fatal);
    let outcome = poll_until(&policy, move |attempt| {
        let probe = Invocation::new("kubectl").args([
            "wait".to_string(),
            "--for=condition=Ready".to_string(),
            "node".to_string(),
            "--all".to_string(),
            format!("--timeout={}s", attempt.remaining_secs(NODE_POLL_INTERVAL)),
        ]);
        async move { settle(runner.run(&probe).await) }
    })
    .await;

    match lift(outcome)? {
        PollOutcome::Ready { .. } => Ok(()),
        PollOutcome::Exhausted { attempts, .. } => Err(StackupError::ReadinessTimeout {
            what: "cluster node".to_string(),
            attempts,
        }),
    }
}

/// Enable the ingress addon (best effort) and wait for its controller pod.
pub async fn enable_ingress<R: CommandRunner>(
    cfg: &IngressConfig,
    profile: &str,
    runner: &R,
) -> Result<AddonAction> {
    info!(addon = %cfg.addon, "enabling ingress addon");
    let enable = Invocation::new("minikube").args(["-p", profile, "addons", "enable", &cfg.addon]);
    let out = runner.run(&enable).await?;
    let action = if out.success() {
        AddonAction::Enabled
    } else {
        let detail = out.diagnostic();
        warn!(
            addon = %cfg.addon,
            %detail,
            "addon enable failed; waiting for the controller anyway"
        );
        AddonAction::EnableFailed { detail }
    };

    let policy = PollPolicy::deadline(
        Duration::from_secs(cfg.timeout_secs),
        INGRESS_POLL_INTERVAL,
        OnTimeout::Fatal,
    );
    match wait_pods_ready(runner, &cfg.namespace, &cfg.selector, &policy).await? {
        PollOutcome::Ready { .. } => {
            info!(namespace = %cfg.namespace, "ingress controller ready");
            Ok(action)
        }
        PollOutcome::Exhausted { attempts, .. } => Err(StackupError::ReadinessTimeout {
            what: "ingress controller".to_string(),
            attempts,
        }),
    }
}

/// Read-only view of the cluster. Never starts anything.
pub async fn snapshot<R: CommandRunner>(
    runner: &R,
    profile: &str,
    namespace: &str,
) -> Result<ClusterSnapshot> {
    let host = host_status(runner, profile)
        .await?
        .unwrap_or_else(|| "Absent".to_string());
    let (nodes, pods) = if host == "Running" {
        let nodes = runner
            .run(&Invocation::new("kubectl").args(["get", "nodes"]))
            .await?;
        let pods = runner
            .run(&Invocation::new("kubectl").args(["get", "pods", "-n", namespace, "-o", "wide"]))
            .await?;
        (shown(&nodes), shown(&pods))
    } else {
        (String::new(), String::new())
    };
    Ok(ClusterSnapshot {
        profile: profile.to_string(),
        host,
        nodes,
        pods,
    })
}

fn shown(out: &CommandOutput) -> String {
    if out.success() {
        out.stdout.trim_end().to_string()
    } else {
        out.diagnostic()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
