//! Stage sequencing.
//!
//! [`Pipeline::run`] walks [`Stage::ALL`] in order. Each stage reduces to one
//! of three results: ok, degraded (logged, the run continues), or fatal (an
//! `Err` that ends the run). The walk can also end early without an error:
//! runtime access may ask for a re-exec, and a signal may interrupt health
//! verification or the report. Both are returned as a [`PipelineOutcome`] so
//! only the binary's entry point touches the process.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::apply::{apply_infrastructure, check_infra_dir, ApplyResult};
use crate::cluster::{enable_ingress, start_cluster, AddonAction, ClusterAction};
use crate::config::{Config, WorkloadConfig};
use crate::context::ExecutionContext;
use crate::error::{Result, StackupError};
use crate::exec::CommandRunner;
use crate::guard::{ensure_credentials, ensure_runtime_access, AccessOutcome};
use crate::health::{verify_http_health, HealthSpec, HealthVerdict};
use crate::paths;
use crate::readiness::{
    wait_for_namespace, wait_for_workload_ready, ReadinessTarget, WorkloadReadiness,
};
use crate::report::{access_instructions, AccessInstructions};
use crate::tools::{ensure_tools, host_arch, inventory, ToolAction};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Preflight,
    Credentials,
    Tools,
    RuntimeAccess,
    Cluster,
    Ingress,
    Apply,
    Namespace,
    Database,
    Application,
    Health,
    Report,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::Preflight,
        Stage::Credentials,
        Stage::Tools,
        Stage::RuntimeAccess,
        Stage::Cluster,
        Stage::Ingress,
        Stage::Apply,
        Stage::Namespace,
        Stage::Database,
        Stage::Application,
        Stage::Health,
        Stage::Report,
    ];

    /// Where a re-executed process picks up.
    pub const AFTER_REEXEC: Stage = Stage::Cluster;

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Credentials => "credentials",
            Stage::Tools => "tools",
            Stage::RuntimeAccess => "runtime-access",
            Stage::Cluster => "cluster",
            Stage::Ingress => "ingress",
            Stage::Apply => "apply",
            Stage::Namespace => "namespace",
            Stage::Database => "database",
            Stage::Application => "application",
            Stage::Health => "health",
            Stage::Report => "report",
        }
    }

    /// Stages that run even when resuming past them.
    pub fn always_runs(self) -> bool {
        matches!(
            self,
            Stage::Preflight | Stage::Credentials | Stage::RuntimeAccess
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StackupError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
                StackupError::InvalidConfig(format!(
                    "unknown stage '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Skipped,
    Degraded,
    Fatal,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Ok => "ok",
            StageStatus::Skipped => "skipped",
            StageStatus::Degraded => "degraded",
            StageStatus::Fatal => "fatal",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub health: Option<HealthVerdict>,
    pub access: Option<AccessInstructions>,
}

impl RunReport {
    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.status)
    }

    pub fn degraded(&self) -> bool {
        self.stages
            .iter()
            .any(|r| r.status == StageStatus::Degraded)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip non-guard stages before this one.
    pub from_stage: Option<Stage>,
    pub skip_health: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// The caller must replace the process with one running under `group`
    /// and resume at `resume_from`.
    Reexec { group: String, resume_from: Stage },
    /// A shutdown signal arrived during health verification or the report.
    Interrupted,
}

enum Step {
    Done(StageStatus, Option<String>),
    Reexec(String),
    Interrupted,
}

fn ok(detail: impl Into<String>) -> Step {
    Step::Done(StageStatus::Ok, Some(detail.into()))
}

fn degraded(detail: impl Into<String>) -> Step {
    Step::Done(StageStatus::Degraded, Some(detail.into()))
}

pub struct Pipeline<'a, R> {
    cfg: &'a Config,
    root: PathBuf,
    runner: &'a R,
    ctx: ExecutionContext,
    opts: RunOptions,
    report: RunReport,
    /// Set when the tools stage installed anything in this process.
    installed_tools: bool,
}

impl<'a, R: CommandRunner> Pipeline<'a, R> {
    pub fn new(
        cfg: &'a Config,
        root: &Path,
        runner: &'a R,
        ctx: ExecutionContext,
        opts: RunOptions,
    ) -> Self {
        Self {
            cfg,
            root: root.to_path_buf(),
            runner,
            ctx,
            opts,
            report: RunReport::default(),
            installed_tools: false,
        }
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Run every stage in order. `shutdown` is only listened to from the
    /// health check on.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<PipelineOutcome>
    where
        S: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        for stage in Stage::ALL {
            if let Some(reason) = self.skip_reason(stage) {
                let now = Utc::now();
                self.record(stage, StageStatus::Skipped, Some(reason), now, Duration::ZERO);
                continue;
            }

            info!(stage = %stage, "stage start");
            let started_at = Utc::now();
            let clock = Instant::now();
            match self.execute(stage, shutdown.as_mut()).await {
                Ok(Step::Done(status, detail)) => {
                    self.record(stage, status, detail, started_at, clock.elapsed());
                }
                Ok(Step::Reexec(group)) => {
                    self.record(
                        stage,
                        StageStatus::Ok,
                        Some(format!("re-executing under group '{group}'")),
                        started_at,
                        clock.elapsed(),
                    );
                    return Ok(PipelineOutcome::Reexec {
                        group,
                        resume_from: Stage::AFTER_REEXEC,
                    });
                }
                Ok(Step::Interrupted) => {
                    self.record(
                        stage,
                        StageStatus::Degraded,
                        Some("interrupted".to_string()),
                        started_at,
                        clock.elapsed(),
                    );
                    return Ok(PipelineOutcome::Interrupted);
                }
                Err(e) => {
                    error!(stage = %stage, error = %e, "stage failed");
                    let detail = Some(e.to_string());
                    let elapsed = clock.elapsed();
                    self.record(stage, StageStatus::Fatal, detail, started_at, elapsed);
                    return Err(e);
                }
            }
        }
        Ok(PipelineOutcome::Completed)
    }

    fn skip_reason(&self, stage: Stage) -> Option<String> {
        if let Some(from) = self.opts.from_stage {
            if stage < from && !stage.always_runs() {
                return Some(format!("resuming at {from}"));
            }
        }
        if stage == Stage::Health && self.opts.skip_health {
            return Some("--skip-health".to_string());
        }
        None
    }

    fn record(
        &mut self,
        stage: Stage,
        status: StageStatus,
        detail: Option<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) {
        self.report.stages.push(StageReport {
            stage,
            status,
            detail,
            started_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn infra_dir(&self) -> PathBuf {
        paths::infra_dir(&self.root, &self.cfg.infra.dir)
    }

    fn target(&self, name: &str, workload: &WorkloadConfig) -> ReadinessTarget {
        ReadinessTarget {
            name: name.to_string(),
            namespace: self.cfg.namespace_wait.namespace.clone(),
            selector: workload.selector.clone(),
            timeout: Duration::from_secs(workload.timeout_secs),
        }
    }

    async fn execute<S>(&mut self, stage: Stage, shutdown: Pin<&mut S>) -> Result<Step>
    where
        S: Future<Output = ()>,
    {
        let cfg = self.cfg;
        let runner = self.runner;
        let step = match stage {
            Stage::Preflight => {
                let dir = check_infra_dir(&self.infra_dir())?;
                ok(dir.display().to_string())
            }
            Stage::Credentials => {
                ensure_credentials(&mut self.ctx, runner).await?;
                ok(format!("{:?}", self.ctx.credentials).to_lowercase())
            }
            Stage::Tools => {
                let specs = inventory(&cfg.tools, &self.ctx.user, host_arch());
                let reports = ensure_tools(&specs, runner).await?;
                let installed: Vec<&str> = reports
                    .iter()
                    .filter(|r| r.action == ToolAction::Installed)
                    .map(|r| r.name.as_str())
                    .collect();
                self.installed_tools = !installed.is_empty();
                if installed.is_empty() {
                    ok("all present")
                } else {
                    ok(format!("installed {}", installed.join(", ")))
                }
            }
            Stage::RuntimeAccess => {
                // An install may have created the runtime group after capture.
                if self.installed_tools || self.ctx.required_group.is_none() {
                    let facts = runner.group(&cfg.runtime.group)?;
                    debug!(group = %cfg.runtime.group, found = facts.is_some(), "group re-read");
                    self.ctx.refresh_group(facts);
                }
                match ensure_runtime_access(&mut self.ctx, &cfg.runtime, runner).await? {
                    AccessOutcome::Ready => ok("runtime reachable"),
                    AccessOutcome::ReexecRequired { group } => Step::Reexec(group),
                }
            }
            Stage::Cluster => match start_cluster(&cfg.cluster, runner).await? {
                ClusterAction::AlreadyRunning => ok("already running"),
                ClusterAction::Started => ok("started"),
            },
            Stage::Ingress => {
                match enable_ingress(&cfg.ingress, &cfg.cluster.profile, runner).await? {
                    AddonAction::Enabled => ok("controller ready"),
                    AddonAction::EnableFailed { detail } => {
                        degraded(format!("addon enable failed: {detail}"))
                    }
                }
            }
            Stage::Apply => match apply_infrastructure(&self.infra_dir(), runner).await? {
                ApplyResult::Applied => ok("applied"),
                ApplyResult::Failed { step, detail } => {
                    degraded(format!("terraform {step} failed: {detail}"))
                }
            },
            Stage::Namespace => {
                let wait = &cfg.namespace_wait;
                let attempts = wait_for_namespace(
                    runner,
                    &wait.namespace,
                    wait.max_attempts,
                    Duration::from_secs(wait.interval_secs),
                )
                .await?;
                ok(format!("present after {attempts} probe(s)"))
            }
            Stage::Database | Stage::Application => {
                let (name, workload) = if stage == Stage::Database {
                    ("database", &cfg.workloads.database)
                } else {
                    ("application", &cfg.workloads.application)
                };
                let target = self.target(name, workload);
                let interval = Duration::from_secs(cfg.workloads.poll_interval_secs);
                match wait_for_workload_ready(runner, &target, interval).await? {
                    WorkloadReadiness::Ready { .. } => ok("ready"),
                    WorkloadReadiness::Degraded { .. } => degraded(format!(
                        "not ready within {}s",
                        target.timeout.as_secs()
                    )),
                }
            }
            Stage::Health => {
                let spec = HealthSpec::from_config(&cfg.health, &cfg.namespace_wait.namespace);
                let verdict = verify_http_health(runner, &spec, shutdown).await;
                self.report.health = Some(verdict.clone());
                match verdict {
                    HealthVerdict::Healthy { attempts } => {
                        ok(format!("UP after {attempts} attempt(s)"))
                    }
                    HealthVerdict::Unhealthy { attempts, last_error } => degraded(format!(
                        "not UP after {attempts} attempt(s): {last_error}"
                    )),
                    HealthVerdict::Interrupted => Step::Interrupted,
                }
            }
            Stage::Report => {
                let access = tokio::select! {
                    biased;
                    () = shutdown => None,
                    access = access_instructions(cfg, runner) => Some(access),
                };
                match access {
                    Some(access) => {
                        let detail = access.url.clone();
                        self.report.access = Some(access);
                        ok(detail)
                    }
                    None => Step::Interrupted,
                }
            }
        };
        Ok(step)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
