//! Runtime access guard.
//!
//! The cluster driver talks to the container runtime as the invoking user,
//! which requires membership of the runtime's group *in the running process*.
//! A fresh install grants the group in the database, but a process only picks
//! up groups when it is created, so the pipeline has to replace itself once.
//!
//! ```text
//!   Unprivileged ──grant (usermod)──▶ GroupGranted ──re-exec (sg)──▶ Elevated
//! ```
//!
//! Each state has one transition. A run that has already re-executed once and
//! still cannot reach the runtime stops with [`StackupError::PrivilegeLoop`]
//! instead of re-executing again.

use std::borrow::Cow;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::context::{CredentialCache, ExecutionContext};
use crate::error::{Result, StackupError};
use crate::exec::{CommandRunner, Invocation};

/// The runtime CLI used for the access probe.
pub const RUNTIME_BINARY: &str = "docker";

/// Re-exec budget per logical run.
pub const MAX_REEXEC: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    /// The user is not a member of the runtime group.
    Unprivileged,
    /// The database lists the user, but this process predates the grant.
    GroupGranted,
    /// The group is in effect for this process (or the process is root).
    Elevated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Ready,
    /// Replace the current process with one started under `group`.
    ReexecRequired { group: String },
}

pub fn access_state(ctx: &ExecutionContext) -> AccessState {
    if ctx.is_root() || ctx.group_effective() {
        AccessState::Elevated
    } else if ctx.listed_in_group() {
        AccessState::GroupGranted
    } else {
        AccessState::Unprivileged
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Make sure later `sudo -n` calls will not prompt. Prompts at most once.
pub async fn ensure_credentials<R: CommandRunner>(
    ctx: &mut ExecutionContext,
    runner: &R,
) -> Result<()> {
    if ctx.is_root() {
        ctx.credentials = CredentialCache::NotNeeded;
        return Ok(());
    }

    let cached = runner
        .run(&Invocation::new("sudo").args(["-n", "true"]))
        .await?;
    if cached.success() {
        ctx.credentials = CredentialCache::Valid;
        return Ok(());
    }

    info!("elevated credentials required; sudo may prompt for a password");
    let prompted = runner
        .run(&Invocation::new("sudo").arg("-v").inherit())
        .await?;
    if !prompted.success() {
        return Err(StackupError::ElevationFailed(prompted.diagnostic()));
    }
    ctx.credentials = CredentialCache::Valid;
    Ok(())
}

// ---------------------------------------------------------------------------
// Runtime access
// ---------------------------------------------------------------------------

/// Decide whether this process can drive the container runtime, granting the
/// group when needed.
pub async fn ensure_runtime_access<R: CommandRunner>(
    ctx: &mut ExecutionContext,
    runtime: &RuntimeConfig,
    runner: &R,
) -> Result<AccessOutcome> {
    if probe_runtime(runner).await? {
        return Ok(AccessOutcome::Ready);
    }

    match access_state(ctx) {
        AccessState::Elevated => {
            // The group is in effect, so the daemon itself is down.
            warn!(service = %runtime.service, "runtime not answering; starting its service");
            let started = runner
                .run(
                    &Invocation::new("systemctl")
                        .args(["start", runtime.service.as_str()])
                        .elevated(),
                )
                .await?;
            if started.success() && probe_runtime(runner).await? {
                return Ok(AccessOutcome::Ready);
            }
            Err(StackupError::RuntimeUnavailable(started.diagnostic()))
        }
        AccessState::GroupGranted => request_reexec(ctx, &runtime.group),
        AccessState::Unprivileged => {
            if ctx.required_group.is_none() {
                return Err(StackupError::GroupMissing(runtime.group.clone()));
            }
            if ctx.reexec_depth >= MAX_REEXEC {
                return Err(StackupError::PrivilegeLoop(runtime.group.clone()));
            }
            info!(user = %ctx.user, group = %runtime.group, "granting runtime group membership");
            let granted = runner
                .run(
                    &Invocation::new("usermod")
                        .args(["-aG", runtime.group.as_str(), ctx.user.as_str()])
                        .elevated(),
                )
                .await?;
            if !granted.success() {
                return Err(StackupError::ElevationFailed(granted.diagnostic()));
            }
            ctx.record_grant();
            request_reexec(ctx, &runtime.group)
        }
    }
}

fn request_reexec(ctx: &ExecutionContext, group: &str) -> Result<AccessOutcome> {
    if ctx.reexec_depth >= MAX_REEXEC {
        return Err(StackupError::PrivilegeLoop(group.to_string()));
    }
    info!(group, "group membership not active in this process; re-executing");
    Ok(AccessOutcome::ReexecRequired {
        group: group.to_string(),
    })
}

async fn probe_runtime<R: CommandRunner>(runner: &R) -> Result<bool> {
    let out = runner
        .run(&Invocation::new(RUNTIME_BINARY).args(["info", "--format", "{{.ServerVersion}}"]))
        .await?;
    Ok(out.success())
}

// ---------------------------------------------------------------------------
// Re-exec plan
// ---------------------------------------------------------------------------

/// The command that replaces the current process: `sg <group> -c '<argv>'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReexecPlan {
    pub program: String,
    pub args: Vec<String>,
}

impl ReexecPlan {
    pub fn new(group: &str, argv: &[String]) -> Self {
        let command = argv
            .iter()
            .map(|a| shell_escape::unix::escape(Cow::Borrowed(a.as_str())))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            program: "sg".to_string(),
            args: vec![group.to_string(), "-c".to_string(), command],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
