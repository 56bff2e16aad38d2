use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, StackupError};
use crate::exec::{CommandRunner, Invocation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyResult {
    Applied,
    /// The applier exited non-zero. Whether anything usable was created is
    /// decided by the namespace wait that follows.
    Failed { step: String, detail: String },
}

/// The infrastructure directory must exist before anything is provisioned.
pub fn check_infra_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_dir() {
        Ok(dir.to_path_buf())
    } else {
        Err(StackupError::MissingInfraDir(dir.to_path_buf()))
    }
}

fn terraform(dir: &Path, args: &[&str]) -> Invocation {
    Invocation::new("terraform")
        .arg(format!("-chdir={}", dir.display()))
        .args(args.iter().copied())
        .inherit()
}

/// `terraform init` then `terraform apply`, output streamed to the terminal.
pub async fn apply_infrastructure<R: CommandRunner>(dir: &Path, runner: &R) -> Result<ApplyResult> {
    check_infra_dir(dir)?;
    let steps = [
        ("init", terraform(dir, &["init", "-input=false"])),
        (
            "apply",
            terraform(dir, &["apply", "-auto-approve", "-input=false"]),
        ),
    ];
    for (step, invocation) in steps {
        info!(step, dir = %dir.display(), "running applier");
        let out = runner.run(&invocation).await?;
        if !out.success() {
            let detail = out.diagnostic();
            warn!(step, %detail, "applier failed; continuing to the namespace check");
            return Ok(ApplyResult::Failed {
                step: step.to_string(),
                detail,
            });
        }
    }
    Ok(ApplyResult::Applied)
}
