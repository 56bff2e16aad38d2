use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackupError {
    #[error("infrastructure directory not found: {}", .0.display())]
    MissingInfraDir(PathBuf),

    #[error("tool '{tool}' is still missing after install")]
    ToolMissingAfterInstall { tool: String },

    #[error("failed to install '{tool}': {detail}")]
    InstallFailed { tool: String, detail: String },

    #[error("elevated credentials unavailable: {0}")]
    ElevationFailed(String),

    #[error("group '{0}' does not exist on this system")]
    GroupMissing(String),

    #[error("container runtime still unreachable after re-exec under group '{0}'")]
    PrivilegeLoop(String),

    #[error("container runtime is not responding: {0}")]
    RuntimeUnavailable(String),

    #[error("cluster failed to start: {0}")]
    ClusterStartFailed(String),

    #[error("{what} not ready after {attempts} attempt(s)")]
    ReadinessTimeout { what: String, attempts: u32 },

    #[error("namespace '{name}' did not appear after {attempts} attempt(s)")]
    NamespaceMissing { name: String, attempts: u32 },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot resolve current user: {0}")]
    UnknownUser(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl StackupError {
    /// Short remediation advice shown under the fatal error line.
    pub fn hint(&self) -> Option<String> {
        let hint = match self {
            StackupError::MissingInfraDir(dir) => format!(
                "create {} with the namespace and release definitions, or set infra.dir in stackup.yaml",
                dir.display()
            ),
            StackupError::ToolMissingAfterInstall { tool }
            | StackupError::InstallFailed { tool, .. } => {
                format!("install {tool} manually, make sure it is on PATH, then re-run: stackup up")
            }
            StackupError::ElevationFailed(_) => {
                "run stackup from an account allowed to use sudo".to_string()
            }
            StackupError::GroupMissing(group) => format!(
                "the runtime install did not create the '{group}' group; reinstall docker and re-run"
            ),
            StackupError::PrivilegeLoop(group) => format!(
                "log out and back in so the '{group}' group applies, then re-run: stackup up --from-stage cluster"
            ),
            StackupError::RuntimeUnavailable(_) => {
                "check the daemon with: sudo systemctl status docker".to_string()
            }
            StackupError::ClusterStartFailed(_) => {
                "inspect with: minikube logs  (or reset with: minikube delete)".to_string()
            }
            StackupError::ReadinessTimeout { .. } => {
                "inspect with: kubectl get pods -A".to_string()
            }
            StackupError::NamespaceMissing { .. } => {
                "check the applier output above, then re-run: stackup up --from-stage apply".to_string()
            }
            _ => return None,
        };
        Some(hint)
    }
}

pub type Result<T> = std::result::Result<T, StackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_variants_carry_hints() {
        let err = StackupError::PrivilegeLoop("docker".into());
        assert!(err.hint().unwrap().contains("docker"));

        let err = StackupError::MissingInfraDir(PathBuf::from("/tmp/infra"));
        assert!(err.to_string().contains("/tmp/infra"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn plumbing_errors_have_no_hint() {
        let err = StackupError::Io(std::io::Error::other("boom"));
        assert!(err.hint().is_none());
    }
}
