//! Tool presence.
//!
//! Five external programs are required, checked in a fixed order. A tool on
//! `PATH` satisfies the contract regardless of its version; a missing tool is
//! downloaded at its pinned version and installed into
//! [`paths::INSTALL_DIR`]. A tool still missing after its recipe ran is fatal.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ToolVersions;
use crate::error::{Result, StackupError};
use crate::exec::{CommandRunner, Invocation};
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    Runtime,
    ClusterManager,
    ApiClient,
    PackageManager,
    Applier,
}

/// One entry of the tool inventory, with the recipe that installs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub role: ToolRole,
    pub version: String,
    pub source: String,
    pub steps: Vec<Invocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub role: ToolRole,
    pub pinned_version: String,
    pub source: String,
    pub installed_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    AlreadyPresent,
    Installed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolReport {
    pub name: String,
    pub action: ToolAction,
    pub path: PathBuf,
}

/// Architecture label used by the release download URLs.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "amd64",
    }
}

/// The ordered inventory: runtime, cluster manager, API client, package
/// manager, declarative applier.
pub fn inventory(versions: &ToolVersions, user: &str, arch: &str) -> Vec<ToolSpec> {
    let dl = |file: &str| paths::download_path(file).display().to_string();
    let dl_dir = paths::DOWNLOAD_DIR;
    let mkdir = || Invocation::new("mkdir").args(["-p", dl_dir]);
    let fetch = |url: &str, file: &str| {
        Invocation::new("curl").args(["-fsSL", "-o", dl(file).as_str(), url])
    };
    let install = |from: String, tool: &str| {
        Invocation::new("install")
            .args([
                "-m",
                "0755",
                from.as_str(),
                paths::install_target(tool).display().to_string().as_str(),
            ])
            .elevated()
    };

    let docker_source = "https://get.docker.com".to_string();
    let minikube_file = format!("minikube-linux-{arch}");
    let minikube_source = format!(
        "https://storage.googleapis.com/minikube/releases/{}/{minikube_file}",
        versions.minikube
    );
    let kubectl_source = format!(
        "https://dl.k8s.io/release/{}/bin/linux/{arch}/kubectl",
        versions.kubectl
    );
    let helm_file = format!("helm-{}-linux-{arch}.tar.gz", versions.helm);
    let helm_source = format!("https://get.helm.sh/{helm_file}");
    let terraform_file = format!("terraform_{v}_linux_{arch}.zip", v = versions.terraform);
    let terraform_source = format!(
        "https://releases.hashicorp.com/terraform/{}/{terraform_file}",
        versions.terraform
    );

    vec![
        ToolSpec {
            name: "docker",
            role: ToolRole::Runtime,
            version: "stable".to_string(),
            steps: vec![
                mkdir(),
                fetch(&docker_source, "get-docker.sh"),
                Invocation::new("sh")
                    .arg(dl("get-docker.sh"))
                    .elevated()
                    .inherit(),
                Invocation::new("usermod")
                    .args(["-aG", "docker", user])
                    .elevated(),
                Invocation::new("systemctl")
                    .args(["enable", "--now", "docker"])
                    .elevated(),
            ],
            source: docker_source,
        },
        ToolSpec {
            name: "minikube",
            role: ToolRole::ClusterManager,
            version: versions.minikube.clone(),
            steps: vec![
                mkdir(),
                fetch(&minikube_source, &minikube_file),
                install(dl(&minikube_file), "minikube"),
            ],
            source: minikube_source,
        },
        ToolSpec {
            name: "kubectl",
            role: ToolRole::ApiClient,
            version: versions.kubectl.clone(),
            steps: vec![
                mkdir(),
                fetch(&kubectl_source, "kubectl"),
                install(dl("kubectl"), "kubectl"),
            ],
            source: kubectl_source,
        },
        ToolSpec {
            name: "helm",
            role: ToolRole::PackageManager,
            version: versions.helm.clone(),
            steps: vec![
                mkdir(),
                fetch(&helm_source, &helm_file),
                Invocation::new("tar").args(["-xzf", dl(&helm_file).as_str(), "-C", dl_dir]),
                install(dl(&format!("linux-{arch}/helm")), "helm"),
            ],
            source: helm_source,
        },
        ToolSpec {
            name: "terraform",
            role: ToolRole::Applier,
            version: versions.terraform.clone(),
            steps: vec![
                mkdir(),
                fetch(&terraform_source, &terraform_file),
                Invocation::new("unzip").args(["-o", dl(&terraform_file).as_str(), "-d", dl_dir]),
                install(dl("terraform"), "terraform"),
            ],
            source: terraform_source,
        },
    ]
}

/// Presence only; never installs. Backs `stackup tools`.
pub fn inventory_status<R: CommandRunner>(specs: &[ToolSpec], runner: &R) -> Vec<ToolStatus> {
    specs
        .iter()
        .map(|spec| ToolStatus {
            name: spec.name.to_string(),
            role: spec.role,
            pinned_version: spec.version.clone(),
            source: spec.source.clone(),
            installed_path: runner.locate(spec.name),
        })
        .collect()
}

/// Install every missing tool, in order. Present tools cause no action.
pub async fn ensure_tools<R: CommandRunner>(
    specs: &[ToolSpec],
    runner: &R,
) -> Result<Vec<ToolReport>> {
    let mut reports = Vec::with_capacity(specs.len());
    for spec in specs {
        reports.push(ensure_tool(spec, runner).await?);
    }
    Ok(reports)
}

async fn ensure_tool<R: CommandRunner>(spec: &ToolSpec, runner: &R) -> Result<ToolReport> {
    if let Some(path) = runner.locate(spec.name) {
        debug!(tool = spec.name, path = %path.display(), "present");
        return Ok(ToolReport {
            name: spec.name.to_string(),
            action: ToolAction::AlreadyPresent,
            path,
        });
    }

    info!(tool = spec.name, version = %spec.version, source = %spec.source, "installing");
    for step in &spec.steps {
        let out = runner.run(step).await?;
        if !out.success() {
            return Err(StackupError::InstallFailed {
                tool: spec.name.to_string(),
                detail: format!("`{step}` failed: {}", out.diagnostic()),
            });
        }
    }

    let path = runner
        .locate(spec.name)
        .ok_or_else(|| StackupError::ToolMissingAfterInstall {
            tool: spec.name.to_string(),
        })?;
    info!(tool = spec.name, path = %path.display(), "installed");
    Ok(ToolReport {
        name: spec.name.to_string(),
        action: ToolAction::Installed,
        path,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
