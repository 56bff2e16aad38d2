use std::fmt::Write as _;

use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::exec::{CommandRunner, Invocation};

/// How to reach the deployed application once the run is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessInstructions {
    pub cluster_ip: Option<String>,
    pub hostname: String,
    pub url: String,
    pub hosts_entry: Option<String>,
    pub port_forward: String,
    pub fallback_url: String,
}

/// Never fails; without a cluster IP only the port-forward route is offered.
pub async fn access_instructions<R: CommandRunner>(
    cfg: &Config,
    runner: &R,
) -> AccessInstructions {
    let ip = runner
        .run(&Invocation::new("minikube").args(["-p", &cfg.cluster.profile, "ip"]))
        .await;
    let cluster_ip = match ip {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
            Some(out.stdout.trim().to_string())
        }
        Ok(out) => {
            warn!(detail = %out.diagnostic(), "could not read the cluster IP");
            None
        }
        Err(e) => {
            warn!(error = %e, "could not read the cluster IP");
            None
        }
    };

    let hostname = cfg.access.hostname.clone();
    let local = cfg.access.local_port();
    AccessInstructions {
        hosts_entry: cluster_ip.as_ref().map(|ip| format!("{ip} {hostname}")),
        url: format!("http://{hostname}/"),
        port_forward: format!(
            "kubectl port-forward -n {} svc/{} {local}:{}",
            cfg.namespace_wait.namespace, cfg.health.service, cfg.access.http_port
        ),
        fallback_url: format!("http://localhost:{local}/"),
        cluster_ip,
        hostname,
    }
}

pub fn render(info: &AccessInstructions) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Access");
    match &info.hosts_entry {
        Some(entry) => {
            let _ = writeln!(text, "  1. add to /etc/hosts:  {entry}");
            let _ = writeln!(text, "  2. open:               {}", info.url);
        }
        None => {
            let _ = writeln!(
                text,
                "  cluster IP unknown; run `minikube ip` and map it to {} in /etc/hosts",
                info.hostname
            );
        }
    }
    let _ = writeln!(text, "  or, without ingress:   {}", info.port_forward);
    let _ = write!(text, "  then open:             {}", info.fallback_url);
    text
}
