//! Scoped port-forward tunnel.
//!
//! A [`TunnelSession`] owns the `kubectl port-forward` child. Callers close it
//! explicitly with [`TunnelSession::close`], which kills and reaps the child;
//! dropping an unclosed session still sends the kill.

use std::fmt;

use tokio::process::Child;
use tracing::{debug, warn};

use crate::error::Result;
use crate::exec::{CommandRunner, Invocation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl TunnelSpec {
    pub fn invocation(&self) -> Invocation {
        Invocation::new("kubectl").args([
            "port-forward".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            format!("svc/{}", self.service),
            format!("{}:{}", self.local_port, self.remote_port),
        ])
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "127.0.0.1:{} -> {}/svc/{}:{}",
            self.local_port, self.namespace, self.service, self.remote_port
        )
    }
}

pub struct TunnelSession {
    spec: TunnelSpec,
    child: Option<Child>,
    respawns: u32,
}

impl TunnelSession {
    pub fn open<R: CommandRunner>(spec: TunnelSpec, runner: &R) -> Result<Self> {
        let child = runner.spawn(&spec.invocation())?;
        debug!(tunnel = %spec, pid = ?child.id(), "tunnel opened");
        Ok(Self {
            spec,
            child: Some(child),
            respawns: 0,
        })
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn respawns(&self) -> u32 {
        self.respawns
    }

    /// Respawn the forwarder if it has exited. Returns true when a new
    /// process was started.
    pub fn ensure_alive<R: CommandRunner>(&mut self, runner: &R) -> Result<bool> {
        let running = match self.child.as_mut() {
            Some(child) => match child.try_wait()? {
                None => true,
                Some(status) => {
                    warn!(tunnel = %self.spec, %status, "port-forward exited; respawning");
                    false
                }
            },
            None => false,
        };
        if running {
            return Ok(false);
        }
        self.child = Some(runner.spawn(&self.spec.invocation())?);
        self.respawns += 1;
        Ok(true)
    }

    /// Kill the forwarder and wait for it to be reaped.
    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                debug!(?pid, error = %e, "tunnel already gone");
            }
            debug!(tunnel = %self.spec, ?pid, "tunnel closed");
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}
