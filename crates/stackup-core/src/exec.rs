//! External program invocation.
//!
//! Every stage talks to the outside world (docker, minikube, kubectl,
//! terraform, sudo) through [`CommandRunner`]. The production implementation
//! is [`SystemRunner`]; tests substitute a scripted runner so the pipeline can
//! be driven without a cluster.
//!
//! # Output modes
//! - [`OutputMode::Capture`]: stdout/stderr collected into [`CommandOutput`].
//!   Used for probes whose text is inspected or logged as diagnostics.
//! - [`OutputMode::Inherit`]: stdio passed through to the terminal. Used for
//!   the runtime install script, cluster start, the applier, and the sudo
//!   prompt. Failures then only report the exit code.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::context::{lookup_group, GroupFacts};
use crate::error::{Result, StackupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Capture,
    Inherit,
}

/// One external command, described as data so it can be logged, matched in
/// tests, and optionally run under `sudo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub elevated: bool,
    pub mode: OutputMode,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            elevated: false,
            mode: OutputMode::Capture,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through `sudo` (no-op when the runner already is root).
    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn inherit(mut self) -> Self {
        self.mode = OutputMode::Inherit;
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// `program arg1 arg2 …` without the sudo prefix.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elevated {
            write!(f, "sudo ")?;
        }
        f.write_str(&self.command_line())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The last few lines of stderr (or stdout when stderr is empty), for
    /// inline failure logging.
    pub fn diagnostic(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.trim().lines().collect();
        let tail = lines.len().saturating_sub(8);
        let text = lines[tail..].join("\n");
        if text.is_empty() {
            match self.code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            text
        }
    }
}

/// The seam between orchestration logic and the host.
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported in the output, not as
    /// an error; `Err` means the program could not be started at all.
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Start a long-lived background process. The child is killed when the
    /// returned handle is dropped.
    fn spawn(&self, invocation: &Invocation) -> Result<Child>;

    /// Locate a program on `PATH`.
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Read a group from the host's group database as it is now.
    fn group(&self, name: &str) -> Result<Option<GroupFacts>>;
}

// ---------------------------------------------------------------------------
// SystemRunner
// ---------------------------------------------------------------------------

/// Runs commands on the local host.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    is_root: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            is_root: nix::unistd::geteuid().is_root(),
        }
    }

    fn build(&self, invocation: &Invocation) -> Command {
        let mut cmd = if invocation.elevated && !self.is_root {
            let mut cmd = Command::new("sudo");
            // Credentials are refreshed up front, so never prompt mid-stage.
            if invocation.mode == OutputMode::Capture {
                cmd.arg("-n");
            }
            cmd.arg(&invocation.program);
            cmd
        } else {
            Command::new(&invocation.program)
        };
        cmd.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        match invocation.mode {
            OutputMode::Capture => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }
        cmd
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation, "exec");
        let output = self
            .build(invocation)
            .output()
            .await
            .map_err(|source| StackupError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        debug!(command = %invocation, "spawn");
        let mut cmd = self.build(invocation);
        // Background processes never read the terminal and their chatter is
        // not interesting.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| StackupError::Spawn {
            program: invocation.program.clone(),
            source,
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn group(&self, name: &str) -> Result<Option<GroupFacts>> {
        lookup_group(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
