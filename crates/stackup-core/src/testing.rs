//! Scripted [`CommandRunner`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::process::{Child, Command};

use crate::context::GroupFacts;
use crate::error::{Result, StackupError};
use crate::exec::{CommandOutput, CommandRunner, Invocation};

type Responder = Box<dyn FnMut(u32) -> CommandOutput + Send>;

struct Rule {
    prefix: String,
    hits: u32,
    respond: Responder,
    installs: Option<String>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    rules: Vec<Rule>,
    present: HashSet<String>,
    spawned: Vec<u32>,
    groups: HashMap<String, GroupFacts>,
    spawn_fails: bool,
    unstartable: Vec<String>,
}

/// Records every invocation and answers from rules matched by command-line
/// prefix (first match wins). Unmatched commands succeed with empty output.
/// Spawned processes are real `sleep` children so teardown can be observed.
#[derive(Default)]
pub(crate) struct FakeRunner {
    state: Mutex<FakeState>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_tools(self, tools: &[&str]) -> Self {
        self.state
            .lock()
            .unwrap()
            .present
            .extend(tools.iter().map(|t| t.to_string()));
        self
    }

    pub(crate) fn with_group(self, facts: GroupFacts) -> Self {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(facts.name.clone(), facts);
        self
    }

    /// Every `spawn` fails as if the program were not installed.
    pub(crate) fn failing_spawn(self) -> Self {
        self.state.lock().unwrap().spawn_fails = true;
        self
    }

    /// Commands starting with `prefix` fail to start at all.
    pub(crate) fn unstartable(self, prefix: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .unstartable
            .push(prefix.to_string());
        self
    }

    /// Answer commands starting with `prefix`; the closure receives the
    /// 1-based hit count for this rule.
    pub(crate) fn on(
        self,
        prefix: &str,
        respond: impl FnMut(u32) -> CommandOutput + Send + 'static,
    ) -> Self {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            hits: 0,
            respond: Box::new(respond),
            installs: None,
        });
        self
    }

    /// A successful command starting with `prefix` makes `tool` locatable.
    pub(crate) fn on_install(self, prefix: &str, tool: &str) -> Self {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            hits: 0,
            respond: Box::new(|_| CommandOutput::ok("")),
            installs: Some(tool.to_string()),
        });
        self
    }

    /// Every invocation so far, rendered with its `sudo` prefix.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls starting with `prefix`, with or without their `sudo` prefix.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                c.starts_with(prefix)
                    || c.strip_prefix("sudo ").is_some_and(|rest| rest.starts_with(prefix))
            })
            .count()
    }

    pub(crate) fn spawned(&self) -> Vec<u32> {
        self.state.lock().unwrap().spawned.clone()
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(invocation.to_string());
        let line = invocation.command_line();
        if state.unstartable.iter().any(|p| line.starts_with(p.as_str())) {
            return Err(StackupError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let Some(index) = state.rules.iter().position(|r| line.starts_with(&r.prefix)) else {
            return Ok(CommandOutput::ok(""));
        };
        let rule = &mut state.rules[index];
        rule.hits += 1;
        let output = (rule.respond)(rule.hits);
        if let (true, Some(tool)) = (output.success(), rule.installs.clone()) {
            state.present.insert(tool);
        }
        Ok(output)
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(invocation.to_string());
        if state.spawn_fails {
            return Err(StackupError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let child = Command::new("sleep")
            .arg("600")
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            state.spawned.push(pid);
        }
        Ok(child)
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .present
            .contains(program)
            .then(|| PathBuf::from("/usr/local/bin").join(program))
    }

    fn group(&self, name: &str) -> Result<Option<GroupFacts>> {
        Ok(self.state.lock().unwrap().groups.get(name).cloned())
    }
}

/// True while a process with this pid exists (zombies included).
pub(crate) fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
