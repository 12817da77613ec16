//! Out-of-process worker spawning
//!
//! The supervisor only needs to start a process for a labour, poll it
//! without blocking and terminate it on timeout. `CommandSpawner` does this
//! by re-invoking the current binary as `labour <id>`.

use std::path::PathBuf;
use std::process::Stdio;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::models::Labour;

/// Exit code a worker process uses when it could not record an outcome
pub const EXIT_OUTCOME_NOT_RECORDED: i32 = 75;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Handle on a running worker process
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_exit(&mut self) -> std::io::Result<Option<ProcessExit>>;

    /// Ask the process to terminate; the exit is observed by `try_exit`
    fn kill(&mut self) -> std::io::Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, labour: &Labour) -> std::io::Result<Box<dyn WorkerProcess>>;

    /// Whether a process with `pid` still exists
    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// Spawns `<program> [--config <file>] labour <id>`
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    config_file: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: PathBuf, config_file: Option<PathBuf>) -> Self {
        Self {
            program,
            config_file,
        }
    }

    /// Re-invoke the running executable
    pub fn current_exe(config_file: Option<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_file))
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, labour: &Labour) -> std::io::Result<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&self.program);
        if let Some(config_file) = &self.config_file {
            cmd.arg("--config").arg(config_file);
        }
        cmd.arg("labour").arg(labour.id.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        // Workers keep running if the supervisor exits
        cmd.kill_on_drop(false);

        let child = cmd.spawn()?;
        debug!(
            "Spawned {} labour {} as pid {:?}",
            self.program.display(),
            labour.id,
            child.id()
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> std::io::Result<Option<ProcessExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProcessExit { code: status.code() }))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
