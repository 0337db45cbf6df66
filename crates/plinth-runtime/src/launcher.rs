//! Worker processes as real OS processes.
//!
//! The host re-executes a worker program (normally its own binary) with the
//! store name and slot index on the command line:
//!
//! ```text
//! <program> worker --store /plinth-1234-ab12cd34 --slot 0 --log-level info --log-format compact
//! ```

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::supervisor::{WorkerExit, WorkerLauncher, WorkerProcess, WorkerSpec};

/// Spawns `program worker ...` for each worker.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    store_name: String,
    log_level: String,
    log_format: String,
}

impl ProcessLauncher {
    /// Launch workers from `program`, pointing them at the named store.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, store_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            store_name: store_name.into(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }

    /// Logging settings forwarded to each worker.
    #[must_use]
    pub fn with_logging(mut self, level: impl Into<String>, format: impl Into<String>) -> Self {
        self.log_level = level.into();
        self.log_format = format.into();
        self
    }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--store")
            .arg(&self.store_name)
            .arg("--slot")
            .arg(spec.slot.index().to_string())
            .arg("--log-level")
            .arg(&self.log_level)
            .arg("--log-format")
            .arg(&self.log_format)
            .stdin(Stdio::null());
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec) -> RuntimeResult<Box<dyn WorkerProcess>> {
        let child = self
            .command(spec)
            .spawn()
            .map_err(|e| RuntimeError::WorkerSpawn {
                plugin: spec.identity.to_string(),
                message: format!("{}: {e}", self.program.display()),
            })?;
        debug!(plugin = %spec.identity, pid = child.id(), "worker process spawned");
        Ok(Box::new(ChildProcess { child }))
    }
}

/// A spawned worker process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    fn pid(&self) -> RuntimeResult<Pid> {
        i32::try_from(self.child.id())
            .map(Pid::from_raw)
            .map_err(|e| RuntimeError::Io(std::io::Error::other(e)))
    }
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> RuntimeResult<Option<WorkerExit>> {
        let status = self.child.try_wait()?;
        Ok(status.map(|status| match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signal)) => WorkerExit::Signal(signal),
            (None, None) => WorkerExit::Code(-1),
        }))
    }

    fn terminate(&mut self) -> RuntimeResult<()> {
        // Already reaped: nothing to signal.
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        kill(self.pid()?, Signal::SIGTERM).map_err(|e| RuntimeError::Io(e.into()))
    }

    fn kill(&mut self) -> RuntimeResult<()> {
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}
