//! Worker supervision for BACKGROUND plugins.
//!
//! Registration comes in two flavours, picked by the caller's [`BootPhase`]:
//!
//! - **Preload (static)**: [`Supervisor::register_static`] records the intent
//!   and returns. Nothing is spawned until [`Supervisor::start_pending`] runs
//!   once the host has finished booting.
//! - **Runtime (dynamic)**: [`Supervisor::register_dynamic`] spawns the worker
//!   immediately and returns a [`WorkerHandle`]; [`Supervisor::await_started`]
//!   then blocks until the worker reports started through its slot or the
//!   start timeout elapses.
//!
//! After start, [`Supervisor::reap`] collects exits, applies the
//! [`RestartPolicy`] and recycles slots.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::PluginIdentity;
use crate::store::{SharedConfigStore, SlotId, SlotState};

/// Host boot phase, supplied explicitly by whoever registers a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// The host is still starting; workers are spawned after boot.
    Preload,
    /// The host is up; workers are spawned and awaited on registration.
    Runtime,
}

/// What happens when a worker exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart after a failed exit, at most `max_retries` times.
    OnFailure {
        /// Restart budget.
        max_retries: u32,
    },
    /// Restart after every exit.
    Always,
}

impl RestartPolicy {
    fn allows(self, exit: WorkerExit, restarts_so_far: u32) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure { max_retries } => !exit.is_success() && restarts_so_far < max_retries,
            Self::Always => true,
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum number of workers registered at once, pending ones included.
    pub max_workers: usize,
    /// Bound on [`Supervisor::await_started`].
    pub start_timeout: Duration,
    /// How often a starting worker's slot is polled.
    pub poll_interval: Duration,
    /// Restart policy for plugin workers.
    pub restart: RestartPolicy,
    /// Delay before a restart.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            start_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            restart: RestartPolicy::Never,
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Everything a worker needs to find its plugin: only plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Plugin the worker runs.
    pub identity: PluginIdentity,
    /// Slot holding the plugin's published record.
    pub slot: SlotId,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
}

impl WorkerExit {
    /// Exit status 0.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Code(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// A running worker.
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be queried.
    fn try_wait(&mut self) -> RuntimeResult<Option<WorkerExit>>;

    /// Deliver the host-level interrupt. The worker stops at its next
    /// iteration boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the interrupt cannot be delivered.
    fn terminate(&mut self) -> RuntimeResult<()>;

    /// Stop the worker immediately and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot be killed.
    fn kill(&mut self) -> RuntimeResult<()>;
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker for `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::WorkerSpawn`] if the worker cannot be started.
    fn launch(&self, spec: &WorkerSpec) -> RuntimeResult<Box<dyn WorkerProcess>>;
}

/// Returned by dynamic registration; only good for
/// [`Supervisor::await_started`].
#[derive(Debug)]
#[must_use = "await the handle to learn whether the worker started"]
pub struct WorkerHandle {
    identity: PluginIdentity,
    slot: SlotId,
}

impl WorkerHandle {
    /// Slot the worker was given.
    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Preload phase: queued until the host finishes booting.
    Deferred,
    /// Runtime phase: the worker reported started.
    Started {
        /// Worker process id, when the launcher exposes one.
        pid: Option<u32>,
    },
}

/// Something [`Supervisor::reap`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A worker exited and its slot was recycled.
    Exited {
        /// Plugin the worker ran.
        identity: PluginIdentity,
        /// How it ended.
        exit: WorkerExit,
    },
    /// A worker exited and will be restarted after the delay.
    RestartScheduled {
        /// Plugin the worker ran.
        identity: PluginIdentity,
        /// How it ended.
        exit: WorkerExit,
        /// Restart number, starting at 1.
        attempt: u32,
    },
    /// A scheduled restart spawned a new worker.
    Restarted {
        /// Plugin the worker runs.
        identity: PluginIdentity,
        /// Restart number, starting at 1.
        attempt: u32,
    },
    /// A scheduled restart could not spawn a worker; the slot was recycled.
    RestartFailed {
        /// Plugin the worker ran.
        identity: PluginIdentity,
        /// Error text.
        error: String,
    },
}

struct Worker {
    spec: WorkerSpec,
    process: Box<dyn WorkerProcess>,
    restarts: u32,
    stop_requested: bool,
}

struct PendingRestart {
    spec: WorkerSpec,
    attempt: u32,
    due: Instant,
}

/// Tracks worker processes for BACKGROUND plugins.
pub struct Supervisor {
    store: Arc<SharedConfigStore>,
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    pending: Vec<WorkerSpec>,
    workers: Vec<Worker>,
    restarts: Vec<PendingRestart>,
}

impl Supervisor {
    /// A supervisor handing out slots from `store`.
    #[must_use]
    pub fn new(
        store: Arc<SharedConfigStore>,
        launcher: Arc<dyn WorkerLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
            pending: Vec::new(),
            workers: Vec::new(),
            restarts: Vec::new(),
        }
    }

    /// The configuration store workers read from.
    #[must_use]
    pub fn store(&self) -> &Arc<SharedConfigStore> {
        &self.store
    }

    /// Settings in effect.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn registered(&self) -> usize {
        self.pending
            .len()
            .saturating_add(self.workers.len())
            .saturating_add(self.restarts.len())
    }

    fn ensure_capacity(&self) -> RuntimeResult<()> {
        if self.registered() >= self.config.max_workers {
            return Err(RuntimeError::WorkerCapacityExhausted {
                limit: self.config.max_workers,
            });
        }
        Ok(())
    }

    /// Register a worker using the protocol for `phase`.
    ///
    /// # Errors
    ///
    /// Whatever [`register_static`](Self::register_static),
    /// [`register_dynamic`](Self::register_dynamic) or
    /// [`await_started`](Self::await_started) return.
    pub fn register(&mut self, phase: BootPhase, spec: WorkerSpec) -> RuntimeResult<Registration> {
        match phase {
            BootPhase::Preload => {
                self.register_static(spec)?;
                Ok(Registration::Deferred)
            },
            BootPhase::Runtime => {
                let handle = self.register_dynamic(spec)?;
                let pid = self.await_started(handle)?;
                Ok(Registration::Started { pid })
            },
        }
    }

    /// Preload-phase registration: record the worker for later.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::WorkerCapacityExhausted`] if the worker limit is
    /// reached.
    pub fn register_static(&mut self, spec: WorkerSpec) -> RuntimeResult<()> {
        self.ensure_capacity()?;
        debug!(plugin = %spec.identity, slot = %spec.slot, "worker queued until boot completes");
        self.pending.push(spec);
        Ok(())
    }

    /// Runtime-phase registration: spawn the worker now.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::WorkerCapacityExhausted`] if the worker limit is
    /// reached, [`RuntimeError::WorkerSpawn`] if the process cannot start.
    pub fn register_dynamic(&mut self, spec: WorkerSpec) -> RuntimeResult<WorkerHandle> {
        self.ensure_capacity()?;
        let process = self.launcher.launch(&spec)?;
        info!(plugin = %spec.identity, slot = %spec.slot, pid = ?process.id(), "worker spawned");
        let handle = WorkerHandle {
            identity: spec.identity.clone(),
            slot: spec.slot,
        };
        self.workers.push(Worker {
            spec,
            process,
            restarts: 0,
            stop_requested: false,
        });
        Ok(handle)
    }

    fn worker_index(&self, slot: SlotId) -> Option<usize> {
        self.workers.iter().position(|w| w.spec.slot == slot)
    }

    /// Block until the worker behind `handle` reports started.
    ///
    /// On failure the worker is stopped and its slot recycled.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::WorkerStartFailed`] if the worker exits first,
    /// [`RuntimeError::WorkerStartTimeout`] if the start timeout elapses.
    pub fn await_started(&mut self, handle: WorkerHandle) -> RuntimeResult<Option<u32>> {
        let WorkerHandle { identity, slot } = handle;
        let deadline = Instant::now()
            .checked_add(self.config.start_timeout)
            .unwrap_or_else(Instant::now);

        loop {
            let Some(idx) = self.worker_index(slot) else {
                return Err(RuntimeError::WorkerStartFailed {
                    plugin: identity.to_string(),
                    exit: "worker is no longer tracked".into(),
                });
            };

            if let Some(SlotState::Running | SlotState::Exited | SlotState::Failed) =
                self.store.slot_state(slot)
            {
                let pid = self.workers[idx].process.id();
                info!(plugin = %identity, %slot, ?pid, "worker started");
                return Ok(pid);
            }

            if let Some(exit) = self.workers[idx].process.try_wait()? {
                self.workers.swap_remove(idx);
                self.store.release(slot);
                warn!(plugin = %identity, %exit, "worker exited before starting");
                return Err(RuntimeError::WorkerStartFailed {
                    plugin: identity.to_string(),
                    exit: exit.to_string(),
                });
            }

            if Instant::now() >= deadline {
                let mut worker = self.workers.swap_remove(idx);
                if let Err(e) = worker.process.kill() {
                    warn!(plugin = %identity, error = %e, "failed to kill unstarted worker");
                }
                self.store.release(slot);
                warn!(plugin = %identity, timeout = ?self.config.start_timeout, "worker start timed out");
                return Err(RuntimeError::WorkerStartTimeout {
                    plugin: identity.to_string(),
                    timeout: self.config.start_timeout,
                });
            }

            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Spawn every worker registered during preload. Returns how many
    /// started; a worker that cannot be spawned is logged and its slot
    /// recycled.
    pub fn start_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let mut started = 0usize;
        for spec in pending {
            match self.launcher.launch(&spec) {
                Ok(process) => {
                    info!(plugin = %spec.identity, slot = %spec.slot, pid = ?process.id(), "worker spawned");
                    self.workers.push(Worker {
                        spec,
                        process,
                        restarts: 0,
                        stop_requested: false,
                    });
                    started = started.saturating_add(1);
                },
                Err(e) => {
                    error!(plugin = %spec.identity, error = %e, "failed to spawn deferred worker");
                    self.store.release(spec.slot);
                },
            }
        }
        started
    }

    /// Collect exited workers, apply the restart policy, and run restarts
    /// that are due.
    pub fn reap(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let now = Instant::now();

        let mut idx = 0;
        while idx < self.workers.len() {
            let exit = match self.workers[idx].process.try_wait() {
                Ok(Some(exit)) => exit,
                Ok(None) => {
                    idx = idx.saturating_add(1);
                    continue;
                },
                Err(e) => {
                    warn!(plugin = %self.workers[idx].spec.identity, error = %e, "failed to poll worker");
                    idx = idx.saturating_add(1);
                    continue;
                },
            };

            let worker = self.workers.swap_remove(idx);
            self.store.mark_finished(worker.spec.slot, !exit.is_success());

            if !worker.stop_requested && self.config.restart.allows(exit, worker.restarts) {
                let attempt = worker.restarts.saturating_add(1);
                info!(plugin = %worker.spec.identity, %exit, attempt, "worker exited; restart scheduled");
                events.push(WorkerEvent::RestartScheduled {
                    identity: worker.spec.identity.clone(),
                    exit,
                    attempt,
                });
                self.restarts.push(PendingRestart {
                    spec: worker.spec,
                    attempt,
                    due: now.checked_add(self.config.restart_delay).unwrap_or(now),
                });
            } else {
                if exit.is_success() || worker.stop_requested {
                    info!(plugin = %worker.spec.identity, %exit, "worker exited");
                } else {
                    warn!(plugin = %worker.spec.identity, %exit, "worker failed");
                }
                self.store.release(worker.spec.slot);
                events.push(WorkerEvent::Exited {
                    identity: worker.spec.identity,
                    exit,
                });
            }
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.restarts)
            .into_iter()
            .partition(|r| r.due <= now);
        self.restarts = waiting;
        for restart in due {
            events.push(self.restart(restart));
        }

        events
    }

    fn restart(&mut self, restart: PendingRestart) -> WorkerEvent {
        let PendingRestart { spec, attempt, .. } = restart;
        let launched = self
            .store
            .rearm(spec.slot)
            .and_then(|()| self.launcher.launch(&spec));
        match launched {
            Ok(process) => {
                info!(plugin = %spec.identity, attempt, pid = ?process.id(), "worker restarted");
                let identity = spec.identity.clone();
                self.workers.push(Worker {
                    spec,
                    process,
                    restarts: attempt,
                    stop_requested: false,
                });
                WorkerEvent::Restarted { identity, attempt }
            },
            Err(e) => {
                error!(plugin = %spec.identity, error = %e, "worker restart failed");
                self.store.release(spec.slot);
                WorkerEvent::RestartFailed {
                    identity: spec.identity,
                    error: e.to_string(),
                }
            },
        }
    }

    /// Ask the worker running `identity` to stop at its next iteration
    /// boundary. A stopped worker is never restarted. Queued and
    /// restart-pending registrations are dropped and their slots recycled.
    ///
    /// Returns `false` if no such worker is registered.
    pub fn request_stop(&mut self, identity: &PluginIdentity) -> bool {
        if let Some(pos) = self.pending.iter().position(|s| &s.identity == identity) {
            let spec = self.pending.swap_remove(pos);
            self.store.release(spec.slot);
            return true;
        }
        if let Some(pos) = self.restarts.iter().position(|r| &r.spec.identity == identity) {
            let restart = self.restarts.swap_remove(pos);
            self.store.release(restart.spec.slot);
            return true;
        }
        let Some(worker) = self.workers.iter_mut().find(|w| &w.spec.identity == identity) else {
            return false;
        };
        worker.stop_requested = true;
        if let Err(e) = worker.process.terminate() {
            warn!(plugin = %identity, error = %e, "failed to deliver stop request");
        }
        info!(plugin = %identity, "stop requested");
        true
    }

    /// Stop everything: interrupt all workers, wait up to `grace`, then kill
    /// what is left. All slots are recycled. Returns how many workers had to
    /// be killed.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        for spec in self.pending.drain(..) {
            self.store.release(spec.slot);
        }
        for restart in self.restarts.drain(..) {
            self.store.release(restart.spec.slot);
        }
        for worker in &mut self.workers {
            worker.stop_requested = true;
            if let Err(e) = worker.process.terminate() {
                warn!(plugin = %worker.spec.identity, error = %e, "failed to deliver stop request");
            }
        }

        let deadline = Instant::now().checked_add(grace).unwrap_or_else(Instant::now);
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.reap();
            if !self.workers.is_empty() {
                std::thread::sleep(self.config.poll_interval);
            }
        }

        let mut killed = 0usize;
        for mut worker in self.workers.drain(..) {
            warn!(plugin = %worker.spec.identity, "worker ignored stop request; killing");
            if let Err(e) = worker.process.kill() {
                error!(plugin = %worker.spec.identity, error = %e, "failed to kill worker");
            }
            self.store.release(worker.spec.slot);
            killed = killed.saturating_add(1);
        }
        killed
    }

    /// No workers running, queued, or waiting to restart.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.registered() == 0
    }

    /// Number of spawned workers not yet reaped.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of preload registrations waiting for boot to finish.
    #[must_use]
    pub fn pending_workers(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .field("workers", &self.workers.len())
            .field("restarts", &self.restarts.len())
            .finish_non_exhaustive()
    }
}
