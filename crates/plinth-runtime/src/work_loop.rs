//! Driving `plugin_work`.
//!
//! ```text
//! READY -> RUNNING -> DONE
//!                  -> STOPPING -> DONE
//!                  -> FAILED
//! ```
//!
//! INLINE plugins get exactly one call followed by cleanup. BACKGROUND
//! plugins are called until they return nonzero or an interrupt is raised;
//! the interrupt is only looked at between calls.

use std::ffi::c_int;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use plinth_abi::ConfigRecord;
use tracing::{debug, error, info, trace};

/// Something that can be called as `plugin_work`.
pub trait WorkEntry {
    /// Run one iteration.
    fn call(&mut self, record: &ConfigRecord) -> c_int;
}

impl<F> WorkEntry for F
where
    F: FnMut(&ConfigRecord) -> c_int,
{
    fn call(&mut self, record: &ConfigRecord) -> c_int {
        self(record)
    }
}

/// Host-delivered cancellation, checked between iterations.
pub trait Interrupt {
    /// Whether the loop should stop before its next call.
    fn is_raised(&self) -> bool;
}

impl Interrupt for AtomicBool {
    fn is_raised(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: Interrupt + ?Sized> Interrupt for Arc<T> {
    fn is_raised(&self) -> bool {
        (**self).is_raised()
    }
}

/// An interrupt that is never raised.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInterrupt;

impl Interrupt for NeverInterrupt {
    fn is_raised(&self) -> bool {
        false
    }
}

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not started.
    Ready,
    /// Calling `plugin_work`.
    Running,
    /// Interrupt seen; no further calls.
    Stopping,
    /// Finished normally.
    Done,
    /// `plugin_work` panicked.
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last call returned this value. For INLINE plugins this is the
    /// single call's return value.
    Completed(c_int),
    /// The interrupt was raised between iterations.
    Interrupted,
    /// The work entry panicked.
    Panicked,
}

/// Result of a finished loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Terminal state: `Done` or `Failed`.
    pub state: LoopState,
    /// Number of `plugin_work` calls made.
    pub iterations: u64,
    /// Why the loop ended.
    pub reason: StopReason,
}

impl LoopOutcome {
    /// Whether the loop ended in `Done`.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == LoopState::Done
    }
}

/// Executes one plugin instance against its configuration record.
#[derive(Debug)]
pub struct WorkLoop<'a> {
    record: &'a ConfigRecord,
    state: LoopState,
    iterations: u64,
}

impl<'a> WorkLoop<'a> {
    /// A loop in `Ready` over `record`.
    #[must_use]
    pub fn new(record: &'a ConfigRecord) -> Self {
        Self {
            record,
            state: LoopState::Ready,
            iterations: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, next: LoopState) {
        trace!(
            plugin = %self.record.plugin_name(),
            from = %self.state,
            to = %next,
            "work loop transition"
        );
        self.state = next;
    }

    fn finish(&mut self, state: LoopState, reason: StopReason) -> LoopOutcome {
        self.transition(state);
        LoopOutcome {
            state,
            iterations: self.iterations,
            reason,
        }
    }

    /// INLINE execution: one call, then `cleanup`.
    ///
    /// The return value is logged and otherwise ignored. A panic is not
    /// caught here; inline plugins share the caller's thread.
    pub fn run_inline<W, C>(mut self, mut work: W, cleanup: C) -> LoopOutcome
    where
        W: WorkEntry,
        C: FnOnce(),
    {
        self.transition(LoopState::Running);
        let code = work.call(self.record);
        self.iterations = 1;
        debug!(plugin = %self.record.plugin_name(), code, "inline work returned");
        cleanup();
        self.finish(LoopState::Done, StopReason::Completed(code))
    }

    /// BACKGROUND execution: call until nonzero or interrupted.
    ///
    /// A Rust panic inside `work` ends the loop in `Failed`. That only covers
    /// Rust work entries such as in-process doubles: a fault inside plugin
    /// code reached through an `extern "C"` pointer cannot unwind and takes
    /// down the whole worker process. The worker process is the fault
    /// boundary; the supervisor sees the crash as a signal exit.
    pub fn run_background<W>(mut self, mut work: W, interrupt: &dyn Interrupt) -> LoopOutcome
    where
        W: WorkEntry,
    {
        let plugin = self.record.plugin_name().into_owned();
        self.transition(LoopState::Running);

        loop {
            if interrupt.is_raised() {
                self.transition(LoopState::Stopping);
                info!(plugin, iterations = self.iterations, "interrupted between iterations");
                return self.finish(LoopState::Done, StopReason::Interrupted);
            }

            let record = self.record;
            let result = catch_unwind(AssertUnwindSafe(|| work.call(record)));
            self.iterations = self.iterations.saturating_add(1);

            match result {
                Ok(0) => {},
                Ok(code) => {
                    info!(plugin, code, iterations = self.iterations, "plugin requested stop");
                    return self.finish(LoopState::Done, StopReason::Completed(code));
                },
                Err(_) => {
                    error!(plugin, iterations = self.iterations, "plugin work panicked");
                    return self.finish(LoopState::Failed, StopReason::Panicked);
                },
            }
        }
    }
}
