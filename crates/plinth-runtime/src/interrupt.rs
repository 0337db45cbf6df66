//! Host-level interrupt delivery inside a worker process.
//!
//! The host stops a worker with SIGTERM (SIGINT from a terminal works too).
//! The handler only sets a flag; [`WorkLoop`](crate::WorkLoop) reads it
//! between iterations.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::work_loop::Interrupt;

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination(_signal: c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::Release);
}

/// Interrupt raised by SIGTERM or SIGINT once
/// [`install_termination_handler`] has run.
#[derive(Debug, Clone, Copy)]
pub struct SignalInterrupt {
    _installed: (),
}

impl Interrupt for SignalInterrupt {
    fn is_raised(&self) -> bool {
        TERMINATION_REQUESTED.load(Ordering::Acquire)
    }
}

/// Clear any signal mask inherited from the host.
///
/// # Errors
///
/// Returns [`RuntimeError::Io`] if `sigprocmask` fails.
pub fn unblock_inherited_signals() -> RuntimeResult<()> {
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&SigSet::all()), None)
        .map_err(|e| RuntimeError::Io(e.into()))?;
    debug!("inherited signal mask cleared");
    Ok(())
}

/// Route SIGTERM and SIGINT to the interrupt flag.
///
/// # Errors
///
/// Returns [`RuntimeError::Io`] if a handler cannot be installed.
pub fn install_termination_handler() -> RuntimeResult<SignalInterrupt> {
    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        unsafe { sigaction(signal, &action) }.map_err(|e| RuntimeError::Io(e.into()))?;
    }
    Ok(SignalInterrupt { _installed: () })
}
