//! Plinth ABI - the binary contract between the host and native plugins.
//!
//! A plugin is a shared library exporting four C entry points:
//!
//! ```c
//! int  plugin_init(void);                          // 0 = admit, nonzero = reject
//! int  plugin_get_type(void);                      // 0 = INLINE, 1 = BACKGROUND
//! int  plugin_work(const ConfigRecord *record);    // BACKGROUND: 0 = continue
//! void plugin_cleanup(void);
//! ```
//!
//! The host passes each plugin a [`ConfigRecord`]: fixed-size, NUL-terminated
//! byte fields that can live in shared memory and cross a process boundary.
//!
//! Plugins written in Rust can implement [`Plugin`] and call
//! [`plinth_plugin!`] instead of writing the exports by hand:
//!
//! ```rust,ignore
//! use plinth_abi::{ConfigRecord, Plugin, PluginKind, WorkStatus, plinth_plugin};
//!
//! struct Ticker { calls: u32 }
//!
//! impl Plugin for Ticker {
//!     const KIND: PluginKind = PluginKind::Background;
//!
//!     fn init() -> Result<Self, i32> {
//!         Ok(Self { calls: 0 })
//!     }
//!
//!     fn work(&mut self, _record: Option<&ConfigRecord>) -> WorkStatus {
//!         self.calls += 1;
//!         if self.calls >= 3 { WorkStatus::Stop(1) } else { WorkStatus::Continue }
//!     }
//! }
//!
//! plinth_plugin!(Ticker);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod kind;
mod record;
mod sdk;

use std::ffi::c_int;

pub use error::{AbiError, AbiResult};
pub use kind::PluginKind;
pub use record::{ConfigRecord, MAX_CONFIG_SIZE, MAX_NAME_SIZE, Pid};
pub use sdk::{Plugin, WorkStatus};

#[doc(hidden)]
pub use sdk::__private;

/// Exported name of the admission entry point.
pub const INIT_SYMBOL: &str = "plugin_init";
/// Exported name of the execution-model query.
pub const GET_TYPE_SYMBOL: &str = "plugin_get_type";
/// Exported name of the work entry point.
pub const WORK_SYMBOL: &str = "plugin_work";
/// Exported name of the teardown entry point.
pub const CLEANUP_SYMBOL: &str = "plugin_cleanup";

/// All required entry points, in resolution order.
pub const REQUIRED_SYMBOLS: [&str; 4] = [INIT_SYMBOL, GET_TYPE_SYMBOL, WORK_SYMBOL, CLEANUP_SYMBOL];

/// `int plugin_init(void)`
pub type InitFn = unsafe extern "C" fn() -> c_int;

/// `int plugin_get_type(void)`
///
/// Declared as a plain `int` rather than an enum so that an out-of-range
/// value is observable instead of undefined behaviour.
pub type GetTypeFn = unsafe extern "C" fn() -> c_int;

/// `int plugin_work(const ConfigRecord *record)`
pub type WorkFn = unsafe extern "C" fn(*const ConfigRecord) -> c_int;

/// `void plugin_cleanup(void)`
pub type CleanupFn = unsafe extern "C" fn();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_names() {
        assert_eq!(REQUIRED_SYMBOLS.len(), 4);
        assert!(REQUIRED_SYMBOLS.iter().all(|s| s.starts_with("plugin_")));
        assert!(REQUIRED_SYMBOLS.iter().all(|s| !s.contains('\0')));
    }
}
