//! Worker process entry (`plinth worker`).

use plinth_runtime::{SlotId, worker_main};
use plinth_telemetry::{LogConfig, LogFormat, setup_logging};

/// Set up logging as the host asked, then run the plugin in `slot`.
/// Returns the process exit status.
pub(crate) fn run_worker(store: &str, slot: u32, log_level: &str, log_format: &str) -> i32 {
    let format = log_format.parse().unwrap_or(LogFormat::Compact);
    if let Err(e) = setup_logging(&LogConfig::new(log_level).with_format(format)) {
        eprintln!("Failed to initialize logging: {e}");
    }
    worker_main(store, SlotId::new(slot))
}
