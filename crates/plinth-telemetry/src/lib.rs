//! Plinth Telemetry - logging setup shared by the host and its workers.
//!
//! # Example
//!
//! ```rust,no_run
//! use plinth_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), plinth_telemetry::TelemetryError> {
//! let handle = setup_logging(
//!     &LogConfig::new("info")
//!         .with_format(LogFormat::Compact)
//!         .with_directive("plinth_runtime=debug"),
//! )?;
//!
//! tracing::info!("host starting");
//!
//! // Later, on reload:
//! handle.set_level("debug")?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogHandle, LogTarget,
    setup_default_logging, setup_logging,
};
