//! Plinth Test - shared helpers for integration tests.
//!
//! Builds the `test-plugin-native` fixture, lays out plugin directories, and
//! drives a [`PluginHost`] until its workers are done. In-process fakes live
//! in `plinth_runtime::testing`, re-exported here.
//!
//! ```rust,ignore
//! use plinth_test::{Fixture, PluginDir};
//!
//! let dir = PluginDir::new();
//! dir.install(Fixture::Background, "ticker.so");
//! dir.touch("README.txt");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use plinth_runtime::{PluginHost, WorkerEvent};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub use plinth_runtime::testing::*;

/// A build variant of the native fixture plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fixture {
    /// INLINE plugin; writes `<name>.inline` then `<name>.cleanup`.
    Inline,
    /// BACKGROUND plugin; stops after `work_limit` calls, writes
    /// `<name>.seen` and `<name>.count`.
    Background,
    /// Exports only `plugin_init` and `plugin_cleanup`.
    Partial,
    /// `plugin_init` returns 7.
    Reject,
}

impl Fixture {
    const ALL: [Self; 4] = [Self::Inline, Self::Background, Self::Partial, Self::Reject];

    /// Cargo feature selecting this variant.
    #[must_use]
    pub fn feature(self) -> &'static str {
        match self {
            Self::Inline => "kind-inline",
            Self::Background => "kind-background",
            Self::Partial => "partial",
            Self::Reject => "reject",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Inline => 0,
            Self::Background => 1,
            Self::Partial => 2,
            Self::Reject => 3,
        }
    }
}

static BUILT: [OnceLock<PathBuf>; 4] = [
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
];

fn fixture_crate_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|crates| crates.join("test-plugin-native"))
        .unwrap_or_else(|| PathBuf::from("crates/test-plugin-native"))
}

/// Build `variant` of the fixture plugin, at most once per test process,
/// and return the path of the built library.
///
/// # Panics
///
/// Panics if cargo cannot be run or the build fails.
#[must_use]
pub fn native_fixture(variant: Fixture) -> PathBuf {
    BUILT[variant.index()]
        .get_or_init(|| {
            let crate_dir = fixture_crate_dir();
            let target_dir = crate_dir.join("target").join(variant.feature());
            let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

            let status = Command::new(cargo)
                .env_remove("RUSTFLAGS")
                .env_remove("CARGO_ENCODED_RUSTFLAGS")
                .args(["build", "--quiet", "--features", variant.feature()])
                .arg("--target-dir")
                .arg(&target_dir)
                .current_dir(&crate_dir)
                .status()
                .expect("failed to invoke cargo for test-plugin-native");
            assert!(status.success(), "failed to build test-plugin-native ({variant:?})");

            let artifact = target_dir.join("debug").join(format!(
                "{}test_plugin_native.{}",
                std::env::consts::DLL_PREFIX,
                std::env::consts::DLL_EXTENSION
            ));
            assert!(artifact.exists(), "fixture not found at {}", artifact.display());
            artifact
        })
        .clone()
}

/// Build every fixture variant.
pub fn build_all_fixtures() {
    for variant in Fixture::ALL {
        let _ = native_fixture(variant);
    }
}

/// A scratch plugin directory that is removed on drop.
#[derive(Debug)]
pub struct PluginDir {
    dir: TempDir,
}

impl PluginDir {
    /// A fresh, empty directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create plugin directory"),
        }
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy a fixture variant in under `file_name`.
    ///
    /// # Panics
    ///
    /// Panics if the fixture cannot be built or copied.
    pub fn install(&self, variant: Fixture, file_name: &str) -> PathBuf {
        let dest = self.dir.path().join(file_name);
        std::fs::copy(native_fixture(variant), &dest).expect("failed to copy fixture");
        dest
    }

    /// Create an empty file, e.g. a non-library entry.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn touch(&self, file_name: &str) -> PathBuf {
        let dest = self.dir.path().join(file_name);
        std::fs::write(&dest, b"").expect("failed to write file");
        dest
    }
}

impl Default for PluginDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom config pointing fixture output at `out_dir`.
#[must_use]
pub fn fixture_config(out_dir: &Path, work_limit: u32) -> String {
    format!(
        r#"{{"out_dir": "{}", "work_limit": {work_limit}}}"#,
        out_dir.display()
    )
}

/// Reap `host` until nothing is left to supervise. Returns every event seen.
///
/// # Panics
///
/// Panics if the host is still busy after `timeout`.
pub fn drive_until_idle(host: &mut PluginHost, timeout: Duration) -> Vec<WorkerEvent> {
    let deadline = Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(Instant::now);
    let mut events = Vec::new();
    while !host.is_idle() {
        assert!(Instant::now() < deadline, "host still busy after {timeout:?}");
        events.extend(host.reap());
        std::thread::sleep(Duration::from_millis(10));
    }
    tracing::debug!(events = events.len(), "host idle");
    events
}

/// Wait for `path` to exist and return its contents.
///
/// # Panics
///
/// Panics if the file does not appear within `timeout`.
#[must_use]
pub fn wait_for_file(path: &Path, timeout: Duration) -> String {
    let deadline = Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(Instant::now);
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            return contents;
        }
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Set up test logging with the given filter.
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}
