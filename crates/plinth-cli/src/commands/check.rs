//! ABI conformance report (`plinth check`).
//!
//! Opens each candidate library and resolves the four entry points. Nothing
//! in the library is called.

use std::path::Path;

use anyhow::{Result, bail};
use colored::Colorize;
use plinth_runtime::{DynamicLibraryOpener, LibraryOpener, candidates};

/// Check every candidate in `dir`. Fails if any library cannot be opened or
/// lacks an entry point.
pub(crate) fn run_check(dir: &Path) -> Result<()> {
    println!(
        "{}",
        format!("Checking plugins in {}", dir.display()).cyan().bold()
    );

    let opener = DynamicLibraryOpener;
    let mut failures = 0usize;
    let found = candidates(dir)?;

    for path in &found {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        match opener.open(path) {
            Ok(library) => {
                let missing = library.symbols().missing();
                if missing.is_empty() {
                    println!("  {} {name}", "OK".green());
                } else {
                    failures = failures.saturating_add(1);
                    println!(
                        "  {} {name} - missing {}",
                        "FAIL".red(),
                        missing.join(", ").dimmed()
                    );
                }
            },
            Err(e) => {
                failures = failures.saturating_add(1);
                println!("  {} {name} - {}", "FAIL".red(), e.to_string().dimmed());
            },
        }
    }

    println!();
    if found.is_empty() {
        println!("{}", "No plugin libraries found.".yellow());
    } else if failures == 0 {
        println!("{}", format!("All {} plugin(s) conform.", found.len()).green());
    }

    if failures > 0 {
        bail!("{failures} of {} plugin(s) failed the check", found.len());
    }
    Ok(())
}
