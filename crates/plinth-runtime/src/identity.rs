//! Identity of a loaded plugin instance.

use std::fmt;
use std::path::{Path, PathBuf};

/// Key a plugin instance is tracked under: its file name and full path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginIdentity {
    name: String,
    path: PathBuf,
}

impl PluginIdentity {
    /// Identity of the library at `path`. The name is the file name.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            name,
            path: path.to_path_buf(),
        }
    }

    /// Plugin file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full library path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
