//! The fixed-layout configuration record handed to `plugin_work`.

use std::borrow::Cow;
use std::fmt;

use crate::error::{AbiError, AbiResult};

/// Capacity of the name and path fields, terminator included.
pub const MAX_NAME_SIZE: usize = 256;

/// Capacity of the custom configuration field, terminator included.
pub const MAX_CONFIG_SIZE: usize = 4096;

/// Process identifier as stored in the record (`pid_t`).
pub type Pid = i32;

/// Configuration passed to a plugin's work entry point.
///
/// Every text field is a NUL-terminated byte array. The layout is `repr(C)`
/// so a record can be placed in shared memory and read by a worker process
/// that maps the same region.
#[repr(C)]
#[derive(Clone)]
pub struct ConfigRecord {
    plugin_name: [u8; MAX_NAME_SIZE],
    plugin_path: [u8; MAX_NAME_SIZE],
    custom_config: [u8; MAX_CONFIG_SIZE],
    owner_pid: Pid,
}

impl ConfigRecord {
    /// An all-zero record. Its path is empty, so [`is_empty`](Self::is_empty) holds.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            plugin_name: [0; MAX_NAME_SIZE],
            plugin_path: [0; MAX_NAME_SIZE],
            custom_config: [0; MAX_CONFIG_SIZE],
            owner_pid: 0,
        }
    }

    /// Build a record, rejecting values that would not fit with their terminator.
    ///
    /// # Errors
    ///
    /// [`AbiError::FieldTooLong`] when a value needs more bytes than its field
    /// holds, [`AbiError::InteriorNul`] when a value embeds a NUL byte.
    pub fn new(name: &str, path: &str, custom_config: &str, owner_pid: Pid) -> AbiResult<Self> {
        let mut record = Self::empty();
        write_field(&mut record.plugin_name, "plugin_name", name)?;
        write_field(&mut record.plugin_path, "plugin_path", path)?;
        write_field(&mut record.custom_config, "custom_config", custom_config)?;
        record.owner_pid = owner_pid;
        Ok(record)
    }

    /// Plugin file name.
    #[must_use]
    pub fn plugin_name(&self) -> Cow<'_, str> {
        read_field(&self.plugin_name)
    }

    /// Full path of the plugin library.
    #[must_use]
    pub fn plugin_path(&self) -> Cow<'_, str> {
        read_field(&self.plugin_path)
    }

    /// Opaque operator-supplied configuration text.
    #[must_use]
    pub fn custom_config(&self) -> Cow<'_, str> {
        read_field(&self.custom_config)
    }

    /// Process id of the host that wrote the record.
    #[must_use]
    pub const fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    /// A record with no plugin path carries nothing a worker can run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugin_path[0] == 0
    }
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ConfigRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigRecord")
            .field("plugin_name", &self.plugin_name())
            .field("plugin_path", &self.plugin_path())
            .field("custom_config", &self.custom_config())
            .field("owner_pid", &self.owner_pid)
            .finish()
    }
}

impl PartialEq for ConfigRecord {
    fn eq(&self, other: &Self) -> bool {
        self.owner_pid == other.owner_pid
            && self.plugin_name() == other.plugin_name()
            && self.plugin_path() == other.plugin_path()
            && self.custom_config() == other.custom_config()
    }
}

impl Eq for ConfigRecord {}

fn write_field<const N: usize>(
    dst: &mut [u8; N],
    field: &'static str,
    value: &str,
) -> AbiResult<()> {
    let bytes = value.as_bytes();
    if bytes.contains(&0) {
        return Err(AbiError::InteriorNul { field });
    }
    // One byte is reserved for the terminator.
    if bytes.len() >= N {
        return Err(AbiError::FieldTooLong {
            field,
            capacity: N,
            len: bytes.len(),
        });
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_field(src: &[u8]) -> Cow<'_, str> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end])
}
