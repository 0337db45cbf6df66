use std::ffi::c_int;
use std::fmt;

use crate::error::AbiError;

/// Execution model declared by a plugin through `plugin_get_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PluginKind {
    /// Runs once, synchronously, inside the loading process.
    Inline = 0,
    /// Runs repeatedly in its own worker process until it asks to stop.
    Background = 1,
}

impl PluginKind {
    /// Raw value returned across the ABI.
    #[must_use]
    pub const fn as_raw(self) -> c_int {
        self as c_int
    }

    /// Interpret a raw `plugin_get_type` result.
    ///
    /// # Errors
    ///
    /// Returns [`AbiError::UnknownPluginKind`] for anything but 0 or 1.
    pub const fn from_raw(raw: c_int) -> Result<Self, AbiError> {
        match raw {
            0 => Ok(Self::Inline),
            1 => Ok(Self::Background),
            other => Err(AbiError::UnknownPluginKind(other)),
        }
    }
}

impl TryFrom<c_int> for PluginKind {
    type Error = AbiError;

    fn try_from(raw: c_int) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("INLINE"),
            Self::Background => f.write_str("BACKGROUND"),
        }
    }
}
