//! ABI error types.
//!
//! Hand-written `Display`/`Error` impls: this crate stays dependency-free.

use std::ffi::c_int;
use std::fmt;

/// Errors raised while building or interpreting ABI values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    /// A value does not fit its fixed-size record field (terminator included).
    FieldTooLong {
        /// Record field name.
        field: &'static str,
        /// Field capacity in bytes, including the NUL terminator.
        capacity: usize,
        /// Length of the rejected value in bytes.
        len: usize,
    },
    /// A value contains an interior NUL byte and would be silently truncated.
    InteriorNul {
        /// Record field name.
        field: &'static str,
    },
    /// `plugin_get_type` returned something other than INLINE or BACKGROUND.
    UnknownPluginKind(c_int),
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldTooLong {
                field,
                capacity,
                len,
            } => write!(
                f,
                "{field} is {len} bytes, exceeding the {capacity} byte field (terminator included)"
            ),
            Self::InteriorNul { field } => write!(f, "{field} contains an interior NUL byte"),
            Self::UnknownPluginKind(raw) => {
                write!(f, "unknown plugin type {raw}; expected 0 (INLINE) or 1 (BACKGROUND)")
            },
        }
    }
}

impl std::error::Error for AbiError {}

/// Result type for ABI operations.
pub type AbiResult<T> = Result<T, AbiError>;
