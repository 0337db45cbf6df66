//! Rust-side plugin authoring helpers.

use std::ffi::c_int;

use crate::kind::PluginKind;
use crate::record::ConfigRecord;

/// Outcome of one `work` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Run another iteration (BACKGROUND only).
    Continue,
    /// Stop with the given code. A zero code is reported as 1, because zero
    /// means "continue" on the wire.
    Stop(c_int),
}

impl WorkStatus {
    /// Wire value returned from `plugin_work`.
    #[must_use]
    pub const fn into_code(self) -> c_int {
        match self {
            Self::Continue => 0,
            Self::Stop(0) => 1,
            Self::Stop(code) => code,
        }
    }
}

/// A native plugin implemented in Rust.
///
/// Exported through [`plinth_plugin!`](crate::plinth_plugin). A BACKGROUND
/// plugin runs in a freshly started worker process that never called
/// `plugin_init`, so the generated `plugin_work` initialises the instance on
/// first use.
pub trait Plugin: Send + Sized + 'static {
    /// Execution model reported by `plugin_get_type`.
    const KIND: PluginKind;

    /// Admission check. `Err(code)` rejects the plugin; a zero code is
    /// reported as -1.
    ///
    /// # Errors
    ///
    /// Any code the plugin wants the host to log as its rejection reason.
    fn init() -> Result<Self, c_int>;

    /// One unit of work. The record is `None` only if the host passed a null
    /// pointer.
    fn work(&mut self, record: Option<&ConfigRecord>) -> WorkStatus;

    /// Release resources.
    fn cleanup(self) {}
}

#[doc(hidden)]
pub mod __private {
    use std::ffi::c_int;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::Plugin;
    use crate::record::ConfigRecord;

    /// Code returned when a plugin panics inside an entry point.
    pub const PANIC_CODE: c_int = -2;

    pub fn init<P: Plugin>(slot: &mut Option<P>) -> c_int {
        if slot.is_some() {
            return 0;
        }
        match catch_unwind(P::init) {
            Ok(Ok(plugin)) => {
                *slot = Some(plugin);
                0
            },
            Ok(Err(0)) => -1,
            Ok(Err(code)) => code,
            Err(_) => PANIC_CODE,
        }
    }

    #[must_use]
    pub fn get_type<P: Plugin>() -> c_int {
        P::KIND.as_raw()
    }

    /// # Safety
    ///
    /// `record` must be null or point to a valid `ConfigRecord` for the
    /// duration of the call.
    #[allow(unsafe_code)]
    pub unsafe fn work<P: Plugin>(slot: &mut Option<P>, record: *const ConfigRecord) -> c_int {
        let rc = init(slot);
        if rc != 0 {
            return rc;
        }
        // SAFETY: guaranteed by the caller.
        let record = unsafe { record.as_ref() };
        let Some(plugin) = slot.as_mut() else {
            return -1;
        };
        match catch_unwind(AssertUnwindSafe(|| plugin.work(record))) {
            Ok(status) => status.into_code(),
            Err(_) => PANIC_CODE,
        }
    }

    pub fn cleanup<P: Plugin>(slot: &mut Option<P>) {
        if let Some(plugin) = slot.take() {
            let _ = catch_unwind(AssertUnwindSafe(|| plugin.cleanup()));
        }
    }
}

/// Export the four plugin entry points for a [`Plugin`] implementation.
///
/// The instance lives in a process-global mutex; a poisoned lock is
/// recovered rather than propagated across the C boundary.
#[macro_export]
macro_rules! plinth_plugin {
    ($ty:ty) => {
        static __PLINTH_INSTANCE: ::std::sync::Mutex<::std::option::Option<$ty>> =
            ::std::sync::Mutex::new(::std::option::Option::None);

        fn __plinth_instance() -> ::std::sync::MutexGuard<'static, ::std::option::Option<$ty>> {
            __PLINTH_INSTANCE
                .lock()
                .unwrap_or_else(::std::sync::PoisonError::into_inner)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn plugin_init() -> ::std::ffi::c_int {
            $crate::__private::init::<$ty>(&mut __plinth_instance())
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn plugin_get_type() -> ::std::ffi::c_int {
            $crate::__private::get_type::<$ty>()
        }

        /// # Safety
        ///
        /// `record` must be null or point to a valid record.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn plugin_work(
            record: *const $crate::ConfigRecord,
        ) -> ::std::ffi::c_int {
            // SAFETY: the host passes a pointer to a live record.
            unsafe { $crate::__private::work::<$ty>(&mut __plinth_instance(), record) }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn plugin_cleanup() {
            $crate::__private::cleanup::<$ty>(&mut __plinth_instance());
        }
    };
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::__private;
    use super::*;

    struct Counter {
        calls: u32,
        limit: u32,
    }

    impl Plugin for Counter {
        const KIND: PluginKind = PluginKind::Background;

        fn init() -> Result<Self, c_int> {
            Ok(Self { calls: 0, limit: 3 })
        }

        fn work(&mut self, record: Option<&ConfigRecord>) -> WorkStatus {
            assert!(record.is_some());
            self.calls += 1;
            if self.calls >= self.limit {
                WorkStatus::Stop(0)
            } else {
                WorkStatus::Continue
            }
        }
    }

    struct Refuses;

    impl Plugin for Refuses {
        const KIND: PluginKind = PluginKind::Inline;

        fn init() -> Result<Self, c_int> {
            Err(0)
        }

        fn work(&mut self, _record: Option<&ConfigRecord>) -> WorkStatus {
            WorkStatus::Stop(1)
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(WorkStatus::Continue.into_code(), 0);
        assert_eq!(WorkStatus::Stop(0).into_code(), 1);
        assert_eq!(WorkStatus::Stop(-5).into_code(), -5);
    }

    #[test]
    fn test_work_initialises_lazily() {
        let mut slot: Option<Counter> = None;
        let record = ConfigRecord::new("c.so", "/c.so", "", 1).unwrap();
        let codes: Vec<c_int> = (0..3)
            .map(|_| unsafe { __private::work(&mut slot, &raw const record) })
            .collect();
        assert_eq!(codes, vec![0, 0, 1]);
        assert_eq!(slot.as_ref().map(|c| c.calls), Some(3));

        __private::cleanup(&mut slot);
        assert!(slot.is_none());
    }

    #[test]
    fn test_rejected_init_maps_zero_to_negative() {
        let mut slot: Option<Refuses> = None;
        assert_eq!(__private::init(&mut slot), -1);
        assert!(slot.is_none());
        assert_eq!(__private::get_type::<Refuses>(), 0);
    }
}
