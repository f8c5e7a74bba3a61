//! HLE Kernel Macros
//!
//! Debug output and fatal-error macros used throughout the memory manager.
//! Output goes through the `log` facade, so the embedding emulator decides
//! where (and whether) messages end up. Levels compile down to a single
//! `log::log!` call.

#[doc(hidden)]
pub use log as __log;

/// Debug output levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DebugLevel {
    /// Error messages - always shown
    Error = 0,
    /// Warning messages
    Warning = 1,
    /// Information messages
    Info = 2,
    /// Debug messages
    Debug = 3,
    /// Trace messages - most verbose
    Trace = 4,
}

impl From<DebugLevel> for log::Level {
    fn from(level: DebugLevel) -> Self {
        match level {
            DebugLevel::Error => Self::Error,
            DebugLevel::Warning => Self::Warn,
            DebugLevel::Info => Self::Info,
            DebugLevel::Debug => Self::Debug,
            DebugLevel::Trace => Self::Trace,
        }
    }
}

/// Print a message at the given level (`ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE`)
#[macro_export]
macro_rules! debug_print {
    (ERROR, $($arg:tt)*) => {
        $crate::debug_print!(@level $crate::macros::DebugLevel::Error, $($arg)*)
    };
    (WARN, $($arg:tt)*) => {
        $crate::debug_print!(@level $crate::macros::DebugLevel::Warning, $($arg)*)
    };
    (INFO, $($arg:tt)*) => {
        $crate::debug_print!(@level $crate::macros::DebugLevel::Info, $($arg)*)
    };
    (DEBUG, $($arg:tt)*) => {
        $crate::debug_print!(@level $crate::macros::DebugLevel::Debug, $($arg)*)
    };
    (TRACE, $($arg:tt)*) => {
        $crate::debug_print!(@level $crate::macros::DebugLevel::Trace, $($arg)*)
    };
    (@level $level:expr, $($arg:tt)*) => {
        $crate::macros::__log::log!(
            target: "hle_kernel",
            ::core::convert::Into::<$crate::macros::__log::Level>::into($level),
            $($arg)*
        )
    };
}

/// Abort on an internal consistency violation.
///
/// Used only for conditions a guest cannot trigger: ref-count wraparound,
/// a broken block partition, or a host mapping that cannot be reverted.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::debug_print!(ERROR, $($arg)*);
        panic!($($arg)*)
    }};
}
