//! Feature-gated stderr diagnostics.
//!
//! When the matching feature is off the message is still type-checked but
//! never formatted, so call sites do not grow unused-variable warnings.

macro_rules! nwarn {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_warn") {
            eprintln!("[WARN]  {}", format_args!($($arg)*));
        }
    };
}

macro_rules! ntrace {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_trace") {
            eprintln!("[TRACE] {}", format_args!($($arg)*));
        }
    };
}

pub(crate) use ntrace;
pub(crate) use nwarn;
