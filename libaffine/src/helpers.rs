/// Diagnostic macros shared across the runtime.
///
/// The allocation path can be entered before the process is fully set up and
/// from inside libc itself, so diagnostics write straight to stderr and the
/// only failure response is to terminate: nothing here is recoverable.

/// Print one line to stderr and terminate with exit code 1.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        std::process::exit(1);
    }};
}

/// Allocation-path tracing, compiled out unless the `debug-log` feature is
/// enabled.
macro_rules! debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "debug-log")]
        eprintln!($($arg)*);
    }};
}
