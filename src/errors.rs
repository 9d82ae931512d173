/// Error types for the profiler front-end.
///
/// Configuration problems are reported once, as a single stderr line, and the
/// process exits with code 1; everything transient inside analysis callbacks
/// (unresolved routine, untracked address) is silently ignored and never
/// becomes an error value.

use std::io;
use thiserror::Error;

/// Rejected knob values. Raised once, at profiler construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("affinity distance must be a power of two")]
    AffinityDistanceNotPowerOfTwo(i32),

    #[error("affinity distance must be at least {min} bytes")]
    AffinityDistanceTooSmall { value: i32, min: i32 },
}

/// Failures while replaying a recorded event trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: unknown event '{event}'")]
    UnknownEvent { line: usize, event: String },

    #[error("line {line}: malformed operand for '{event}'")]
    BadOperand { line: usize, event: String },

    #[error("line {line}: no routine covers address {addr:#x}")]
    UnknownRoutine { line: usize, addr: u64 },

    #[error("line {line}: '{name}' is not an intercepted allocation routine")]
    UnknownAllocFn { line: usize, name: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
