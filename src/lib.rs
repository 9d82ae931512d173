/// Affine profiler library
///
/// Module layout:
///   - host         — instrumentation-host interface (symbols, events, types)
///   - shadow_stack — call-chain reconstruction from branch/return events
///   - alloc_tracer — heap-routine interception, allocation + context tables
///   - access_tracer— affinity queue and context-affinity edge accumulation
///   - report       — context ranking and Trivial Graph Format output
///   - profiler     — composition of the above behind the callback surface
///   - replay       — line-oriented event-trace host implementation
///   - errors       — configuration and trace-input error types

pub mod access_tracer;
pub mod alloc_tracer;
pub mod errors;
pub mod host;
pub mod profiler;
pub mod replay;
pub mod report;
pub mod shadow_stack;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use access_tracer::{AccessTracer, MIN_ACCESS_SIZE};
pub use alloc_tracer::{AllocTracer, AllocationRecord, Context, ContextId, ObjectId};
pub use errors::{ConfigError, TraceError};
pub use host::{AccessKind, Addr, AllocFn, ContextChange, RoutineId, SymbolSource};
pub use profiler::{Profiler, ProfilerConfig};
pub use replay::ReplayHost;
pub use shadow_stack::{CallSite, Chain, ShadowStack};
