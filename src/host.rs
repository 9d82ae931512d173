/// Instrumentation-host interface
///
/// The profiler core never talks to a binary-instrumentation engine directly.
/// Everything it needs from one — symbol lookup, routine identity, image
/// queries, a guest-memory peek — is expressed through the `SymbolSource`
/// trait, and every dynamic event it consumes is a plain method call on
/// `Profiler`. A host drives the tool by resolving instrumentation-time
/// decisions (which instructions to hook, stub classification) on its side and
/// dispatching the resulting events in program order.

/// Guest address. Addresses are plain integers on this side of the fence;
/// nothing in the profiler ever dereferences one.
pub type Addr = u64;

/// Opaque routine handle minted by the host's symbol machinery. Two handles
/// compare equal iff they denote the same routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineId(pub u32);

/// The heap routines intercepted at function granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFn {
    Malloc,
    Calloc,
    PosixMemalign,
    AlignedAlloc,
    Realloc,
    Free,
}

impl AllocFn {
    pub const ALL: [AllocFn; 6] = [
        AllocFn::Malloc,
        AllocFn::Calloc,
        AllocFn::PosixMemalign,
        AllocFn::AlignedAlloc,
        AllocFn::Realloc,
        AllocFn::Free,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AllocFn::Malloc => "malloc",
            AllocFn::Calloc => "calloc",
            AllocFn::PosixMemalign => "posix_memalign",
            AllocFn::AlignedAlloc => "aligned_alloc",
            AllocFn::Realloc => "realloc",
            AllocFn::Free => "free",
        }
    }

    pub fn from_name(name: &str) -> Option<AllocFn> {
        AllocFn::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Number of entry-point arguments the host must capture for this routine.
    pub fn param_count(self) -> usize {
        match self {
            AllocFn::Malloc | AllocFn::Free => 1,
            AllocFn::Calloc | AllocFn::AlignedAlloc | AllocFn::Realloc => 2,
            AllocFn::PosixMemalign => 3,
        }
    }

    /// Routines with an exit-point value worth observing (everything but free).
    pub fn has_return(self) -> bool {
        !matches!(self, AllocFn::Free)
    }
}

/// Memory access direction, as reported by the host's instruction decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Why the host observed a context change on the application thread.
///
/// Only signal entry/exit adjust profiler state; the rest are observed and
/// deliberately left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChange {
    Signal,
    SignalReturn,
    FatalSignal,
    Other,
}

/// What the profiler asks of the instrumentation host.
///
/// Implementations own their symbol tables and perform their own locking;
/// `routine_at` may be called from the middle of analysis callbacks (indirect
/// calls, returns) and must be safe to invoke at that point.
pub trait SymbolSource {
    /// Routine containing `addr`, if the host can name one.
    fn routine_at(&self, addr: Addr) -> Option<RoutineId>;

    /// Demangled-enough display name for a routine; `None` prints as UNKNOWN.
    fn routine_name(&self, rtn: RoutineId) -> Option<String>;

    /// Does `addr` fall inside the main executable image?
    fn in_main_image(&self, addr: Addr) -> bool;

    /// Read one pointer-sized word of guest memory. Used only to recover the
    /// `posix_memalign` out-parameter at routine exit.
    fn read_word(&self, addr: Addr) -> Addr;
}
