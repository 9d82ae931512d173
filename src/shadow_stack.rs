/// Shadow stack
///
/// Reconstructs an approximation of the target's call chain from branch and
/// return events. The chain is restricted to routines in the main executable
/// plus a fixed set of externally traceable library routines (the allocation
/// entry points and the longjmp helper); calls made *inside* those library
/// routines are deliberately not tracked. PLT-style stubs never appear on the
/// chain either — a stub call records its user-code site, and the next traced
/// cross-image call claims that site as its own.

use std::collections::HashSet;
use std::io::{self, Write};

use crate::host::{Addr, ContextChange, RoutineId, SymbolSource};

/// Name of the longjmp helper registered as externally traceable alongside
/// the allocation routines.
pub const LONGJMP: &str = "__longjmp";

/// One frame: the return-instruction address that made the call, and the
/// routine it landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub site: Addr,
    pub routine: RoutineId,
}

/// Ordered call-site sequence, outermost first. Snapshots of the live chain
/// are used as map keys and must never alias it.
pub type Chain = Vec<CallSite>;

pub struct ShadowStack {
    chain: Chain,
    entered_main: bool,
    signal_depth: u64,
    thread_count: u64,
    last_stub_call_site: Addr,
    ext_traceable: Vec<RoutineId>,
    /// 0 = unlimited; otherwise snapshots keep only the deepest N frames.
    max_depth: usize,
}

impl ShadowStack {
    pub fn new(max_depth: usize) -> Self {
        ShadowStack {
            chain: Vec::new(),
            entered_main: false,
            signal_depth: 0,
            thread_count: 0,
            last_stub_call_site: 0,
            ext_traceable: Vec::new(),
            max_depth,
        }
    }

    pub fn entered_main(&self) -> bool {
        self.entered_main
    }

    pub fn signal_depth(&self) -> u64 {
        self.signal_depth
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// Register a routine that stays traceable even though it lives outside
    /// the main executable. Called by the host at image-load time.
    pub fn register_ext_traceable(&mut self, rtn: RoutineId) {
        self.ext_traceable.push(rtn);
    }

    pub fn is_ext_traceable(&self, rtn: RoutineId) -> bool {
        self.ext_traceable.contains(&rtn)
    }

    /// The traceability predicate: a branch target is worth recording iff its
    /// routine is known and either the target lies in the main executable or
    /// the routine is one of the registered library escapes.
    pub fn should_trace(&self, rtn: RoutineId, target: Addr, host: &dyn SymbolSource) -> bool {
        host.in_main_image(target) || self.is_ext_traceable(rtn)
    }

    /// Direct call into a stub section: remember the user-code site only.
    pub fn on_stub_call(&mut self, src: Addr) {
        self.last_stub_call_site = src;
    }

    /// Traced call. A zero `src` means the call arrived from outside the main
    /// image and went through a stub; attribute it to the recorded stub site.
    pub fn on_call(&mut self, src: Addr, rtn: RoutineId) {
        let mut src = src;
        if src == 0 {
            src = self.last_stub_call_site;
            self.last_stub_call_site = 0;
        }

        if !self.entered_main {
            return;
        }

        match self.chain.last() {
            // Repeated top-of-chain routine: tail recursion or duplicate
            // instrumentation, not a new frame.
            Some(top) if top.routine == rtn => return,
            // Calls made inside library escapes are not tracked.
            Some(top) if self.is_ext_traceable(top.routine) => return,
            _ => {}
        }

        self.chain.push(CallSite { site: src, routine: rtn });
    }

    /// Indirect branch or call. The target routine is only known at run time,
    /// so resolve it through the host before applying the predicate.
    pub fn on_indirect_call(&mut self, src: Addr, target: Addr, host: &dyn SymbolSource) {
        if !self.entered_main {
            return;
        }
        let Some(rtn) = host.routine_at(target) else {
            return;
        };
        if self.should_trace(rtn, target, host) {
            self.on_call(src, rtn);
        }
    }

    /// Return instruction. Truncate the chain back to the frame of the
    /// routine the return lands in; if no such frame exists and the top is a
    /// library escape, pop exactly that one frame.
    pub fn on_return(&mut self, ret_target: Addr, host: &dyn SymbolSource) {
        if !self.entered_main {
            return;
        }
        let Some(rtn) = host.routine_at(ret_target) else {
            return;
        };

        for i in (0..self.chain.len()).rev() {
            if self.chain[i].routine == rtn {
                self.chain.truncate(i + 1);
                return;
            }
        }

        if let Some(top) = self.chain.last() {
            if self.is_ext_traceable(top.routine) {
                self.chain.pop();
            }
        }
    }

    /// Entry into the program's `main`. Starts tracing and seeds the chain.
    pub fn on_main_entry(&mut self, rtn: RoutineId) {
        self.entered_main = true;
        if self.chain.is_empty() {
            self.chain.push(CallSite { site: 0, routine: rtn });
        }
    }

    pub fn on_thread_start(&mut self) {
        self.thread_count += 1;
        assert!(
            self.thread_count == 1,
            "multi-threaded target programs are not supported"
        );
    }

    /// Signals do not contribute to the chain; only the nesting depth is
    /// tracked. Fatal signals and exotic reasons are observed, nothing more.
    pub fn on_context_change(&mut self, reason: ContextChange) {
        match reason {
            ContextChange::Signal => self.signal_depth += 1,
            ContextChange::SignalReturn => self.signal_depth -= 1,
            ContextChange::FatalSignal | ContextChange::Other => {}
        }
    }

    /// Copy of the current chain, constrained to the configured depth.
    pub fn snapshot(&self) -> Chain {
        if self.max_depth > 0 {
            let n = self.chain.len().min(self.max_depth);
            self.chain[self.chain.len() - n..].to_vec()
        } else {
            self.chain.clone()
        }
    }

    /// Reduce a chain so that for any duplicated call site only the most
    /// recent copy survives. Walks newest to oldest, keeping first sightings.
    pub fn reduce(chain: &Chain) -> Chain {
        let mut seen: HashSet<CallSite> = HashSet::new();
        let mut kept: Chain = chain
            .iter()
            .rev()
            .filter(|site| seen.insert(**site))
            .copied()
            .collect();
        kept.reverse();
        kept
    }
}

/// Print a chain for the context trace, innermost frame on the first line.
pub fn print_chain(
    chain: &Chain,
    host: &dyn SymbolSource,
    out: &mut dyn Write,
) -> io::Result<()> {
    for frame in chain.iter().rev() {
        let name = host
            .routine_name(frame.routine)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        writeln!(out, "\t{} from {:#x}", name, frame.site)?;
    }
    Ok(())
}
