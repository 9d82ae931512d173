/// Master profiler
///
/// Composes the shadow stack, allocation tracker, and access tracer behind
/// the flat set of analysis callbacks a host dispatches into. Also owns the
/// dynamic instruction counter and the latched exit request that initiating
/// hosts are expected to poll after every delivered event.

use std::io::{self, Write};

use crate::access_tracer::AccessTracer;
use crate::alloc_tracer::{AllocStatus, AllocTracer};
use crate::errors::ConfigError;
use crate::host::{AccessKind, Addr, AllocFn, ContextChange, RoutineId, SymbolSource};
use crate::report;
use crate::shadow_stack::ShadowStack;

/// Knob values, pre-validation. Defaults match the command-line defaults.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Maximum summed access size separating two correlated accesses, in
    /// bytes. Must be a power of two.
    pub affinity_distance: i32,
    /// Allocations larger than this are not tracked.
    pub max_object_size: i32,
    /// Snapshot depth limit; 0 keeps whole chains.
    pub max_stack_depth: usize,
    /// Stop after this many dynamic instructions; 0 = unlimited.
    pub instruction_limit: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            affinity_distance: 1024,
            max_object_size: 4096,
            max_stack_depth: 0,
            instruction_limit: 0,
        }
    }
}

pub struct Profiler {
    stack: ShadowStack,
    allocs: AllocTracer,
    accesses: AccessTracer,
    instr_count: u64,
    instr_limit: u64,
    exit_request: Option<i32>,
}

impl Profiler {
    /// Build a profiler, writing context records to `contexts_out` as they
    /// are discovered. Fails on rejected knob values.
    pub fn new(config: ProfilerConfig, contexts_out: Box<dyn Write>) -> Result<Self, ConfigError> {
        let accesses = AccessTracer::new(config.affinity_distance)?;
        Ok(Profiler {
            stack: ShadowStack::new(config.max_stack_depth),
            allocs: AllocTracer::new(config.max_object_size, contexts_out),
            accesses,
            instr_count: 0,
            instr_limit: config.instruction_limit,
            exit_request: None,
        })
    }

    pub fn stack(&self) -> &ShadowStack {
        &self.stack
    }

    pub fn allocs(&self) -> &AllocTracer {
        &self.allocs
    }

    pub fn accesses(&self) -> &AccessTracer {
        &self.accesses
    }

    pub fn instr_count(&self) -> u64 {
        self.instr_count
    }

    /// Exit code requested from inside an analysis callback, if any. Hosts
    /// poll this after each event and, when set, deliver the thread-finish
    /// event with this code and stop the run.
    pub fn exit_requested(&self) -> Option<i32> {
        self.exit_request
    }

    /// Traceability predicate for instrumentation-time filtering of direct
    /// calls; indirect calls apply it internally at analysis time.
    pub fn should_trace(&self, rtn: RoutineId, target: Addr, host: &dyn SymbolSource) -> bool {
        self.stack.should_trace(rtn, target, host)
    }

    /// Register a routine (allocation entry point or longjmp helper) found
    /// outside the main executable that must remain traceable.
    pub fn register_ext_traceable(&mut self, rtn: RoutineId) {
        self.stack.register_ext_traceable(rtn);
    }

    // ------------------------------------------------------------------
    // Control-flow events
    // ------------------------------------------------------------------

    pub fn on_thread_start(&mut self) {
        self.stack.on_thread_start();
    }

    pub fn on_main_entry(&mut self, rtn: RoutineId) {
        self.stack.on_main_entry(rtn);
    }

    pub fn on_call(&mut self, src: Addr, rtn: RoutineId) {
        self.stack.on_call(src, rtn);
    }

    pub fn on_stub_call(&mut self, src: Addr) {
        self.stack.on_stub_call(src);
    }

    pub fn on_indirect_call(&mut self, src: Addr, target: Addr, host: &dyn SymbolSource) {
        self.stack.on_indirect_call(src, target, host);
    }

    pub fn on_return(&mut self, ret_target: Addr, host: &dyn SymbolSource) {
        self.stack.on_return(ret_target, host);
    }

    pub fn on_context_change(&mut self, reason: ContextChange) {
        self.stack.on_context_change(reason);
    }

    /// Per-basic-block instruction accounting. Instructions only count once
    /// the program has entered main; the limit check runs regardless.
    pub fn on_block_executed(&mut self, num_instrs: u64) {
        if self.stack.entered_main() {
            self.instr_count += num_instrs;
        }
        if self.instr_limit != 0 && self.instr_count >= self.instr_limit {
            self.exit_request.get_or_insert(0);
        }
    }

    // ------------------------------------------------------------------
    // Allocation events
    // ------------------------------------------------------------------

    pub fn on_alloc_call(&mut self, f: AllocFn, params: &[Addr]) {
        self.allocs.on_alloc_call(f, params, self.stack.entered_main());
    }

    pub fn on_alloc_return(
        &mut self,
        f: AllocFn,
        ret: Addr,
        host: &dyn SymbolSource,
    ) -> io::Result<()> {
        match self.allocs.on_alloc_return(f, ret, &self.stack, host)? {
            AllocStatus::Ok => {}
            AllocStatus::ContextLimit => {
                self.exit_request.get_or_insert(1);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Access events
    // ------------------------------------------------------------------

    pub fn on_read(&mut self, ip: Addr, ea: Addr, size: i32, prefetch: bool) {
        let entered = self.stack.entered_main();
        self.accesses.on_access(
            &mut self.allocs,
            AccessKind::Read,
            ip,
            ea,
            size,
            prefetch,
            entered,
        );
    }

    pub fn on_pre_write(&mut self, ea: Addr, size: i32) {
        self.accesses.on_pre_write(ea, size);
    }

    pub fn on_write(&mut self, ip: Addr) {
        let entered = self.stack.entered_main();
        self.accesses.on_write(&mut self.allocs, ip, entered);
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Thread-finish event: report the instruction count and, on a clean
    /// exit, rank contexts and write the locality graph.
    pub fn on_thread_end(&mut self, code: i32, tgf: &mut dyn Write) -> io::Result<()> {
        report::finalize(
            &mut self.allocs,
            &self.accesses,
            self.instr_count,
            code,
            tgf,
        )
    }
}
