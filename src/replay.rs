/// Event-trace replay host
///
/// The in-tree realization of the instrumentation host: a line-oriented
/// trace declares the guest's routine table and then delivers dynamic events
/// (calls, returns, stubs, signals, block retirements, allocation entry/exit
/// pairs, memory accesses) in program order. The replay driver applies the
/// same instrumentation-time filtering a live host would — direct calls are
/// only delivered when they pass the traceability predicate — and honors
/// exit requests latched by the analysis callbacks.
///
/// Trace grammar, one event per line, `#` starts a comment:
///
/// ```text
/// rtn <name> <start> <end> <main|lib> [ext]   declare a routine
/// mem <addr> <value>                          poke guest memory word
/// thread-start
/// main <addr>                                 guest entered main
/// call <src> <target>                         direct call
/// icall <src> <target>                        indirect call
/// stub <src>                                  direct call into a stub
/// ret <target>                                return to <target>
/// sig <signal|sigreturn|fatal|other>
/// bbl <n>                                     basic block of n instructions
/// alloc <name> <p0> [p1] [p2]                 allocation routine entry
/// allocret <name> <value>                     allocation routine exit
/// read <ip> <ea> <size> [prefetch]
/// prewrite <ea> <size>
/// write <ip>
/// end <code>                                  guest thread finished
/// ```
///
/// Numbers are decimal or `0x`-prefixed hex.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use parking_lot::Mutex;

use crate::errors::TraceError;
use crate::host::{Addr, AllocFn, ContextChange, RoutineId, SymbolSource};
use crate::profiler::Profiler;
use crate::shadow_stack::LONGJMP;

pub struct RoutineInfo {
    pub name: String,
    pub start: Addr,
    pub end: Addr,
    pub main_image: bool,
}

#[derive(Default)]
struct SymbolTable {
    routines: Vec<RoutineInfo>,
}

impl SymbolTable {
    fn resolve(&self, addr: Addr) -> Option<RoutineId> {
        self.routines
            .iter()
            .position(|r| addr >= r.start && addr < r.end)
            .map(|ix| RoutineId(ix as u32))
    }
}

/// Replayed guest: a symbol table behind the host's symbol lock, plus a
/// sparse word-addressed guest memory image.
#[derive(Default)]
pub struct ReplayHost {
    symbols: Mutex<SymbolTable>,
    memory: HashMap<Addr, u64>,
}

impl ReplayHost {
    pub fn new() -> Self {
        ReplayHost::default()
    }

    pub fn define_routine(&mut self, info: RoutineInfo) -> RoutineId {
        let mut symbols = self.symbols.lock();
        symbols.routines.push(info);
        RoutineId((symbols.routines.len() - 1) as u32)
    }

    pub fn poke(&mut self, addr: Addr, value: u64) {
        self.memory.insert(addr, value);
    }
}

impl SymbolSource for ReplayHost {
    fn routine_at(&self, addr: Addr) -> Option<RoutineId> {
        self.symbols.lock().resolve(addr)
    }

    fn routine_name(&self, rtn: RoutineId) -> Option<String> {
        let symbols = self.symbols.lock();
        symbols.routines.get(rtn.0 as usize).map(|r| r.name.clone())
    }

    fn in_main_image(&self, addr: Addr) -> bool {
        let symbols = self.symbols.lock();
        match symbols.resolve(addr) {
            Some(rtn) => symbols.routines[rtn.0 as usize].main_image,
            None => false,
        }
    }

    fn read_word(&self, addr: Addr) -> Addr {
        self.memory.get(&addr).copied().unwrap_or(0)
    }
}

fn parse_num(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

/// Replay a trace into `profiler`, writing the locality graph to `tgf` when
/// the guest finishes cleanly. Returns the guest exit code. A trace without
/// an explicit `end` event finishes with code 0 at end of input.
pub fn run<R: BufRead>(
    profiler: &mut Profiler,
    input: R,
    tgf: &mut dyn Write,
) -> Result<i32, TraceError> {
    let mut host = ReplayHost::new();

    for (ix, line) in input.lines().enumerate() {
        let line = line?;
        let line_no = ix + 1;
        let text = line.split('#').next().unwrap_or("");
        let mut tokens = text.split_whitespace();
        let Some(event) = tokens.next() else {
            continue;
        };

        let bad = || TraceError::BadOperand {
            line: line_no,
            event: event.to_string(),
        };
        let num = |tokens: &mut std::str::SplitWhitespace<'_>| {
            tokens.next().and_then(parse_num).ok_or_else(bad)
        };

        match event {
            "rtn" => {
                let name = tokens.next().ok_or_else(bad)?.to_string();
                let start = num(&mut tokens)?;
                let end = num(&mut tokens)?;
                let main_image = match tokens.next() {
                    Some("main") => true,
                    Some("lib") => false,
                    _ => return Err(bad()),
                };
                // The allocation routines and the longjmp helper stay
                // traceable wherever they live; `ext` marks further escapes.
                let ext = tokens.next() == Some("ext")
                    || name == LONGJMP
                    || AllocFn::from_name(&name).is_some();
                let rtn = host.define_routine(RoutineInfo {
                    name,
                    start,
                    end,
                    main_image,
                });
                if ext {
                    profiler.register_ext_traceable(rtn);
                }
            }
            "mem" => {
                let addr = num(&mut tokens)?;
                let value = num(&mut tokens)?;
                host.poke(addr, value);
            }
            "thread-start" => profiler.on_thread_start(),
            "main" => {
                let addr = num(&mut tokens)?;
                let rtn = host
                    .routine_at(addr)
                    .ok_or(TraceError::UnknownRoutine { line: line_no, addr })?;
                profiler.on_main_entry(rtn);
            }
            "call" => {
                let src = num(&mut tokens)?;
                let target = num(&mut tokens)?;
                // Instrumentation-time filtering: undeclared or untraceable
                // targets are simply never delivered.
                if let Some(rtn) = host.routine_at(target) {
                    if profiler.should_trace(rtn, target, &host) {
                        profiler.on_call(src, rtn);
                    }
                }
            }
            "icall" => {
                let src = num(&mut tokens)?;
                let target = num(&mut tokens)?;
                profiler.on_indirect_call(src, target, &host);
            }
            "stub" => {
                let src = num(&mut tokens)?;
                profiler.on_stub_call(src);
            }
            "ret" => {
                let target = num(&mut tokens)?;
                profiler.on_return(target, &host);
            }
            "sig" => {
                let reason = match tokens.next().ok_or_else(bad)? {
                    "signal" => ContextChange::Signal,
                    "sigreturn" => ContextChange::SignalReturn,
                    "fatal" => ContextChange::FatalSignal,
                    "other" => ContextChange::Other,
                    _ => return Err(bad()),
                };
                profiler.on_context_change(reason);
            }
            "bbl" => {
                let n = num(&mut tokens)?;
                profiler.on_block_executed(n);
            }
            "alloc" => {
                let name = tokens.next().ok_or_else(bad)?;
                let f = AllocFn::from_name(name).ok_or_else(|| TraceError::UnknownAllocFn {
                    line: line_no,
                    name: name.to_string(),
                })?;
                let mut params = Vec::with_capacity(f.param_count());
                for _ in 0..f.param_count() {
                    params.push(num(&mut tokens)?);
                }
                profiler.on_alloc_call(f, &params);
            }
            "allocret" => {
                let name = tokens.next().ok_or_else(bad)?;
                let f = AllocFn::from_name(name).ok_or_else(|| TraceError::UnknownAllocFn {
                    line: line_no,
                    name: name.to_string(),
                })?;
                let value = num(&mut tokens)?;
                profiler.on_alloc_return(f, value, &host)?;
            }
            "read" => {
                let ip = num(&mut tokens)?;
                let ea = num(&mut tokens)?;
                let size = num(&mut tokens)? as i32;
                let prefetch = tokens.next() == Some("prefetch");
                profiler.on_read(ip, ea, size, prefetch);
            }
            "prewrite" => {
                let ea = num(&mut tokens)?;
                let size = num(&mut tokens)? as i32;
                profiler.on_pre_write(ea, size);
            }
            "write" => {
                let ip = num(&mut tokens)?;
                profiler.on_write(ip);
            }
            "end" => {
                let code = num(&mut tokens)? as i32;
                profiler.on_thread_end(code, tgf)?;
                return Ok(code);
            }
            other => {
                return Err(TraceError::UnknownEvent {
                    line: line_no,
                    event: other.to_string(),
                })
            }
        }

        // Honor exit requests raised inside the analysis callbacks.
        if let Some(code) = profiler.exit_requested() {
            profiler.on_thread_end(code, tgf)?;
            return Ok(code);
        }
    }

    profiler.on_thread_end(0, tgf)?;
    Ok(0)
}
