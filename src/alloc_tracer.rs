/// Allocation tracker
///
/// Owns the address → allocation map, the chain → context table, and the
/// per-context bookkeeping that later decides co-allocatability. Entry
/// callbacks on the intercepted heap routines stash the request arguments;
/// the exit callback turns the returned pointer into an `AllocationRecord`
/// keyed by base address and stamped with the allocation context derived from
/// the current shadow-stack snapshot.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};

use crate::host::{Addr, AllocFn, SymbolSource};
use crate::shadow_stack::{print_chain, Chain, ShadowStack};

/// Monotonic object identity; never reused, 0 means "none".
pub type ObjectId = u32;

/// Dense allocation-context identity.
pub type ContextId = u16;

/// Hard cap on distinct allocation contexts. Assigning the id equal to this
/// value is a fatal configuration error.
pub const MAX_ALLOC_CONTEXTS: u32 = 65_536;

/// (object id, base address) pair used wherever an object must be re-checked
/// for liveness later: the id disambiguates address reuse after free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub addr: Addr,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    pub size: i32,
    pub id: ObjectId,
    /// Previous allocation under the same context at record time, 0 if first.
    pub predecessor: ObjectId,
    /// Next allocation under the same context, patched in lazily; 0 if none.
    pub successor: ObjectId,
    pub context: ContextId,
    /// Access-count epoch of the last affinity walk that visited this record.
    pub dedup_epoch: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub last_object: ObjectRecord,
    pub access_count: u32,
    /// Set during finalization for contexts inside the coverage prefix.
    pub marked_popular: bool,
}

/// Outcome of an exit-point callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    Ok,
    /// The context table is full; the run must stop with exit code 1.
    ContextLimit,
}

pub struct AllocTracer {
    /// Base address → record. Ascending order plus a floor lookup gives the
    /// "largest base ≤ query" containment query.
    allocations: BTreeMap<Addr, AllocationRecord>,
    chains: HashMap<Chain, ContextId>,
    contexts: Vec<Context>,
    next_object_id: ObjectId,
    next_context_id: u32,
    max_object_size: i32,

    // Entry-point captures consumed by the matching exit callback.
    pending_size: i32,
    pending_memalign_dest: Addr,
    pending_realloc_ptr: Addr,

    /// Human-readable context dump, written incrementally as contexts appear.
    trace: Box<dyn Write>,
}

fn in_bounds(addr: Addr, base: Addr, size: i32) -> bool {
    addr >= base && addr < base.wrapping_add(size as i64 as u64)
}

impl AllocTracer {
    pub fn new(max_object_size: i32, trace: Box<dyn Write>) -> Self {
        AllocTracer {
            allocations: BTreeMap::new(),
            chains: HashMap::new(),
            contexts: Vec::new(),
            next_object_id: 1,
            next_context_id: 0,
            max_object_size,
            pending_size: 0,
            pending_memalign_dest: 0,
            pending_realloc_ptr: 0,
            trace,
        }
    }

    // ------------------------------------------------------------------
    // Containment queries
    // ------------------------------------------------------------------

    /// Allocation containing `addr`, i.e. the largest base ≤ `addr` whose
    /// size bound still covers it.
    pub fn find_containing(&self, addr: Addr) -> Option<(Addr, AllocationRecord)> {
        let (&base, rec) = self.allocations.range(..=addr).next_back()?;
        in_bounds(addr, base, rec.size).then_some((base, *rec))
    }

    /// Re-resolve a remembered object; fails if it was freed (or its address
    /// range was reused by a different object) in the meantime.
    pub fn find_record(&self, obj: ObjectRecord) -> Option<(Addr, AllocationRecord)> {
        let (base, rec) = self.find_containing(obj.addr)?;
        (rec.id == obj.id).then_some((base, rec))
    }

    /// True when no live allocation covers `addr`.
    pub fn is_untracked(&self, addr: Addr) -> bool {
        self.find_containing(addr).is_none()
    }

    pub fn set_dedup_epoch(&mut self, base: Addr, epoch: u64) {
        if let Some(rec) = self.allocations.get_mut(&base) {
            rec.dedup_epoch = epoch;
        }
    }

    // ------------------------------------------------------------------
    // Context table access
    // ------------------------------------------------------------------

    pub fn context(&self, id: ContextId) -> &Context {
        &self.contexts[id as usize]
    }

    pub fn context_mut(&mut self, id: ContextId) -> &mut Context {
        &mut self.contexts[id as usize]
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn chains(&self) -> &HashMap<Chain, ContextId> {
        &self.chains
    }

    pub fn num_live_allocations(&self) -> usize {
        self.allocations.len()
    }

    // ------------------------------------------------------------------
    // Entry / exit callbacks
    // ------------------------------------------------------------------

    /// Entry-point capture. For everything but `free` this only stashes the
    /// size (and, for posix_memalign, the out-parameter address) until the
    /// exit callback fires; `free` is processed immediately.
    pub fn on_alloc_call(&mut self, f: AllocFn, params: &[Addr], entered_main: bool) {
        let p = |i: usize| params.get(i).copied().unwrap_or(0);
        match f {
            AllocFn::Malloc => self.pending_size = p(0) as i32,
            AllocFn::Calloc => self.pending_size = p(0).wrapping_mul(p(1)) as i32,
            AllocFn::AlignedAlloc => self.pending_size = p(1) as i32,
            AllocFn::Realloc => {
                self.pending_realloc_ptr = p(0);
                self.pending_size = p(1) as i32;
            }
            AllocFn::PosixMemalign => {
                self.pending_memalign_dest = p(0);
                self.pending_size = p(2) as i32;
            }
            AllocFn::Free => {
                if entered_main {
                    self.allocations.remove(&p(0));
                }
            }
        }
    }

    /// Exit-point callback: record the allocation the routine produced.
    ///
    /// A realloc that returned its own argument with the record still present
    /// is left untouched; a realloc that moved erases the stale record at the
    /// old address and the new address becomes a fresh object.
    pub fn on_alloc_return(
        &mut self,
        f: AllocFn,
        ret: Addr,
        stack: &ShadowStack,
        host: &dyn SymbolSource,
    ) -> io::Result<AllocStatus> {
        if !f.has_return() {
            return Ok(AllocStatus::Ok);
        }
        let addr = if f == AllocFn::PosixMemalign {
            host.read_word(self.pending_memalign_dest)
        } else {
            ret
        };

        if !stack.entered_main() || addr == 0 {
            return Ok(AllocStatus::Ok);
        }

        let is_realloc = f == AllocFn::Realloc;
        if is_realloc {
            let old = self.pending_realloc_ptr;
            if addr == old {
                if self.allocations.contains_key(&addr) {
                    return Ok(AllocStatus::Ok);
                }
            } else if old != 0 {
                self.allocations.remove(&old);
            }
        }

        self.record_allocation(addr, self.pending_size, is_realloc, stack, host)
    }

    fn record_allocation(
        &mut self,
        addr: Addr,
        size: i32,
        is_realloc: bool,
        stack: &ShadowStack,
        host: &dyn SymbolSource,
    ) -> io::Result<AllocStatus> {
        // Only allocations small enough to be co-allocatable are tracked.
        if size > self.max_object_size {
            if is_realloc {
                self.allocations.remove(&addr);
            }
            return Ok(AllocStatus::Ok);
        }

        let id = match self.allocations.get(&addr) {
            Some(existing) if is_realloc => existing.id,
            _ => {
                let id = self.next_object_id;
                self.next_object_id += 1;
                id
            }
        };

        let obj = ObjectRecord { id, addr };
        let Some((context, predecessor)) = self.update_context(obj, stack, host)? else {
            return Ok(AllocStatus::ContextLimit);
        };

        self.allocations.insert(
            addr,
            AllocationRecord {
                size,
                id,
                predecessor,
                successor: 0,
                context,
                dedup_epoch: 0,
            },
        );
        Ok(AllocStatus::Ok)
    }

    /// Map the current chain snapshot to a context id, creating the context
    /// (and emitting its trace record) on first sight. Returns the id plus
    /// the predecessor object id for the new allocation, or `None` when the
    /// context table is exhausted.
    fn update_context(
        &mut self,
        obj: ObjectRecord,
        stack: &ShadowStack,
        host: &dyn SymbolSource,
    ) -> io::Result<Option<(ContextId, ObjectId)>> {
        let mut chain = stack.snapshot();

        // No direct match: retry with the reduced form, which also becomes
        // the stored key if this turns out to be a brand-new context.
        if !self.chains.contains_key(&chain) {
            chain = ShadowStack::reduce(&chain);
        }

        match self.chains.get(&chain).copied() {
            None => {
                writeln!(self.trace, "CTX {}:", self.next_context_id)?;
                print_chain(&chain, host, &mut self.trace)?;

                if self.next_context_id == MAX_ALLOC_CONTEXTS {
                    eprintln!("ERROR: Exceeded maximum allocation call site limit");
                    return Ok(None);
                }

                let id = self.next_context_id as ContextId;
                self.next_context_id += 1;
                self.contexts.push(Context {
                    last_object: obj,
                    access_count: 0,
                    marked_popular: false,
                });
                self.chains.insert(chain, id);
                Ok(Some((id, 0)))
            }
            Some(id) => {
                let prev = self.contexts[id as usize].last_object;
                if let Some((base, _)) = self.find_record(prev) {
                    if let Some(rec) = self.allocations.get_mut(&base) {
                        rec.successor = obj.id;
                    }
                }
                self.contexts[id as usize].last_object = obj;
                Ok(Some((id, prev.id)))
            }
        }
    }
}
