/// Access tracer
///
/// Correlates heap memory accesses through a bounded ring of recent accesses
/// (the affinity queue) and accumulates co-allocatability-filtered edge
/// weights between allocation contexts. The queue capacity is the affinity
/// distance divided by the minimum access size, so a full backward walk costs
/// amortized constant time per access.

use petgraph::graphmap::UnGraphMap;

use crate::alloc_tracer::{AllocTracer, AllocationRecord, ContextId, ObjectId, ObjectRecord};
use crate::errors::ConfigError;
use crate::host::{AccessKind, Addr};

/// Smallest access the queue is sized for.
pub const MIN_ACCESS_SIZE: i32 = 4;

#[derive(Debug, Clone, Copy, Default)]
struct AccessSlot {
    record: ObjectRecord,
    size: i32,
}

impl AccessSlot {
    /// Slots start zeroed; a zero base address marks one never written.
    fn is_empty(&self) -> bool {
        self.record.addr == 0
    }
}

pub struct AccessTracer {
    distance: i32,
    queue: Box<[AccessSlot]>,
    /// Monotonic; only `head & mask` is ever used as an index.
    head: u64,
    access_count: u64,
    last_touched_object: ObjectId,

    // Store capture: pre-instruction callback stashes the pair, the
    // post-instruction callback turns it into an access.
    last_write_addr: Addr,
    last_write_size: i32,

    /// Symmetric context-affinity weights, keyed (higher id, lower id).
    graph: UnGraphMap<ContextId, u32>,
}

/// Two live allocations may share a bump region iff no other allocation from
/// either one's context landed between them. With `a` the older object, that
/// means a's successor is unset or not older than b, and b's predecessor is
/// unset or not younger than a.
fn is_coallocatable(a: &AllocationRecord, b: &AllocationRecord) -> bool {
    if a.id == b.id {
        return false;
    }
    let (first, second) = if b.id < a.id { (b, a) } else { (a, b) };
    (first.successor == 0 || first.successor >= second.id)
        && (second.predecessor == 0 || second.predecessor <= first.id)
}

impl AccessTracer {
    pub fn new(affinity_distance: i32) -> Result<Self, ConfigError> {
        if affinity_distance <= 0 || affinity_distance & (affinity_distance - 1) != 0 {
            return Err(ConfigError::AffinityDistanceNotPowerOfTwo(affinity_distance));
        }
        if affinity_distance < MIN_ACCESS_SIZE {
            return Err(ConfigError::AffinityDistanceTooSmall {
                value: affinity_distance,
                min: MIN_ACCESS_SIZE,
            });
        }

        let capacity = (affinity_distance / MIN_ACCESS_SIZE) as usize;
        Ok(AccessTracer {
            distance: affinity_distance,
            queue: vec![AccessSlot::default(); capacity].into_boxed_slice(),
            head: 0,
            access_count: 0,
            last_touched_object: 0,
            last_write_addr: 0,
            last_write_size: 0,
            graph: UnGraphMap::new(),
        })
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn queue_head(&self) -> u64 {
        self.head
    }

    pub fn graph(&self) -> &UnGraphMap<ContextId, u32> {
        &self.graph
    }

    pub fn edge_weight(&self, a: ContextId, b: ContextId) -> Option<u32> {
        self.graph.edge_weight(a, b).copied()
    }

    // ------------------------------------------------------------------
    // Analysis callbacks
    // ------------------------------------------------------------------

    /// One executed memory access. Consecutive accesses to the same object
    /// coalesce into a single queue entry.
    pub fn on_access(
        &mut self,
        allocs: &mut AllocTracer,
        _kind: AccessKind,
        _ip: Addr,
        ea: Addr,
        size: i32,
        _prefetch: bool,
        entered_main: bool,
    ) {
        if !entered_main {
            return;
        }
        let Some((base, rec)) = allocs.find_containing(ea) else {
            return;
        };
        if rec.id == self.last_touched_object {
            return;
        }

        self.access_count += 1;
        allocs.context_mut(rec.context).access_count += 1;
        self.push_and_correlate(allocs, ObjectRecord { id: rec.id, addr: base }, size);
        self.last_touched_object = rec.id;
    }

    /// Pre-instruction half of the store hook.
    pub fn on_pre_write(&mut self, ea: Addr, size: i32) {
        self.last_write_addr = ea;
        self.last_write_size = size;
    }

    /// Post-instruction half: fires once per executed store, on whichever
    /// exit (fall-through or taken branch) the instruction actually took.
    pub fn on_write(&mut self, allocs: &mut AllocTracer, ip: Addr, entered_main: bool) {
        let (addr, size) = (self.last_write_addr, self.last_write_size);
        self.on_access(allocs, AccessKind::Write, ip, addr, size, false, entered_main);
    }

    // ------------------------------------------------------------------
    // Queue machinery
    // ------------------------------------------------------------------

    fn push_and_correlate(&mut self, allocs: &mut AllocTracer, obj: ObjectRecord, size: i32) {
        let mask = self.queue.len() as u64 - 1;
        let ix = self.head & mask;
        self.head += 1;
        self.queue[ix as usize] = AccessSlot { record: obj, size };

        // Walk back through older entries until their summed sizes exhaust
        // the affinity distance, an empty slot appears, or the walk wraps.
        let mut total: i32 = 0;
        let mut i = ix.wrapping_sub(1) & mask;
        while i != ix && total < self.distance {
            let prev = self.queue[i as usize];
            if prev.is_empty() {
                break;
            }
            self.process_affinity(allocs, obj, prev.record);
            total += prev.size;
            i = i.wrapping_sub(1) & mask;
        }
    }

    /// Accumulate one potential edge between the current access and an
    /// earlier one still in the window.
    fn process_affinity(&mut self, allocs: &mut AllocTracer, a: ObjectRecord, b: ObjectRecord) {
        // The earlier object may have been freed since it was queued.
        let Some((b_base, b_rec)) = allocs.find_record(b) else {
            return;
        };
        if a.id == b_rec.id {
            return;
        }

        // One edge per distinct earlier object per outgoing walk.
        if b_rec.dedup_epoch == self.access_count {
            return;
        }
        allocs.set_dedup_epoch(b_base, self.access_count);

        let Some((_, a_rec)) = allocs.find_record(a) else {
            return;
        };
        if is_coallocatable(&a_rec, &b_rec) {
            let (hi, lo) = if b_rec.context > a_rec.context {
                (b_rec.context, a_rec.context)
            } else {
                (a_rec.context, b_rec.context)
            };
            match self.graph.edge_weight_mut(hi, lo) {
                Some(weight) => *weight += 1,
                None => {
                    self.graph.add_edge(hi, lo, 1);
                }
            }
        }
    }
}
