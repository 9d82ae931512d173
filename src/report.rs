/// End-of-run report
///
/// Ranks allocation contexts by access count, marks the smallest prefix that
/// covers 90% of all unique object accesses, and emits the locality graph in
/// Trivial Graph Format: marked nodes, a `#` separator, then the weighted
/// edges between marked contexts with the higher id first.

use std::io::{self, Write};

use crate::access_tracer::AccessTracer;
use crate::alloc_tracer::{AllocTracer, ContextId};

/// Fraction of total accesses the marked prefix must cover.
const COVERAGE: f64 = 0.9;

/// Finalize a run. Always reports the executed instruction count; the graph
/// is only generated for a clean exit.
pub fn finalize(
    allocs: &mut AllocTracer,
    accesses: &AccessTracer,
    instr_count: u64,
    code: i32,
    tgf: &mut dyn Write,
) -> io::Result<()> {
    eprintln!("Finished after executing {} instructions.", instr_count);
    if code != 0 {
        return Ok(());
    }

    // Sort context ids by access frequency, busiest first.
    let mut ids: Vec<ContextId> = allocs.chains().values().copied().collect();
    ids.sort_by(|a, b| {
        allocs
            .context(*b)
            .access_count
            .cmp(&allocs.context(*a).access_count)
    });

    // Mark popular nodes until the coverage threshold is reached; the
    // context that crosses it is included.
    let total = accesses.access_count();
    let threshold = (total as f64 * COVERAGE) as u64;
    let mut covered: u64 = 0;
    for &id in &ids {
        let ctx = allocs.context_mut(id);
        ctx.marked_popular = true;
        covered += ctx.access_count as u64;
        if covered >= threshold {
            break;
        }
    }

    write_tgf(allocs, accesses, &ids, tgf)?;
    eprintln!(
        "Generated locality graph accounting for {} out of {} unique object accesses",
        covered, total
    );
    Ok(())
}

fn write_tgf(
    allocs: &AllocTracer,
    accesses: &AccessTracer,
    ranked: &[ContextId],
    tgf: &mut dyn Write,
) -> io::Result<()> {
    // Nodes, in rank order.
    for &id in ranked {
        let ctx = allocs.context(id);
        if !ctx.marked_popular {
            continue;
        }
        writeln!(tgf, "{} {}", id, ctx.access_count)?;
    }
    writeln!(tgf, "#")?;

    // Edges, in id order, higher endpoint first.
    let n = allocs.num_contexts();
    for i in 0..n {
        if !allocs.context(i as ContextId).marked_popular {
            continue;
        }
        for j in 0..=i {
            if !allocs.context(j as ContextId).marked_popular {
                continue;
            }
            if let Some(weight) = accesses.edge_weight(i as ContextId, j as ContextId) {
                if weight > 0 {
                    writeln!(tgf, "{} {} {}", i, j, weight)?;
                }
            }
        }
    }
    Ok(())
}
