// critical_path.rs — Edge latencies and critical-path delays
//
// `latency` estimates how many ticks must separate a producer from a
// dependent consumer. `compute_delays` annotates every node with the
// longest latency-weighted path to the end of its block; the scheduler
// prefers nodes with larger delay.
//
// Preconditions: graph edges point from lower to higher node ids.
// Postconditions: every node has `delay >= 1`, and each parent's delay is at
//   least `child.delay + latency(parent, child)`.
// Failure modes: none.
// Side effects: mutates `ScheduleNode::delay`.

use crate::dep_graph::DepGraph;
use crate::inst::{Dest, Inst, Waddr};

/// TMU lookups take roughly this long to come back.
pub const TMU_LATENCY: u32 = 100;
/// SFU results land in their destination after this many ticks.
pub const SFU_LATENCY: u32 = 3;

fn magic_waddr_latency(waddr: Waddr, after: &Inst) -> u32 {
    if waddr.is_tmu() && after.waits_on_tmu() {
        return TMU_LATENCY;
    }
    // Anything depending on an SFU write is assumed to consume its result.
    if waddr.is_sfu() {
        return SFU_LATENCY;
    }
    1
}

/// Ticks that must pass between issuing `before` and issuing `after`.
pub fn latency(before: &Inst, after: &Inst) -> u32 {
    let (Some(b), Some(_)) = (before.as_alu(), after.as_alu()) else {
        return 1;
    };
    if before.is_sfu() {
        return 2;
    }
    b.add_dest()
        .into_iter()
        .chain(b.mul_dest())
        .filter_map(Dest::magic)
        .map(|w| magic_waddr_latency(w, after))
        .fold(1, u32::max)
}

/// Fill in `delay` for every node, bottom-up.
pub fn compute_delays(graph: &mut DepGraph) {
    // Children always have larger ids, so reverse id order is bottom-up.
    for id in (0..graph.len()).rev() {
        let node = graph.node(id);
        let delay = node
            .children
            .iter()
            .map(|e| graph.node(e.child).delay + latency(&node.inst, &graph.node(e.child).inst))
            .fold(1, u32::max);
        graph.node_mut(id).delay = delay;
    }
}

/// Length of the longest latency-weighted path in the block.
pub fn critical_path_length(graph: &DepGraph) -> u32 {
    (0..graph.len())
        .map(|id| graph.node(id).delay)
        .max()
        .unwrap_or(0)
}
