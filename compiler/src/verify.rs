// verify.rs — Post-schedule obligations
//
// Re-checks a finished schedule against the program it came from. Each
// obligation is a plain boolean so the pipeline can report exactly which
// ones failed without altering the schedule.
//
// Preconditions: `schedule` was produced from `program` and finalized.
// Postconditions: none (read-only).
// Failure modes: none; a failed obligation is reported through the cert.
// Side effects: none.

use crate::delay_slots::{BRANCH_DELAY_SLOTS, THRSW_DELAY_SLOTS};
use crate::dep_graph;
use crate::inst::{Inst, Signals};
use crate::program::{Program, ScheduledBlock, ScheduledProgram};
use crate::scoreboard::Scoreboard;

/// Machine-checkable evidence for schedule postconditions (V1-V5).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// V1: Every source instruction appears exactly once.
    pub v1_conservation: bool,
    /// V2: Every dependency edge of the input is respected.
    pub v2_topological_order: bool,
    /// V3: Thread switches and branches have complete delay slots.
    pub v3_delay_slots: bool,
    /// V4: The uniform stream is consumed in order.
    pub v4_uniform_stream: bool,
    /// V5: No r4/rf0/r5 result is read or overwritten too early.
    pub v5_hazards: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.v1_conservation
            && self.v2_topological_order
            && self.v3_delay_slots
            && self.v4_uniform_stream
            && self.v5_hazards
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("V1_conservation", self.v1_conservation),
            ("V2_topological_order", self.v2_topological_order),
            ("V3_delay_slots", self.v3_delay_slots),
            ("V4_uniform_stream", self.v4_uniform_stream),
            ("V5_hazards", self.v5_hazards),
        ]
    }
}

/// Verify schedule postconditions.
pub fn verify_schedule(program: &Program, schedule: &ScheduledProgram) -> ScheduleCert {
    ScheduleCert {
        v1_conservation: verify_v1_conservation(program, schedule),
        v2_topological_order: verify_v2_topological_order(program, schedule),
        v3_delay_slots: verify_v3_delay_slots(schedule),
        v4_uniform_stream: verify_v4_uniform_stream(program, schedule),
        v5_hazards: verify_v5_hazards(schedule),
    }
}

/// Position of each source instruction in the scheduled block, or `None`
/// when some source instruction is missing or duplicated.
fn origin_positions(source_len: usize, block: &ScheduledBlock) -> Option<Vec<usize>> {
    let mut pos: Vec<Option<usize>> = vec![None; source_len];
    for (i, inst) in block.instructions.iter().enumerate() {
        for &o in &inst.origins {
            let slot = pos.get_mut(o as usize)?;
            if slot.is_some() {
                return None;
            }
            *slot = Some(i);
        }
    }
    pos.into_iter().collect()
}

/// V1: Block counts match and every block covers its sources exactly once.
fn verify_v1_conservation(program: &Program, schedule: &ScheduledProgram) -> bool {
    program.blocks.len() == schedule.blocks.len()
        && program
            .blocks
            .iter()
            .zip(&schedule.blocks)
            .all(|(src, dst)| origin_positions(src.instructions.len(), dst).is_some())
}

/// V2: For every edge `a -> b`, `a` issues no later than `b` takes effect.
///
/// Thread switches take effect after their delay slots and branches after
/// theirs, so instructions moved into those slots still count as earlier.
fn verify_v2_topological_order(program: &Program, schedule: &ScheduledProgram) -> bool {
    let caps = program.device.caps();
    for (src, dst) in program.blocks.iter().zip(&schedule.blocks) {
        let Some(pos) = origin_positions(src.instructions.len(), dst) else {
            return false;
        };
        let effective = |id: usize| {
            let p = pos[id];
            let inst = &dst.instructions[p];
            if inst.is_branch() {
                p + BRANCH_DELAY_SLOTS as usize
            } else if inst.has_sig(Signals::THRSW) {
                p + THRSW_DELAY_SLOTS as usize
            } else {
                p
            }
        };
        let graph = dep_graph::build(&src.instructions, &caps);
        if graph.edges().any(|(a, e)| pos[a] > effective(e.child)) {
            return false;
        }
    }
    true
}

/// V3: Thread switches are 2 apart (a last-thrsw pair counts as one) and
/// followed by 2 more instructions; branches are 3 apart and followed by 3.
fn verify_v3_delay_slots(schedule: &ScheduledProgram) -> bool {
    let insts: Vec<&Inst> = schedule.instructions().collect();
    let len = insts.len();

    let mut last_thrsw: Option<usize> = None;
    let mut last_branch: Option<usize> = None;
    let mut paired = false;
    for (ip, inst) in insts.iter().enumerate() {
        if inst.has_sig(Signals::THRSW) {
            // The second signal of a last-thrsw pair keeps the first's window.
            if !paired && last_thrsw.is_some_and(|prev| prev + 1 == ip) {
                paired = true;
            } else {
                if last_thrsw.is_some_and(|prev| prev + THRSW_DELAY_SLOTS as usize >= ip) {
                    return false;
                }
                paired = false;
                last_thrsw = Some(ip);
            }
            if ip + THRSW_DELAY_SLOTS as usize >= len {
                return false;
            }
        }
        if inst.is_branch() {
            if last_branch.is_some_and(|prev| prev + BRANCH_DELAY_SLOTS as usize >= ip) {
                return false;
            }
            if ip + BRANCH_DELAY_SLOTS as usize >= len {
                return false;
            }
            last_branch = Some(ip);
        }
    }
    true
}

/// V4: The k-th uniform-carrying instruction reads entry k, and the table
/// holds one entry per uniform read.
fn verify_v4_uniform_stream(program: &Program, schedule: &ScheduledProgram) -> bool {
    let reads = program
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| i.has_uniform())
        .count();
    if schedule.uniforms.len() != reads {
        return false;
    }
    schedule
        .instructions()
        .filter_map(|i| i.uniform)
        .enumerate()
        .all(|(k, u)| u as usize == k)
}

/// Successor instructions copied into a branch's delay slots.
fn is_delay_slot_copy(block: &ScheduledBlock, idx: usize) -> bool {
    let inst = &block.instructions[idx];
    if !inst.origins.is_empty() || inst.is_nop() || inst.has_sig(Signals::THRSW) {
        return false;
    }
    block.instructions[..idx].iter().any(Inst::is_branch)
}

/// V5: Replay the issued stream against a fresh scoreboard.
fn verify_v5_hazards(schedule: &ScheduledProgram) -> bool {
    let caps = schedule.device.caps();
    let mut sb = Scoreboard::new();
    for block in &schedule.blocks {
        for (idx, inst) in block.instructions.iter().enumerate() {
            // Copies execute ahead of the jump target, not in listing order.
            if is_delay_slot_copy(block, idx) {
                sb.tick += 1;
                continue;
            }
            if sb.reads_too_soon(&caps, inst) {
                return false;
            }
            if sb.tick - sb.last_magic_sfu_write_tick < 2 && inst.writes_r4(&caps) {
                return false;
            }
            sb.update_for_chosen(&caps, inst);
            sb.tick += 1;
        }
    }
    true
}
