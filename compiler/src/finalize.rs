// finalize.rs — Branch offsets and uniform-stream jumps
//
// Runs once every block has its final instruction pointers. For each block
// that branches: locate the branch in the block tail, set its byte offset to
// the first successor, rewrite its uniform to the relative jump in the
// uniform stream, and for unconditional branches copy the successor's
// leading instructions into the trailing no-op delay slots.
//
// Preconditions: `schedule` came from `schedule::schedule` without errors.
// Postconditions: every branch has `offset = Some(..)`; stats.nops matches
//   the final listing.
// Failure modes: a branch missing from its block tail (E0202), a block
//   without a branch that does not fall through (E0203), a second successor
//   that does not start right after the branch delay slots (E0204).
// Side effects: none.

use crate::delay_slots::{valid_in_branch_delay_slot, BRANCH_DELAY_SLOTS};
use crate::diag::{codes, no_span, Diagnostic};
use crate::encoder::BundleEncoder;
use crate::inst::{BranchCond, Inst};
use crate::program::ScheduledProgram;

/// Bytes per packed instruction.
pub const INST_BYTES: i32 = 8;
/// Bytes per uniform-stream entry.
pub const UNIFORM_BYTES: i32 = 4;

#[derive(Debug, Default)]
pub struct FinalizeResult {
    pub diagnostics: Vec<Diagnostic>,
}

/// Delay-slot layout of a block tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BranchTail {
    /// Index of the branch within the block.
    branch: usize,
    /// Index of the first trailing no-op, if any.
    slots_start: Option<usize>,
    /// No-op slots available for successor instructions.
    slot_count: usize,
}

/// Walk back from the second-to-last instruction looking for the branch.
fn find_branch<E: BundleEncoder + ?Sized>(encoder: &E, insts: &[Inst]) -> Option<BranchTail> {
    let mut slot_count: Option<usize> = None;
    let mut slots_start = None;
    for i in 0..BRANCH_DELAY_SLOTS as usize {
        let idx = insts.len().checked_sub(2 + i)?;
        let inst = &insts[idx];
        if slot_count.is_none() {
            if encoder.is_nop(inst) {
                slots_start = Some(idx);
            } else {
                slot_count = Some(i);
            }
        }
        if inst.is_branch() {
            return Some(BranchTail {
                branch: idx,
                slots_start,
                slot_count: slot_count.unwrap_or(i),
            });
        }
    }
    None
}

/// Resolve branch targets in place.
pub fn set_branch_targets<E: BundleEncoder + ?Sized>(
    schedule: &mut ScheduledProgram,
    encoder: &E,
) -> FinalizeResult {
    let mut result = FinalizeResult::default();

    for b in 0..schedule.blocks.len() {
        let block = &schedule.blocks[b];
        let Some(succ_id) = block.successors[0] else {
            continue;
        };
        let Some(succ) = schedule.blocks.get(succ_id.index()) else {
            continue;
        };
        let (succ_start_ip, succ_start_uniform) = (succ.start_ip, succ.start_uniform);

        let Some(branch_ip) = block.branch_ip else {
            if block.start_ip + block.len() as u32 != succ_start_ip {
                result.diagnostics.push(Diagnostic::error(
                    codes::E0203,
                    no_span(),
                    format!(
                        "block `{}` has no branch but `{}` does not follow it",
                        block.label, succ.label
                    ),
                ));
            }
            continue;
        };

        // The not-taken path runs straight past the delay slots.
        if let Some(fall) = block.successors[1] {
            let fall_block = schedule.blocks.get(fall.index());
            if fall_block.map(|f| f.start_ip) != Some(branch_ip + BRANCH_DELAY_SLOTS as u32 + 1) {
                result.diagnostics.push(Diagnostic::error(
                    codes::E0204,
                    no_span(),
                    format!(
                        "block `{}` falls through to `{}`, which does not follow its branch",
                        block.label,
                        fall_block.map_or("?", |f| f.label.as_str())
                    ),
                ));
            }
        }

        let Some(tail) = find_branch(encoder, &block.instructions) else {
            result.diagnostics.push(Diagnostic::error(
                codes::E0202,
                no_span(),
                format!("branch of block `{}` not found in its delay-slot tail", block.label),
            ));
            continue;
        };

        let mut offset = (succ_start_ip as i32 - (branch_ip as i32 + 4)) * INST_BYTES;

        let branch = &block.instructions[tail.branch];
        let cond = branch.as_branch().map_or(BranchCond::Always, |br| br.cond);
        if let (Some(u), Some(branch_uniform)) = (branch.uniform, block.branch_uniform) {
            let jump = (succ_start_uniform as i32 - (branch_uniform as i32 + 1)) * UNIFORM_BYTES;
            if let Some(entry) = schedule.uniforms.get_mut(u as usize) {
                entry.value = jump as u32;
            }
        }

        if cond == BranchCond::Always {
            if let Some(start) = tail.slots_start {
                let succ_insts = &schedule.blocks[succ_id.index()].instructions;
                let count = tail.slot_count.min(succ_insts.len());
                let fill: Vec<Inst> = succ_insts
                    .iter()
                    .take(count)
                    .take_while(|i| valid_in_branch_delay_slot(i))
                    .map(|i| {
                        let mut copy = i.clone();
                        // The original stays in the successor.
                        copy.origins.clear();
                        copy
                    })
                    .collect();
                offset += fill.len() as i32 * INST_BYTES;
                let block = &mut schedule.blocks[b];
                for (k, inst) in fill.into_iter().enumerate() {
                    block.instructions[start + k] = inst;
                }
            }
        }

        if let Some(br) = schedule.blocks[b].instructions[tail.branch].as_branch_mut() {
            br.offset = Some(offset);
        }
    }

    schedule.stats.nops = schedule.instructions().filter(|i| encoder.is_nop(i)).count() as u32;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, Generation};
    use crate::encoder::QpuEncoder;
    use crate::inst::{AddOp, Alu, AluSlot, Branch, Dest, MsfSign, Src};
    use crate::program::{BlockId, ScheduleStats, ScheduledBlock, Uniform};

    fn fadd(d: u8) -> Inst {
        let mut alu = Alu::nop();
        alu.add = AluSlot::new(AddOp::Fadd, Dest::Rf(d), Some(Src::Rf(1)), Some(Src::Rf(2)));
        Inst::alu(alu)
    }

    fn branch(cond: BranchCond, target: u32, uniform: u32) -> Inst {
        let mut b = Inst::branch(Branch {
            cond,
            msfign: MsfSign::None,
            target: BlockId(target),
            target_label: "t".into(),
            offset: None,
        });
        b.uniform = Some(uniform);
        b
    }

    fn encoder() -> QpuEncoder {
        QpuEncoder::new(DeviceInfo::new(Generation::V71).caps())
    }

    /// Block 0 ends in `branch ; nop ; nop ; nop` jumping to block 2, which
    /// follows a two-instruction block 1.
    fn three_blocks(cond: BranchCond) -> ScheduledProgram {
        let mut a = ScheduledBlock::new("a", [Some(BlockId(2)), None]);
        a.instructions = vec![fadd(1), branch(cond, 2, 0), Inst::nop(), Inst::nop(), Inst::nop()];
        a.end_ip = 4;
        a.branch_ip = Some(1);
        a.branch_uniform = Some(0);

        let mut b = ScheduledBlock::new("b", [Some(BlockId(2)), None]);
        b.instructions = vec![fadd(3), fadd(4)];
        b.start_ip = 5;
        b.end_ip = 6;
        b.start_uniform = 1;

        let mut c = ScheduledBlock::new("c", [None, None]);
        c.instructions = vec![fadd(5), fadd(6), fadd(7)];
        c.start_ip = 7;
        c.end_ip = 9;
        c.start_uniform = 1;

        ScheduledProgram {
            device: DeviceInfo::new(Generation::V71),
            uniforms: vec![Uniform::constant(0)],
            blocks: vec![a, b, c],
            stats: ScheduleStats::default(),
        }
    }

    #[test]
    fn unconditional_branch_backfills_from_successor() {
        let mut p = three_blocks(BranchCond::Always);
        let r = set_branch_targets(&mut p, &encoder());
        assert!(r.diagnostics.is_empty());
        let a = &p.blocks[0].instructions;
        // Two slots before the last one are filled; the last stays a nop.
        assert_eq!(a[2].to_string(), fadd(5).to_string());
        assert_eq!(a[3].to_string(), fadd(6).to_string());
        assert!(a[4].is_nop());
        assert!(a[2].origins.is_empty());
        let offset = a[1].as_branch().and_then(|b| b.offset);
        assert_eq!(offset, Some((7 - (1 + 4)) * 8 + 2 * 8));
        assert_eq!(p.uniforms[0].value, 0);
        assert_eq!(p.stats.nops, 1);
    }

    #[test]
    fn conditional_branch_keeps_its_slots() {
        let mut p = three_blocks(BranchCond::Anya);
        let r = set_branch_targets(&mut p, &encoder());
        assert!(r.diagnostics.is_empty());
        let a = &p.blocks[0].instructions;
        assert!(a[2].is_nop() && a[3].is_nop() && a[4].is_nop());
        assert_eq!(a[1].as_branch().and_then(|b| b.offset), Some(16));
    }

    #[test]
    fn uniform_jump_is_relative_to_the_branch_uniform() {
        let mut p = three_blocks(BranchCond::Anya);
        p.blocks[2].start_uniform = 4;
        set_branch_targets(&mut p, &encoder());
        assert_eq!(p.uniforms[0].value, ((4 - 1) * 4) as u32);
    }

    #[test]
    fn missing_fallthrough_is_reported() {
        let mut p = three_blocks(BranchCond::Always);
        p.blocks[1].successors = [Some(BlockId(0)), None];
        let r = set_branch_targets(&mut p, &encoder());
        assert_eq!(r.diagnostics.len(), 1);
        assert_eq!(r.diagnostics[0].code, Some(codes::E0203));
    }

    #[test]
    fn fallthrough_successor_must_follow_branch_slots() {
        let mut p = three_blocks(BranchCond::Anya);
        p.blocks[0].successors = [Some(BlockId(2)), Some(BlockId(1))];
        let r = set_branch_targets(&mut p, &encoder());
        assert!(r.diagnostics.is_empty());

        // Block 2 starts at ip 7, not right after the slots ending at ip 4.
        p.blocks[0].successors = [Some(BlockId(2)), Some(BlockId(2))];
        let r = set_branch_targets(&mut p, &encoder());
        assert_eq!(r.diagnostics.len(), 1);
        assert_eq!(r.diagnostics[0].code, Some(codes::E0204));
    }

    #[test]
    fn branch_outside_tail_is_reported() {
        let mut p = three_blocks(BranchCond::Always);
        p.blocks[0].instructions.push(Inst::nop());
        let r = set_branch_targets(&mut p, &encoder());
        assert_eq!(r.diagnostics[0].code, Some(codes::E0202));
    }
}
