// delay_slots.rs — Thread-switch and branch delay-slot packing
//
// A thrsw takes effect two instructions after it issues and a branch three
// instructions after. Rather than padding those windows with no-ops, the
// thrsw signal is merged back into an already emitted instruction and the
// branch is moved up past already emitted instructions, so that useful work
// fills the slots.
//
// Preconditions: the scoreboard describes the instructions already emitted
//   into `out`, which holds the current block only.
// Postconditions: a thrsw never starts inside another thrsw's window; a
//   branch's window is always three instructions long.
// Failure modes: a last thrsw without a following instruction (E0201).
// Side effects: appends no-ops to `out`; updates the scoreboard.

use crate::device::{Caps, ThrendRegisters};
use crate::diag::{codes, no_span, Diagnostic};
use crate::encoder::BundleEncoder;
use crate::inst::{AddOp, BranchCond, Inst, MulOp, Signals};
use crate::schedule::Scheduler;
use crate::scoreboard::Scoreboard;

/// Instructions issued after a thrsw before the thread actually switches.
pub const THRSW_DELAY_SLOTS: i32 = 2;
/// Instructions issued after a branch before it takes effect.
pub const BRANCH_DELAY_SLOTS: i32 = 3;

// ── Slot validity ──

/// Whether `inst` may sit in slot `slot` (0 = the thrsw itself) of the
/// program-end thread switch.
pub fn valid_in_thrend_slot(caps: &Caps, inst: &Inst, slot: i32) -> bool {
    if slot == 2 && inst.is_tlb_z_write {
        return false;
    }
    if slot > 0 && inst.has_uniform() {
        return false;
    }
    if caps.thrend_wait_restrictions && inst.waits_vpm() {
        return false;
    }
    if inst.has_sig(Signals::LDVARY) {
        return false;
    }

    let Some(alu) = inst.as_alu() else {
        return true;
    };

    if caps.thrend_wait_restrictions && slot == 2 && alu.add.op == AddOp::Tmuwt {
        return false;
    }
    if caps.thrend_slot0_magic_only
        && slot == 0
        && (alu.add.dest.magic().is_none() || alu.mul.dest.magic().is_none())
    {
        return false;
    }

    // Fragment setup may overwrite these registers during the slots.
    match caps.thrend_registers {
        ThrendRegisters::ReadsRf0To2 => {
            !inst.alu_writes_rf() && !inst.sig_writes_rf() && !(0..3).any(|r| inst.reads_rf(r))
        }
        ThrendRegisters::Rf2Rf3 => ![2, 3]
            .iter()
            .any(|&r| inst.reads_rf(r) || inst.writes_rf(r)),
    }
}

/// Whether an instruction emitted before a thrsw may end up in slot `slot`
/// once the signal is moved up into or above it.
pub fn valid_before_thrsw(sb: &Scoreboard, caps: &Caps, inst: &Inst, slot: i32) -> bool {
    // The SFU result would land in the other thread.
    if slot > 0 && inst.is_legacy_sfu() {
        return false;
    }
    if inst.has_sig(Signals::LDVARY) {
        let forbidden = if caps.ldvary_in_thrsw_slot_1 {
            slot == 2
        } else {
            slot > 0
        };
        if forbidden {
            return false;
        }
    }
    // unifa and the three instructions after it must not overlap a switch.
    if inst.writes_unifa() {
        return false;
    }
    if caps.implicit_rf0
        && slot == 2
        && inst.sig_writes_rf()
        && (sb.has_rf0_flops_conflict || sb.last_implicit_rf0_write_tick == sb.tick)
    {
        return false;
    }
    true
}

/// Whether an instruction scheduled after the last thrsw may issue inside
/// its delay slots, i.e. effectively before the switch happens.
pub fn valid_after_thrsw(sb: &Scoreboard, caps: &Caps, inst: &Inst) -> bool {
    let slot = sb.tick - sb.last_thrsw_tick;
    !inst.has_sig(Signals::THRSW)
        && valid_before_thrsw(sb, caps, inst, slot)
        && !inst.is_tlb()
        && !inst.is_branch()
        && !inst.writes_tmu()
        && !inst.has_sig(Signals::WRTMUC)
        && !inst.waits_on_tmu()
        && !inst.writes_accum(caps)
        && inst.mul_op() != MulOp::Multop
        && !inst.writes_flags()
        && inst.add_op() != AddOp::Barrierid
}

/// Check that `seq` (the merge point followed by every instruction emitted
/// after it) may form the thrsw and its delay slots.
pub fn valid_thrsw_sequence(sb: &Scoreboard, caps: &Caps, seq: &[Inst], is_thrend: bool) -> bool {
    seq.iter().enumerate().all(|(slot, inst)| {
        let slot = slot as i32;
        valid_before_thrsw(sb, caps, inst, slot)
            && (!is_thrend || valid_in_thrend_slot(caps, inst, slot))
    })
}

pub fn valid_in_branch_delay_slot(inst: &Inst) -> bool {
    !inst.is_branch()
        && !inst.has_sig(Signals::THRSW)
        && !inst.writes_unifa()
        && !inst.has_uniform()
}

// ── Emission ──

impl<E: BundleEncoder + ?Sized> Scheduler<'_, E> {
    /// Emit a thread switch, moving its signal as far up into `out` as the
    /// delay-slot rules allow. Returns the number of instructions appended.
    pub(crate) fn emit_thrsw(
        &mut self,
        out: &mut Vec<Inst>,
        inst: Inst,
        is_thrend: bool,
    ) -> Result<u32, Diagnostic> {
        let mut time = 0;

        // Never start inside the window of a previous thrsw or branch.
        while self.scoreboard.last_thrsw_tick + THRSW_DELAY_SLOTS >= self.scoreboard.tick {
            self.emit_nop(out);
            time += 1;
        }
        while self.scoreboard.last_branch_tick + BRANCH_DELAY_SLOTS >= self.scoreboard.tick {
            self.emit_nop(out);
            time += 1;
        }

        let mut slots_filled: i32 = 0;
        let mut invalid_sig = 0;
        let mut invalid_seq = 0;
        let mut last_thrsw_after_invalid_ok = false;
        let mut merge_at: Option<usize> = None;
        for idx in (0..out.len()).rev() {
            // The previous switch must have happened before ours is signalled.
            if self.scoreboard.last_thrsw_tick + 3 > self.scoreboard.tick - (slots_filled + 1) {
                break;
            }

            if !valid_thrsw_sequence(&self.scoreboard, &self.caps, &out[idx..], is_thrend) {
                invalid_seq += 1;
            } else if !self.encoder.sig_packable(&out[idx], Signals::THRSW) {
                invalid_sig += 1;
            } else if inst.is_last_thrsw && invalid_sig > 0 && !last_thrsw_after_invalid_ok {
                // A last thrsw needs two consecutive packable slots.
                last_thrsw_after_invalid_ok = true;
                invalid_sig += 1;
            } else {
                last_thrsw_after_invalid_ok = false;
                invalid_sig = 0;
                invalid_seq = 0;
                merge_at = Some(idx);
            }

            slots_filled += 1;
            if slots_filled == 3 {
                break;
            }
        }
        // Roll back to the last valid merge point.
        slots_filled -= invalid_sig + invalid_seq;

        let is_last_thrsw = inst.is_last_thrsw;
        let merge_at = match merge_at {
            Some(idx) => {
                let target = &mut out[idx];
                if let Some(alu) = target.as_alu_mut() {
                    alu.sigs.insert(Signals::THRSW);
                }
                target.origins.extend_from_slice(&inst.origins);
                self.scoreboard.last_thrsw_tick = self.scoreboard.tick - slots_filled;
                self.trace(|| format!("         thrsw merged {} slot(s) back", slots_filled));
                idx
            }
            None => {
                self.scoreboard.last_thrsw_tick = self.scoreboard.tick;
                self.insert_scheduled(out, inst);
                time += 1;
                slots_filled += 1;
                out.len() - 1
            }
        };

        self.scoreboard.first_thrsw_emitted = true;

        // The hardware recognizes the last switch by two thrsw in a row.
        if is_last_thrsw {
            if slots_filled <= 1 {
                self.emit_nop(out);
                time += 1;
            }
            let second = out
                .get_mut(merge_at + 1)
                .and_then(Inst::as_alu_mut)
                .ok_or_else(|| {
                    Diagnostic::error(
                        codes::E0201,
                        no_span(),
                        "no instruction after the last thread switch to carry its second signal",
                    )
                })?;
            second.sigs.insert(Signals::THRSW);
            self.scoreboard.last_thrsw_emitted = true;
        }

        // The thread end must complete inside the program.
        if is_thrend {
            for _ in slots_filled..3 {
                self.emit_nop(out);
                time += 1;
            }
        }

        Ok(time)
    }

    /// Emit a branch and move it up past earlier instructions of the block
    /// to fill its delay slots. Returns the branch's program-wide ip.
    pub(crate) fn emit_branch(&mut self, out: &mut Vec<Inst>, inst: Inst) -> u32 {
        let branch_tick = self.scoreboard.tick;
        let (cond, safe_after_setmsf) = inst
            .as_branch()
            .map(|b| (b.cond, b.is_safe_after_setmsf()))
            .unwrap_or((BranchCond::Always, true));
        let is_safe_msf = !self.caps.msf_branch_restricted || safe_after_setmsf;

        self.insert_scheduled(out, inst);

        let sb = &self.scoreboard;
        let mut slots_filled: i32 = 0;
        let mut pos = out.len() - 1;
        while slots_filled < BRANCH_DELAY_SLOTS && pos > 0 {
            let prev = &out[pos - 1];
            let landing = branch_tick - slots_filled - 1;

            if sb.last_branch_tick + BRANCH_DELAY_SLOTS >= landing
                || sb.last_thrsw_tick + THRSW_DELAY_SLOTS >= landing
                || sb.last_unifa_write_tick + 3 >= landing
            {
                break;
            }
            // Moving up could disrupt an ldvary sequence.
            if sb.last_ldvary_tick + 2 >= branch_tick - slots_filled {
                break;
            }
            if prev.writes_flags() && cond != BranchCond::Always {
                break;
            }
            if !valid_in_branch_delay_slot(prev) {
                break;
            }
            if !is_safe_msf && pos >= 2 && out[pos - 2].add_op() == AddOp::Setmsf {
                break;
            }

            out.swap(pos - 1, pos);
            pos -= 1;
            slots_filled += 1;
        }

        let branch_ip = self.inst_count - 1 - slots_filled as u32;
        self.scoreboard.last_branch_tick = branch_tick - slots_filled;
        for _ in slots_filled..BRANCH_DELAY_SLOTS {
            self.emit_nop(out);
        }
        branch_ip
    }
}
