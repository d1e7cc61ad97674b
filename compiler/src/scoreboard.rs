// scoreboard.rs — Timing hazard tracker shared by the whole program
//
// One `Scoreboard` lives across every block of a program. It remembers when
// the last SFU write, ldvary, unifa write, thread switch, branch and SETMSF
// were issued, and answers whether a candidate instruction may issue at the
// current tick without reading or writing a register too soon.
//
// Preconditions: instructions passed resolve validation.
// Postconditions: `update_for_chosen` followed by `tick += 1` is the only way
//   the tick advances.
// Failure modes: none.
// Side effects: none.

use crate::device::Caps;
use crate::inst::{AddOp, Dest, Inst, Signals, Src, Waddr};

/// Subtracted from a candidate's priority when issuing it would stall on an
/// SFU result. Larger than any regular priority.
pub const MAX_SCHEDULE_PRIORITY: i32 = 16;

/// Tick value meaning "long ago".
const NEVER: i32 = -10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoreboard {
    pub tick: i32,
    pub last_magic_sfu_write_tick: i32,
    /// Register written by the last add-slot SFU opcode.
    pub last_stallable_sfu_reg: Option<u8>,
    pub last_stallable_sfu_tick: i32,
    pub last_ldvary_tick: i32,
    pub last_unifa_write_tick: i32,
    pub last_thrsw_tick: i32,
    pub last_branch_tick: i32,
    pub last_setmsf_tick: i32,
    pub last_implicit_rf0_write_tick: i32,
    pub first_thrsw_emitted: bool,
    pub last_thrsw_emitted: bool,
    /// A paired ldvary is waiting for the pipelining fixup.
    pub fixup_ldvary: bool,
    pub first_ldtmu_after_thrsw: bool,
    /// An implicit rf0 write landed in the same tick as another register-file
    /// writing signal during the current thread section.
    pub has_rf0_flops_conflict: bool,
    pub ldvary_count: u32,
    /// TMU result words requested but not yet collected with ldtmu.
    pub pending_ldtmu_count: u32,
}

impl Default for Scoreboard {
    fn default() -> Self {
        Scoreboard {
            tick: 0,
            last_magic_sfu_write_tick: NEVER,
            last_stallable_sfu_reg: None,
            last_stallable_sfu_tick: NEVER,
            last_ldvary_tick: NEVER,
            last_unifa_write_tick: NEVER,
            last_thrsw_tick: NEVER,
            last_branch_tick: NEVER,
            last_setmsf_tick: NEVER,
            last_implicit_rf0_write_tick: NEVER,
            first_thrsw_emitted: false,
            last_thrsw_emitted: false,
            fixup_ldvary: false,
            first_ldtmu_after_thrsw: true,
            has_rf0_flops_conflict: false,
            ldvary_count: 0,
            pending_ldtmu_count: 0,
        }
    }
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ──

    fn src_reads_too_soon(&self, caps: &Caps, src: Src) -> bool {
        if caps.has_accumulators() {
            match src {
                Src::Acc(4) => self.tick - self.last_magic_sfu_write_tick <= 2,
                Src::Acc(5) => self.tick - self.last_ldvary_tick <= 1,
                _ => false,
            }
        } else {
            src == Src::Rf(0) && self.tick - self.last_ldvary_tick <= 1
        }
    }

    /// The instruction reads an SFU or ldvary result before it has landed.
    pub fn reads_too_soon(&self, caps: &Caps, inst: &Inst) -> bool {
        inst.as_alu()
            .is_some_and(|alu| alu.sources().any(|s| self.src_reads_too_soon(caps, s)))
    }

    /// The instruction writes a register another unit is about to write.
    pub fn writes_too_soon(&self, caps: &Caps, inst: &Inst) -> bool {
        if inst.is_branch() {
            return false;
        }
        if self.tick - self.last_magic_sfu_write_tick < 2 && inst.writes_r4(caps) {
            return true;
        }
        if !caps.implicit_rf0 {
            return false;
        }
        self.last_ldvary_tick + 1 == self.tick
            && (inst.writes_rf(0)
                || (inst.writes_rf0_implicitly(caps) && !inst.has_sig(Signals::LDVARY)))
    }

    /// Whether the pixel scoreboard is held by this thread.
    pub fn scoreboard_locked(&self, lock_on_first_thrsw: bool) -> bool {
        let emitted = if lock_on_first_thrsw {
            self.first_thrsw_emitted
        } else {
            self.last_thrsw_emitted
        };
        emitted && self.tick - self.last_thrsw_tick >= 3
    }

    pub fn pixel_scoreboard_too_soon(&self, lock_on_first_thrsw: bool, inst: &Inst) -> bool {
        inst.is_tlb() && !self.scoreboard_locked(lock_on_first_thrsw)
    }

    /// Issuing now would read the register an add-slot SFU op is still
    /// writing.
    pub fn read_stalls(&self, inst: &Inst) -> bool {
        self.tick == self.last_stallable_sfu_tick + 1
            && self
                .last_stallable_sfu_reg
                .is_some_and(|reg| inst.reads_rf(reg))
    }

    // ── Updates ──

    fn update_for_magic(&mut self, waddr: Waddr) {
        if waddr.is_sfu() {
            self.last_magic_sfu_write_tick = self.tick;
        } else if waddr == Waddr::Unifa {
            self.last_unifa_write_tick = self.tick;
        }
    }

    /// Record a register-file-writing signal landing together with an
    /// implicit rf0 write.
    pub fn set_rf0_flops_conflict(&mut self, inst: &Inst) {
        let sig_writes_rf = inst
            .as_alu()
            .and_then(|a| a.signal_dest())
            .is_some_and(|d| d.magic().is_none());
        if self.last_implicit_rf0_write_tick == self.tick && sig_writes_rf {
            self.has_rf0_flops_conflict = true;
        }
    }

    fn update_for_rf0_flops(&mut self, caps: &Caps, inst: &Inst) {
        if !caps.implicit_rf0 {
            return;
        }
        if inst.writes_rf(0) || self.tick - self.last_thrsw_tick == 3 {
            self.last_implicit_rf0_write_tick = NEVER;
            self.has_rf0_flops_conflict = false;
        }
        if inst.writes_rf0_implicitly(caps) {
            // ldvary's implicit write lands one tick late.
            self.last_implicit_rf0_write_tick = if inst.has_sig(Signals::LDVARY) {
                self.tick + 1
            } else {
                self.tick
            };
        }
        self.set_rf0_flops_conflict(inst);
    }

    fn update_tmu_tracking(&mut self, inst: &Inst) {
        if self.tick == self.last_thrsw_tick + 2 {
            self.first_ldtmu_after_thrsw = true;
        }
        self.pending_ldtmu_count += inst.ldtmu_count;
        if inst.has_sig(Signals::LDTMU) {
            self.pending_ldtmu_count = self.pending_ldtmu_count.saturating_sub(1);
            self.first_ldtmu_after_thrsw = false;
        }
    }

    /// Record the effects of `inst` being issued at the current tick. The
    /// caller advances the tick.
    pub fn update_for_chosen(&mut self, caps: &Caps, inst: &Inst) {
        let Some(alu) = inst.as_alu() else {
            return;
        };

        if !alu.add.is_nop() {
            match alu.add.dest {
                Dest::Magic(w) => self.update_for_magic(w),
                Dest::Rf(reg) => {
                    if inst.is_sfu() {
                        self.last_stallable_sfu_reg = Some(reg);
                        self.last_stallable_sfu_tick = self.tick;
                    }
                }
            }
            if alu.add.op == AddOp::Setmsf {
                self.last_setmsf_tick = self.tick;
            }
        }

        if let Some(Dest::Magic(w)) = alu.mul_dest() {
            self.update_for_magic(w);
        }

        if let Some(Dest::Magic(w)) = alu.signal_dest() {
            self.update_for_magic(w);
        }

        if alu.sigs.contains(Signals::LDVARY) {
            self.last_ldvary_tick = self.tick;
        }

        self.update_for_rf0_flops(caps, inst);
        self.update_tmu_tracking(inst);
    }
}

/// Baseline scheduling priority. TLB accesses go as late as possible.
pub fn instruction_priority(inst: &Inst) -> i32 {
    if inst.is_tlb() {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Generation;
    use crate::inst::{Alu, AluSlot};

    fn v42() -> Caps {
        Caps::for_generation(Generation::V42)
    }

    fn v71() -> Caps {
        Caps::for_generation(Generation::V71)
    }

    fn add(op: AddOp, dest: Dest, a: Option<Src>, b: Option<Src>) -> Inst {
        let mut alu = Alu::nop();
        alu.add = AluSlot::new(op, dest, a, b);
        Inst::alu(alu)
    }

    fn ldvary(dest: Dest) -> Inst {
        let mut alu = Alu::nop();
        alu.sigs = Signals::LDVARY;
        alu.sig_dest = Some(dest);
        Inst::alu(alu)
    }

    /// Issue `inst` and advance one tick.
    fn issue(sb: &mut Scoreboard, caps: &Caps, inst: &Inst) {
        sb.update_for_chosen(caps, inst);
        sb.tick += 1;
    }

    #[test]
    fn fresh_scoreboard_has_no_hazards() {
        let sb = Scoreboard::new();
        let c = v42();
        let read_r4 = add(AddOp::Fadd, Dest::Rf(1), Some(Src::Acc(4)), Some(Src::Acc(5)));
        assert!(!sb.reads_too_soon(&c, &read_r4));
        assert!(!sb.writes_too_soon(&c, &read_r4));
        assert!(sb.first_ldtmu_after_thrsw);
        assert_eq!(sb.last_thrsw_tick, -10);
    }

    #[test]
    fn r4_read_waits_two_ticks_after_magic_sfu() {
        let c = v42();
        let mut sb = Scoreboard::new();
        let recip = add(AddOp::Mov, Dest::Magic(Waddr::Recip), Some(Src::Rf(1)), None);
        let use_r4 = add(AddOp::Fadd, Dest::Rf(2), Some(Src::Acc(4)), Some(Src::Rf(3)));
        issue(&mut sb, &c, &recip);
        assert!(sb.reads_too_soon(&c, &use_r4));
        sb.tick += 1;
        assert!(sb.reads_too_soon(&c, &use_r4));
        sb.tick += 1;
        assert!(!sb.reads_too_soon(&c, &use_r4));
    }

    #[test]
    fn r4_writer_blocked_right_after_sfu() {
        let c = v42();
        let mut sb = Scoreboard::new();
        issue(
            &mut sb,
            &c,
            &add(AddOp::Mov, Dest::Magic(Waddr::Recip), Some(Src::Rf(1)), None),
        );
        let write_r4 = add(AddOp::Mov, Dest::Magic(Waddr::R4), Some(Src::Rf(1)), None);
        assert!(sb.writes_too_soon(&c, &write_r4));
        sb.tick += 1;
        assert!(!sb.writes_too_soon(&c, &write_r4));
    }

    #[test]
    fn rf0_hazards_after_ldvary_on_v71() {
        let c = v71();
        let mut sb = Scoreboard::new();
        issue(&mut sb, &c, &ldvary(Dest::Rf(5)));
        assert_eq!(sb.last_ldvary_tick, 0);
        assert_eq!(sb.last_implicit_rf0_write_tick, 1);

        let read_rf0 = add(AddOp::Fadd, Dest::Rf(2), Some(Src::Rf(0)), Some(Src::Rf(3)));
        let write_rf0 = add(AddOp::Fadd, Dest::Rf(0), Some(Src::Rf(1)), Some(Src::Rf(3)));
        let mut ldunif = Inst::nop();
        if let Some(a) = ldunif.as_alu_mut() {
            a.sigs = Signals::LDUNIF;
        }
        assert!(sb.reads_too_soon(&c, &read_rf0));
        assert!(sb.writes_too_soon(&c, &write_rf0));
        assert!(sb.writes_too_soon(&c, &ldunif));
        assert!(!sb.writes_too_soon(&c, &ldvary(Dest::Rf(6))));
        sb.tick += 1;
        assert!(!sb.reads_too_soon(&c, &read_rf0));
        assert!(!sb.writes_too_soon(&c, &write_rf0));
    }

    #[test]
    fn rf0_flops_conflict_and_reset() {
        let c = v71();
        let mut sb = Scoreboard::new();
        let mut ldunif = Inst::nop();
        if let Some(a) = ldunif.as_alu_mut() {
            a.sigs = Signals::LDUNIF.or(Signals::LDTMU);
            a.sig_dest = Some(Dest::Rf(7));
        }
        issue(&mut sb, &c, &ldunif);
        assert!(sb.has_rf0_flops_conflict);

        issue(
            &mut sb,
            &c,
            &add(AddOp::Mov, Dest::Rf(0), Some(Src::Rf(1)), None),
        );
        assert!(!sb.has_rf0_flops_conflict);
        assert_eq!(sb.last_implicit_rf0_write_tick, -10);
    }

    #[test]
    fn scoreboard_lock_follows_policy() {
        let mut sb = Scoreboard::new();
        let tlb = add(AddOp::Mov, Dest::Magic(Waddr::Tlb), Some(Src::Rf(1)), None);
        assert!(sb.pixel_scoreboard_too_soon(false, &tlb));

        sb.first_thrsw_emitted = true;
        sb.last_thrsw_tick = 4;
        sb.tick = 6;
        assert!(sb.pixel_scoreboard_too_soon(true, &tlb));
        sb.tick = 7;
        assert!(!sb.pixel_scoreboard_too_soon(true, &tlb));
        assert!(sb.pixel_scoreboard_too_soon(false, &tlb));

        sb.last_thrsw_emitted = true;
        assert!(!sb.pixel_scoreboard_too_soon(false, &tlb));
        assert!(!sb.pixel_scoreboard_too_soon(false, &Inst::nop()));
    }

    #[test]
    fn add_sfu_op_records_stallable_register() {
        let c = v71();
        let mut sb = Scoreboard::new();
        issue(
            &mut sb,
            &c,
            &add(AddOp::Recip, Dest::Rf(9), Some(Src::Rf(1)), None),
        );
        assert_eq!(sb.last_stallable_sfu_reg, Some(9));
        let reader = add(AddOp::Fadd, Dest::Rf(2), Some(Src::Rf(9)), Some(Src::Rf(3)));
        assert!(sb.read_stalls(&reader));
        assert!(!sb.read_stalls(&Inst::nop()));
        sb.tick += 1;
        assert!(!sb.read_stalls(&reader));
    }

    #[test]
    fn tmu_tracking_counts_results() {
        let c = v42();
        let mut sb = Scoreboard::new();
        let mut lookup = add(AddOp::Mov, Dest::Magic(Waddr::Tmua), Some(Src::Rf(1)), None);
        lookup.ldtmu_count = 2;
        issue(&mut sb, &c, &lookup);
        assert_eq!(sb.pending_ldtmu_count, 2);

        let mut ldtmu = Inst::nop();
        if let Some(a) = ldtmu.as_alu_mut() {
            a.sigs = Signals::LDTMU;
            a.sig_dest = Some(Dest::Rf(4));
        }
        issue(&mut sb, &c, &ldtmu);
        assert_eq!(sb.pending_ldtmu_count, 1);
        assert!(!sb.first_ldtmu_after_thrsw);
    }

    #[test]
    fn magic_writes_and_setmsf_record_ticks() {
        let c = v42();
        let mut sb = Scoreboard::new();
        sb.tick = 5;
        issue(
            &mut sb,
            &c,
            &add(AddOp::Mov, Dest::Magic(Waddr::Unifa), Some(Src::Rf(1)), None),
        );
        issue(&mut sb, &c, &add(AddOp::Setmsf, Dest::NOP, Some(Src::Rf(1)), None));
        assert_eq!(sb.last_unifa_write_tick, 5);
        assert_eq!(sb.last_setmsf_tick, 6);
        assert_eq!(sb.tick, 7);
    }

    #[test]
    fn tlb_access_has_lowest_priority() {
        let tlb = add(AddOp::Mov, Dest::Magic(Waddr::Tlb), Some(Src::Rf(1)), None);
        assert_eq!(instruction_priority(&tlb), 0);
        assert_eq!(instruction_priority(&Inst::nop()), 1);
    }
}
