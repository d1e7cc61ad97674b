// encoder.rs — Bundle encoding rules
//
// The scheduler asks the encoder three things: whether two instructions fit
// one physical bundle (and what the bundle looks like), whether a set of
// signal bits is encodable, and how to make a no-op. Packed 64-bit words
// are never produced; the rules below are the encodability constraints the
// packer would enforce.
//
// Preconditions: instructions passed resolve validation.
// Postconditions: `try_merge` never mutates its inputs; a returned bundle
//   carries both inputs' origins, uniform and TMU bookkeeping.
// Failure modes: none (an impossible merge is `None`).
// Side effects: none.

use crate::device::{Caps, PeripheralRules};
use crate::inst::{AddOp, Alu, Inst, InstKind, MulOp, Signals, Src};

const T: Signals = Signals::THRSW;
const U: Signals = Signals::LDUNIF;
const TMU: Signals = Signals::LDTMU;
const V: Signals = Signals::LDVARY;
const URF: Signals = Signals::LDUNIFRF;
const UA: Signals = Signals::LDUNIFA;
const UARF: Signals = Signals::LDUNIFARF;
const W: Signals = Signals::WRTMUC;

/// Encodable signal combinations on V4.1/V4.2.
pub static V41_SIG_MAP: [Signals; 27] = [
    Signals::NONE,
    T,
    U,
    T.or(U),
    TMU,
    T.or(TMU),
    TMU.or(U),
    T.or(TMU).or(U),
    V,
    T.or(V),
    V.or(U),
    T.or(V).or(U),
    URF,
    T.or(URF),
    Signals::SMIMM_B.or(V),
    Signals::SMIMM_B,
    Signals::LDTLB,
    Signals::LDTLBU,
    W,
    T.or(W),
    V.or(W),
    T.or(V).or(W),
    Signals::UCB,
    Signals::ROT,
    UA,
    UARF,
    Signals::SMIMM_B.or(TMU),
];

/// Encodable signal combinations on V7.1.
pub static V71_SIG_MAP: [Signals; 27] = [
    Signals::NONE,
    T,
    U,
    T.or(U),
    TMU,
    T.or(TMU),
    TMU.or(U),
    T.or(TMU).or(U),
    V,
    T.or(V),
    V.or(U),
    T.or(V).or(U),
    URF,
    T.or(URF),
    Signals::SMIMM_A,
    Signals::SMIMM_B,
    Signals::LDTLB,
    Signals::LDTLBU,
    W,
    T.or(W),
    V.or(W),
    T.or(V).or(W),
    Signals::UCB,
    UA,
    UARF,
    Signals::SMIMM_C,
    Signals::SMIMM_D,
];

// ── Peripherals ─────────────────────────────────────────────────────────────

/// Scarce peripheral accesses made by one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Peripherals(u16);

impl Peripherals {
    pub const NONE: Peripherals = Peripherals(0);
    pub const VPM_READ: Peripherals = Peripherals(1 << 0);
    pub const VPM_WRITE: Peripherals = Peripherals(1 << 1);
    pub const VPM_WAIT: Peripherals = Peripherals(1 << 2);
    pub const SFU: Peripherals = Peripherals(1 << 3);
    pub const TMU_WRITE: Peripherals = Peripherals(1 << 4);
    pub const TMU_WRTMUC_SIG: Peripherals = Peripherals(1 << 5);
    pub const TMU_WAIT: Peripherals = Peripherals(1 << 6);
    pub const TMU_READ: Peripherals = Peripherals(1 << 7);
    pub const TLB_READ: Peripherals = Peripherals(1 << 8);
    pub const TLB_WRITE: Peripherals = Peripherals(1 << 9);
    pub const TSY: Peripherals = Peripherals(1 << 10);

    /// Accesses of which a V7.1 bundle may hold only one.
    const RESTRICTED: Peripherals = Peripherals(
        Self::TMU_WRITE.0
            | Self::TMU_WRTMUC_SIG.0
            | Self::TSY.0
            | Self::TLB_READ.0
            | Self::SFU.0
            | Self::VPM_READ.0
            | Self::VPM_WRITE.0,
    );

    const TLB: Peripherals = Peripherals(Self::TLB_READ.0 | Self::TLB_WRITE.0);

    pub fn of(inst: &Inst) -> Peripherals {
        let mut p = Peripherals::NONE;
        if inst.as_alu().is_none() {
            return p;
        }
        if inst.writes_tmu() {
            p.0 |= Self::TMU_WRITE.0;
        }
        if inst.uses_sfu() {
            p.0 |= Self::SFU.0;
        }
        if inst.writes_tlb() {
            p.0 |= Self::TLB_WRITE.0;
        }
        if inst.writes_tsy() {
            p.0 |= Self::TSY.0;
        }
        if inst.reads_vpm() {
            p.0 |= Self::VPM_READ.0;
        }
        if inst.writes_vpm() {
            p.0 |= Self::VPM_WRITE.0;
        }
        if inst.waits_vpm() {
            p.0 |= Self::VPM_WAIT.0;
        }
        if inst.add_op() == AddOp::Tmuwt {
            p.0 |= Self::TMU_WAIT.0;
        }
        if inst.has_sig(Signals::LDTMU) {
            p.0 |= Self::TMU_READ.0;
        }
        if inst.reads_tlb() {
            p.0 |= Self::TLB_READ.0;
        }
        if inst.has_sig(Signals::WRTMUC) {
            p.0 |= Self::TMU_WRTMUC_SIG.0;
        }
        p
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    fn intersects(self, other: Peripherals) -> bool {
        self.0 & other.0 != 0
    }

    fn and(self, other: Peripherals) -> Peripherals {
        Peripherals(self.0 & other.0)
    }
}

/// Whether `a` and `b` may access their peripherals in the same bundle.
pub fn compatible_peripherals(caps: &Caps, a: &Inst, b: &Inst) -> bool {
    let pa = Peripherals::of(a);
    let pb = Peripherals::of(b);
    if pa.count() + pb.count() <= 1 {
        return true;
    }

    // WRTMUC travels with the TMU register write it configures.
    let wrtmuc_pair = (pa == Peripherals::TMU_WRTMUC_SIG
        && pb == Peripherals::TMU_WRITE
        && b.writes_tmu_not_tmuc())
        || (pb == Peripherals::TMU_WRTMUC_SIG
            && pa == Peripherals::TMU_WRITE
            && a.writes_tmu_not_tmuc());

    match caps.peripherals {
        PeripheralRules::SingleAccess => {
            let vpm = |p: Peripherals| p == Peripherals::VPM_READ || p == Peripherals::VPM_WRITE;
            wrtmuc_pair
                || (pa == Peripherals::TMU_READ && vpm(pb))
                || (pb == Peripherals::TMU_READ && vpm(pa))
        }
        PeripheralRules::Restricted => {
            let ra = pa.and(Peripherals::RESTRICTED);
            let rb = pb.and(Peripherals::RESTRICTED);
            if !ra.is_empty() && !rb.is_empty() {
                let wrtmuc_pair = (ra == Peripherals::TMU_WRTMUC_SIG
                    && rb == Peripherals::TMU_WRITE
                    && b.writes_tmu_not_tmuc())
                    || (rb == Peripherals::TMU_WRTMUC_SIG
                        && ra == Peripherals::TMU_WRITE
                        && a.writes_tmu_not_tmuc());
                if !wrtmuc_pair {
                    return false;
                }
            }
            if pa.intersects(Peripherals::TMU_READ) && pb.intersects(Peripherals::TMU_READ) {
                return false;
            }
            !(pa.intersects(Peripherals::TLB) && pb.intersects(Peripherals::TLB))
        }
    }
}

// ── Encoder ─────────────────────────────────────────────────────────────────

/// Encodability oracle used by the scheduler.
pub trait BundleEncoder {
    /// Combine `a` and `b` into one bundle, or `None` if they do not fit.
    fn try_merge(&self, a: &Inst, b: &Inst) -> Option<Inst>;

    /// Whether `inst`'s signals plus `extra` form an encodable combination.
    fn sig_packable(&self, inst: &Inst, extra: Signals) -> bool;

    fn is_nop(&self, inst: &Inst) -> bool {
        inst.is_nop()
    }

    fn nop(&self) -> Inst {
        Inst::nop()
    }
}

/// Encoder for one hardware generation.
#[derive(Debug, Clone, Copy)]
pub struct QpuEncoder {
    caps: Caps,
}

impl QpuEncoder {
    pub fn new(caps: Caps) -> Self {
        QpuEncoder { caps }
    }

    /// Small-immediate signal bits implied by the operands.
    fn small_imm_sigs(&self, alu: &Alu) -> Signals {
        let is_imm = |s: Option<Src>| matches!(s, Some(Src::SmallImm(_)));
        if self.caps.shared_read_ports {
            if alu.sources().any(|s| matches!(s, Src::SmallImm(_))) {
                Signals::SMIMM_B
            } else {
                Signals::NONE
            }
        } else {
            let add_n = alu.add.op.num_src();
            let mul_n = alu.mul.op.num_src();
            let mut sigs = Signals::NONE;
            if add_n >= 1 && is_imm(alu.add.a) {
                sigs.insert(Signals::SMIMM_A);
            }
            if add_n >= 2 && is_imm(alu.add.b) {
                sigs.insert(Signals::SMIMM_B);
            }
            if mul_n >= 1 && is_imm(alu.mul.a) {
                sigs.insert(Signals::SMIMM_C);
            }
            if mul_n >= 2 && is_imm(alu.mul.b) {
                sigs.insert(Signals::SMIMM_D);
            }
            sigs
        }
    }

    /// Whether the signal bits plus derived small-immediate bits encode.
    pub fn alu_sigs_packable(&self, alu: &Alu, extra: Signals) -> bool {
        let sigs = alu.sigs.or(extra).or(self.small_imm_sigs(alu));
        self.caps.sig_map.contains(&sigs)
    }

    /// Register-file read ports and small immediates needed by the bundle.
    pub fn read_ports_fit(&self, alu: &Alu) -> bool {
        let mut rf: Vec<u8> = Vec::new();
        let mut imms: Vec<u8> = Vec::new();
        for src in alu.sources() {
            match src {
                Src::Rf(n) if !rf.contains(&n) => rf.push(n),
                Src::SmallImm(i) if !imms.contains(&i) => imms.push(i),
                _ => {}
            }
        }
        if self.caps.shared_read_ports {
            rf.len() <= 2 && imms.len() <= 1 && (imms.is_empty() || rf.len() <= 1)
        } else {
            alu.sources()
                .filter(|s| matches!(s, Src::SmallImm(_)))
                .count()
                <= 1
        }
    }

    fn can_do_add_as_mul(op: AddOp) -> Option<MulOp> {
        match op {
            AddOp::Add => Some(MulOp::Add),
            AddOp::Sub => Some(MulOp::Sub),
            _ => None,
        }
    }

    fn can_do_mul_as_add(&self, op: MulOp) -> Option<AddOp> {
        if !self.caps.mov_to_add_slot {
            return None;
        }
        match op {
            MulOp::Mov => Some(AddOp::Mov),
            MulOp::Fmov => Some(AddOp::Fmov),
            _ => None,
        }
    }

    fn merge_alu(&self, a: &Alu, b: &Alu) -> Option<Alu> {
        let mut merged = a.clone();

        if !b.add.is_nop() {
            if merged.add.is_nop() {
                merged.add = b.add;
            } else if let (true, Some(op)) =
                (merged.mul.is_nop(), Self::can_do_add_as_mul(b.add.op))
            {
                merged.mul = b.add.with_op(op);
            } else if let (true, Some(op)) =
                (merged.mul.is_nop(), Self::can_do_add_as_mul(merged.add.op))
            {
                merged.mul = merged.add.with_op(op);
                merged.add = b.add;
            } else {
                return None;
            }
        }

        if !b.mul.is_nop() {
            if merged.mul.is_nop() {
                merged.mul = b.mul;
            } else if let (true, Some(op)) =
                (merged.add.is_nop(), self.can_do_mul_as_add(b.mul.op))
            {
                merged.add = b.mul.with_op(op);
            } else if let (true, Some(op)) =
                (merged.add.is_nop(), self.can_do_mul_as_add(merged.mul.op))
            {
                merged.add = merged.mul.with_op(op);
                merged.mul = b.mul;
            } else {
                return None;
            }
        }

        if !self.read_ports_fit(&merged) {
            return None;
        }

        if a.sig_writes_address() && b.sig_writes_address() {
            return None;
        }
        merged.sigs = a.sigs.or(b.sigs);
        merged.sig_dest = if a.sig_writes_address() {
            a.sig_dest
        } else {
            b.sig_dest
        };
        if !self.alu_sigs_packable(&merged, Signals::NONE) {
            return None;
        }
        Some(merged)
    }
}

impl BundleEncoder for QpuEncoder {
    fn try_merge(&self, a: &Inst, b: &Inst) -> Option<Inst> {
        let (InstKind::Alu(aa), InstKind::Alu(ba)) = (&a.kind, &b.kind) else {
            return None;
        };
        if !compatible_peripherals(&self.caps, a, b) {
            return None;
        }
        if a.has_uniform() && b.has_uniform() {
            return None;
        }
        let alu = self.merge_alu(aa, ba)?;

        let mut origins = a.origins.clone();
        origins.extend_from_slice(&b.origins);
        Some(Inst {
            kind: InstKind::Alu(alu),
            uniform: a.uniform.or(b.uniform),
            ldtmu_count: a.ldtmu_count + b.ldtmu_count,
            is_last_thrsw: a.is_last_thrsw || b.is_last_thrsw,
            is_tlb_z_write: a.is_tlb_z_write || b.is_tlb_z_write,
            origins,
        })
    }

    fn sig_packable(&self, inst: &Inst, extra: Signals) -> bool {
        match &inst.kind {
            InstKind::Alu(alu) => self.alu_sigs_packable(alu, extra),
            InstKind::Branch(_) => extra.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Generation;
    use crate::inst::{AluSlot, Dest, PushFlags, Waddr};

    fn enc(generation: Generation) -> QpuEncoder {
        QpuEncoder::new(Caps::for_generation(generation))
    }

    fn add(op: AddOp, dest: Dest, a: Src, b: Src) -> Inst {
        let mut alu = Alu::nop();
        alu.add = AluSlot::new(op, dest, Some(a), Some(b));
        let mut inst = Inst::alu(alu);
        inst.origins = vec![0];
        inst
    }

    fn mul(op: MulOp, dest: Dest, a: Src, b: Src) -> Inst {
        let mut alu = Alu::nop();
        alu.mul = AluSlot::new(op, dest, Some(a), Some(b));
        let mut inst = Inst::alu(alu);
        inst.origins = vec![1];
        inst
    }

    fn sig(sigs: Signals, dest: Option<Dest>) -> Inst {
        let mut alu = Alu::nop();
        alu.sigs = sigs;
        alu.sig_dest = dest;
        Inst::alu(alu)
    }

    #[test]
    fn add_and_mul_merge_into_one_bundle() {
        let a = add(AddOp::Fadd, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        let b = mul(MulOp::Fmul, Dest::Rf(4), Src::Rf(2), Src::Rf(3));
        let m = enc(Generation::V42).try_merge(&a, &b).unwrap();
        let alu = m.as_alu().unwrap();
        assert_eq!(alu.add.op, AddOp::Fadd);
        assert_eq!(alu.mul.op, MulOp::Fmul);
        assert_eq!(m.origins, vec![0, 1]);
    }

    #[test]
    fn second_add_converts_to_mul() {
        let a = add(AddOp::Fadd, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        let b = add(AddOp::Sub, Dest::Rf(4), Src::Rf(2), Src::Rf(3));
        let m = enc(Generation::V42).try_merge(&a, &b).unwrap();
        assert_eq!(m.mul_op(), MulOp::Sub);

        let c = add(AddOp::Fsub, Dest::Rf(4), Src::Rf(2), Src::Rf(3));
        assert!(enc(Generation::V42).try_merge(&a, &c).is_none());
    }

    #[test]
    fn flags_move_with_converted_slot() {
        let mut a = add(AddOp::Add, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        a.as_alu_mut().unwrap().add.pf = PushFlags::Pushz;
        let b = add(AddOp::Fadd, Dest::Rf(4), Src::Rf(2), Src::Rf(3));
        let m = enc(Generation::V42).try_merge(&a, &b).unwrap();
        let alu = m.as_alu().unwrap();
        assert_eq!(alu.mul.op, MulOp::Add);
        assert_eq!(alu.mul.pf, PushFlags::Pushz);
        assert_eq!(alu.add.pf, PushFlags::None);
    }

    #[test]
    fn mov_moves_to_add_slot_on_v71_only() {
        let mut a = mul(MulOp::Fmul, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        a.as_alu_mut().unwrap().mul.b = None;
        let mut b = mul(MulOp::Mov, Dest::Rf(4), Src::Rf(5), Src::Rf(5));
        b.as_alu_mut().unwrap().mul.b = None;
        assert!(enc(Generation::V42).try_merge(&a, &b).is_none());
        let m = enc(Generation::V71).try_merge(&a, &b).unwrap();
        assert_eq!(m.add_op(), AddOp::Mov);
    }

    #[test]
    fn v42_read_ports_limit_merges() {
        let a = add(AddOp::Fadd, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        let b = mul(MulOp::Fmul, Dest::Rf(4), Src::Rf(5), Src::Rf(6));
        assert!(enc(Generation::V42).try_merge(&a, &b).is_none());
        assert!(enc(Generation::V71).try_merge(&a, &b).is_some());

        let imm = mul(MulOp::Fmul, Dest::Rf(4), Src::Rf(2), Src::SmallImm(1));
        assert!(enc(Generation::V42).try_merge(&a, &imm).is_none());
    }

    #[test]
    fn two_address_writing_signals_do_not_merge() {
        let a = sig(Signals::LDTMU, Some(Dest::Rf(1)));
        let b = sig(Signals::LDVARY, Some(Dest::Rf(2)));
        assert!(enc(Generation::V71).try_merge(&a, &b).is_none());
        let c = sig(Signals::THRSW, None);
        let m = enc(Generation::V71).try_merge(&a, &c).unwrap();
        assert!(m.has_sig(Signals::LDTMU) && m.has_sig(Signals::THRSW));
        assert_eq!(m.as_alu().unwrap().sig_dest, Some(Dest::Rf(1)));
    }

    #[test]
    fn both_uniforms_do_not_merge() {
        let mut a = sig(Signals::LDUNIF, None);
        a.uniform = Some(0);
        let mut b = add(AddOp::Fadd, Dest::Rf(1), Src::Rf(2), Src::Rf(3));
        b.uniform = Some(1);
        assert!(enc(Generation::V42).try_merge(&a, &b).is_none());
    }

    #[test]
    fn sig_map_rejects_unencodable_combinations() {
        let e = enc(Generation::V42);
        let i = sig(Signals::LDTMU, Some(Dest::Rf(1)));
        assert!(e.sig_packable(&i, Signals::THRSW));
        let i = sig(Signals::LDUNIFA, None);
        assert!(!e.sig_packable(&i, Signals::THRSW));
        // V4.2 small immediates occupy the signal field.
        let imm = add(AddOp::Add, Dest::Rf(1), Src::Rf(2), Src::SmallImm(3));
        assert!(e.sig_packable(&imm, Signals::NONE));
        assert!(!e.sig_packable(&imm, Signals::THRSW));
    }

    #[test]
    fn peripheral_rules_differ_per_generation() {
        let tmu = add(AddOp::Or, Dest::Magic(Waddr::Tmud), Src::Rf(1), Src::Rf(1));
        let sfu = mul(MulOp::Add, Dest::Magic(Waddr::Recip), Src::Rf(2), Src::Rf(2));
        let ldtmu = sig(Signals::LDTMU, Some(Dest::Rf(3)));
        let v42 = Caps::for_generation(Generation::V42);
        let v71 = Caps::for_generation(Generation::V71);
        assert!(!compatible_peripherals(&v42, &tmu, &sfu));
        assert!(!compatible_peripherals(&v71, &tmu, &sfu));
        assert!(!compatible_peripherals(&v42, &tmu, &ldtmu));
        assert!(compatible_peripherals(&v71, &tmu, &ldtmu));

        let wrtmuc = sig(Signals::WRTMUC, None);
        assert!(compatible_peripherals(&v42, &wrtmuc, &tmu));
        let tmuc = add(AddOp::Or, Dest::Magic(Waddr::Tmuc), Src::Rf(1), Src::Rf(1));
        assert!(!compatible_peripherals(&v42, &wrtmuc, &tmuc));
    }
}
