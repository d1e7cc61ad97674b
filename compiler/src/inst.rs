// inst.rs — QPU instruction model
//
// One `Inst` is one hardware instruction: either an ALU bundle (add slot,
// mul slot, signal bits) or a branch. The predicates at the bottom answer
// the questions the dependency builder, scoreboard and delay-slot packer
// ask about an instruction; generation differences are taken from `Caps`.
//
// Preconditions: instructions are well formed (checked by `resolve`).
// Postconditions: none (types and pure queries only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::device::Caps;
use crate::program::BlockId;

// ── Opcodes ─────────────────────────────────────────────────────────────────

/// Add-slot opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddOp {
    Nop,
    Fadd,
    Faddnf,
    Fsub,
    Fmin,
    Fmax,
    Fcmp,
    Add,
    Sub,
    Min,
    Max,
    Umin,
    Umax,
    Shl,
    Shr,
    Asr,
    Ror,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Itof,
    Utof,
    Ftoiz,
    Ftouz,
    Fround,
    Ftrunc,
    Ffloor,
    Fceil,
    Fdx,
    Fdy,
    Clz,
    Mov,
    Fmov,
    Recip,
    Rsqrt,
    Exp,
    Log,
    Sin,
    Rsqrt2,
    Vfla,
    Vflna,
    Vflb,
    Vflnb,
    Flapush,
    Flbpush,
    Flafirst,
    Flnafirst,
    Tidx,
    Eidx,
    Sampid,
    Barrierid,
    Tmuwt,
    Vpmwt,
    Vpmsetup,
    Ldvpmv,
    Ldvpmd,
    Ldvpmg,
    Ldvpmp,
    Stvpmv,
    Stvpmd,
    Stvpmp,
    Msf,
    Setmsf,
    Setrevf,
}

const ADD_OPS: &[(AddOp, &str, u8)] = &[
    (AddOp::Nop, "nop", 0),
    (AddOp::Fadd, "fadd", 2),
    (AddOp::Faddnf, "faddnf", 2),
    (AddOp::Fsub, "fsub", 2),
    (AddOp::Fmin, "fmin", 2),
    (AddOp::Fmax, "fmax", 2),
    (AddOp::Fcmp, "fcmp", 2),
    (AddOp::Add, "add", 2),
    (AddOp::Sub, "sub", 2),
    (AddOp::Min, "min", 2),
    (AddOp::Max, "max", 2),
    (AddOp::Umin, "umin", 2),
    (AddOp::Umax, "umax", 2),
    (AddOp::Shl, "shl", 2),
    (AddOp::Shr, "shr", 2),
    (AddOp::Asr, "asr", 2),
    (AddOp::Ror, "ror", 2),
    (AddOp::And, "and", 2),
    (AddOp::Or, "or", 2),
    (AddOp::Xor, "xor", 2),
    (AddOp::Not, "not", 1),
    (AddOp::Neg, "neg", 1),
    (AddOp::Itof, "itof", 1),
    (AddOp::Utof, "utof", 1),
    (AddOp::Ftoiz, "ftoiz", 1),
    (AddOp::Ftouz, "ftouz", 1),
    (AddOp::Fround, "fround", 1),
    (AddOp::Ftrunc, "ftrunc", 1),
    (AddOp::Ffloor, "ffloor", 1),
    (AddOp::Fceil, "fceil", 1),
    (AddOp::Fdx, "fdx", 1),
    (AddOp::Fdy, "fdy", 1),
    (AddOp::Clz, "clz", 1),
    (AddOp::Mov, "mov", 1),
    (AddOp::Fmov, "fmov", 1),
    (AddOp::Recip, "recip", 1),
    (AddOp::Rsqrt, "rsqrt", 1),
    (AddOp::Exp, "exp", 1),
    (AddOp::Log, "log", 1),
    (AddOp::Sin, "sin", 1),
    (AddOp::Rsqrt2, "rsqrt2", 1),
    (AddOp::Vfla, "vfla", 0),
    (AddOp::Vflna, "vflna", 0),
    (AddOp::Vflb, "vflb", 0),
    (AddOp::Vflnb, "vflnb", 0),
    (AddOp::Flapush, "flapush", 1),
    (AddOp::Flbpush, "flbpush", 1),
    (AddOp::Flafirst, "flafirst", 0),
    (AddOp::Flnafirst, "flnafirst", 0),
    (AddOp::Tidx, "tidx", 0),
    (AddOp::Eidx, "eidx", 0),
    (AddOp::Sampid, "sampid", 0),
    (AddOp::Barrierid, "barrierid", 0),
    (AddOp::Tmuwt, "tmuwt", 0),
    (AddOp::Vpmwt, "vpmwt", 0),
    (AddOp::Vpmsetup, "vpmsetup", 1),
    (AddOp::Ldvpmv, "ldvpmv", 1),
    (AddOp::Ldvpmd, "ldvpmd", 1),
    (AddOp::Ldvpmg, "ldvpmg", 1),
    (AddOp::Ldvpmp, "ldvpmp", 1),
    (AddOp::Stvpmv, "stvpmv", 2),
    (AddOp::Stvpmd, "stvpmd", 2),
    (AddOp::Stvpmp, "stvpmp", 2),
    (AddOp::Msf, "msf", 0),
    (AddOp::Setmsf, "setmsf", 1),
    (AddOp::Setrevf, "setrevf", 1),
];

impl AddOp {
    pub fn from_name(name: &str) -> Option<Self> {
        ADD_OPS.iter().find(|(_, n, _)| *n == name).map(|(op, _, _)| *op)
    }

    fn entry(self) -> &'static (AddOp, &'static str, u8) {
        ADD_OPS
            .iter()
            .find(|(op, _, _)| *op == self)
            .unwrap_or(&ADD_OPS[0])
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    pub fn num_src(self) -> usize {
        self.entry().2 as usize
    }

    /// Add opcodes that drive the special function unit directly.
    pub fn is_sfu(self) -> bool {
        matches!(
            self,
            AddOp::Recip | AddOp::Rsqrt | AddOp::Exp | AddOp::Log | AddOp::Sin | AddOp::Rsqrt2
        )
    }

    /// Opcodes that implicitly read the condition flags.
    pub fn reads_flags(self) -> bool {
        matches!(
            self,
            AddOp::Vfla
                | AddOp::Vflna
                | AddOp::Vflb
                | AddOp::Vflnb
                | AddOp::Flapush
                | AddOp::Flbpush
                | AddOp::Flafirst
                | AddOp::Flnafirst
        )
    }

    pub fn reads_vpm(self) -> bool {
        matches!(
            self,
            AddOp::Vpmsetup | AddOp::Ldvpmv | AddOp::Ldvpmd | AddOp::Ldvpmg | AddOp::Ldvpmp
        )
    }

    pub fn writes_vpm(self) -> bool {
        matches!(
            self,
            AddOp::Vpmsetup | AddOp::Stvpmv | AddOp::Stvpmd | AddOp::Stvpmp
        )
    }

    /// Opcodes only encodable when the add ALU hosts the SFU and moves.
    pub fn requires_v71(self) -> bool {
        self.is_sfu() || matches!(self, AddOp::Mov | AddOp::Fmov)
    }
}

/// Mul-slot opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulOp {
    Nop,
    Add,
    Sub,
    Umul24,
    Smul24,
    Vfmul,
    Multop,
    Fmul,
    Mov,
    Fmov,
}

const MUL_OPS: &[(MulOp, &str, u8)] = &[
    (MulOp::Nop, "nop", 0),
    (MulOp::Add, "add", 2),
    (MulOp::Sub, "sub", 2),
    (MulOp::Umul24, "umul24", 2),
    (MulOp::Smul24, "smul24", 2),
    (MulOp::Vfmul, "vfmul", 2),
    (MulOp::Multop, "multop", 2),
    (MulOp::Fmul, "fmul", 2),
    (MulOp::Mov, "mov", 1),
    (MulOp::Fmov, "fmov", 1),
];

impl MulOp {
    pub fn from_name(name: &str) -> Option<Self> {
        MUL_OPS.iter().find(|(_, n, _)| *n == name).map(|(op, _, _)| *op)
    }

    fn entry(self) -> &'static (MulOp, &'static str, u8) {
        MUL_OPS
            .iter()
            .find(|(op, _, _)| *op == self)
            .unwrap_or(&MUL_OPS[0])
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    pub fn num_src(self) -> usize {
        self.entry().2 as usize
    }
}

// ── Registers ───────────────────────────────────────────────────────────────

/// Magic (non register-file) write addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waddr {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    Nop,
    Tlb,
    Tlbu,
    Tmud,
    Tmua,
    Tmuau,
    Tmuc,
    Tmus,
    Tmut,
    Tmur,
    Tmui,
    Tmub,
    Tmudref,
    Tmuoff,
    Tmuscm,
    Tmusf,
    Tmuslod,
    Tmuhs,
    Tmuhscm,
    Tmuhsf,
    Tmuhslod,
    Vpm,
    Vpmu,
    Sync,
    Syncb,
    Syncu,
    Recip,
    Rsqrt,
    Exp,
    Log,
    Sin,
    Rsqrt2,
    Unifa,
}

const WADDRS: &[(Waddr, &str)] = &[
    (Waddr::R0, "r0"),
    (Waddr::R1, "r1"),
    (Waddr::R2, "r2"),
    (Waddr::R3, "r3"),
    (Waddr::R4, "r4"),
    (Waddr::R5, "r5"),
    (Waddr::Nop, "nop"),
    (Waddr::Tlb, "tlb"),
    (Waddr::Tlbu, "tlbu"),
    (Waddr::Tmud, "tmud"),
    (Waddr::Tmua, "tmua"),
    (Waddr::Tmuau, "tmuau"),
    (Waddr::Tmuc, "tmuc"),
    (Waddr::Tmus, "tmus"),
    (Waddr::Tmut, "tmut"),
    (Waddr::Tmur, "tmur"),
    (Waddr::Tmui, "tmui"),
    (Waddr::Tmub, "tmub"),
    (Waddr::Tmudref, "tmudref"),
    (Waddr::Tmuoff, "tmuoff"),
    (Waddr::Tmuscm, "tmuscm"),
    (Waddr::Tmusf, "tmusf"),
    (Waddr::Tmuslod, "tmuslod"),
    (Waddr::Tmuhs, "tmuhs"),
    (Waddr::Tmuhscm, "tmuhscm"),
    (Waddr::Tmuhsf, "tmuhsf"),
    (Waddr::Tmuhslod, "tmuhslod"),
    (Waddr::Vpm, "vpm"),
    (Waddr::Vpmu, "vpmu"),
    (Waddr::Sync, "sync"),
    (Waddr::Syncb, "syncb"),
    (Waddr::Syncu, "syncu"),
    (Waddr::Recip, "recip"),
    (Waddr::Rsqrt, "rsqrt"),
    (Waddr::Exp, "exp"),
    (Waddr::Log, "log"),
    (Waddr::Sin, "sin"),
    (Waddr::Rsqrt2, "rsqrt2"),
    (Waddr::Unifa, "unifa"),
];

impl Waddr {
    pub fn from_name(name: &str) -> Option<Self> {
        WADDRS.iter().find(|(_, n)| *n == name).map(|(w, _)| *w)
    }

    pub fn name(self) -> &'static str {
        WADDRS
            .iter()
            .find(|(w, _)| *w == self)
            .map(|(_, n)| *n)
            .unwrap_or("?")
    }

    /// Accumulator index for r0..r5.
    pub fn accumulator(self) -> Option<u8> {
        match self {
            Waddr::R0 => Some(0),
            Waddr::R1 => Some(1),
            Waddr::R2 => Some(2),
            Waddr::R3 => Some(3),
            Waddr::R4 => Some(4),
            Waddr::R5 => Some(5),
            _ => None,
        }
    }

    pub fn accumulator_from_index(n: u8) -> Option<Self> {
        match n {
            0 => Some(Waddr::R0),
            1 => Some(Waddr::R1),
            2 => Some(Waddr::R2),
            3 => Some(Waddr::R3),
            4 => Some(Waddr::R4),
            5 => Some(Waddr::R5),
            _ => None,
        }
    }

    pub fn is_tmu(self) -> bool {
        matches!(
            self,
            Waddr::Tmud
                | Waddr::Tmua
                | Waddr::Tmuau
                | Waddr::Tmuc
                | Waddr::Tmus
                | Waddr::Tmut
                | Waddr::Tmur
                | Waddr::Tmui
                | Waddr::Tmub
                | Waddr::Tmudref
                | Waddr::Tmuoff
                | Waddr::Tmuscm
                | Waddr::Tmusf
                | Waddr::Tmuslod
                | Waddr::Tmuhs
                | Waddr::Tmuhscm
                | Waddr::Tmuhsf
                | Waddr::Tmuhslod
        )
    }

    /// TMU writes that end a lookup sequence and start the request.
    pub fn is_tmu_sequence_terminator(self) -> bool {
        matches!(
            self,
            Waddr::Tmus | Waddr::Tmuscm | Waddr::Tmusf | Waddr::Tmuslod | Waddr::Tmua | Waddr::Tmuau
        )
    }

    /// TMU writes that may be reordered inside their lookup sequence.
    pub fn is_reorderable_tmu_write(self) -> bool {
        self.is_tmu() && !self.is_tmu_sequence_terminator() && self != Waddr::Tmud
    }

    pub fn is_sfu(self) -> bool {
        matches!(
            self,
            Waddr::Recip | Waddr::Rsqrt | Waddr::Exp | Waddr::Log | Waddr::Sin | Waddr::Rsqrt2
        )
    }

    pub fn is_tsy(self) -> bool {
        matches!(self, Waddr::Sync | Waddr::Syncb | Waddr::Syncu)
    }

    pub fn is_tlb(self) -> bool {
        matches!(self, Waddr::Tlb | Waddr::Tlbu)
    }

    pub fn is_vpm(self) -> bool {
        matches!(self, Waddr::Vpm | Waddr::Vpmu)
    }
}

/// Write destination of an ALU slot or address-writing signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dest {
    Rf(u8),
    Magic(Waddr),
}

impl Dest {
    pub const NOP: Dest = Dest::Magic(Waddr::Nop);

    pub fn magic(self) -> Option<Waddr> {
        match self {
            Dest::Magic(w) => Some(w),
            Dest::Rf(_) => None,
        }
    }

    pub fn rf(self) -> Option<u8> {
        match self {
            Dest::Rf(n) => Some(n),
            Dest::Magic(_) => None,
        }
    }
}

impl fmt::Display for Dest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dest::Rf(n) => write!(f, "rf{}", n),
            Dest::Magic(w) => f.write_str(w.name()),
        }
    }
}

/// Encodable small immediates, by packed index.
pub const SMALL_IMMEDIATES: [u32; 48] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
    (-16i32) as u32, (-15i32) as u32, (-14i32) as u32, (-13i32) as u32,
    (-12i32) as u32, (-11i32) as u32, (-10i32) as u32, (-9i32) as u32,
    (-8i32) as u32, (-7i32) as u32, (-6i32) as u32, (-5i32) as u32,
    (-4i32) as u32, (-3i32) as u32, (-2i32) as u32, (-1i32) as u32,
    0x3b80_0000, 0x3c00_0000, 0x3c80_0000, 0x3d00_0000,
    0x3d80_0000, 0x3e00_0000, 0x3e80_0000, 0x3f00_0000,
    0x3f80_0000, 0x4000_0000, 0x4080_0000, 0x4100_0000,
    0x4180_0000, 0x4200_0000, 0x4280_0000, 0x4300_0000,
];

/// Look up the packed index of an integer small immediate.
pub fn small_imm_from_int(value: i64) -> Option<u8> {
    if (-16..=15).contains(&value) {
        let bits = value as i32 as u32;
        SMALL_IMMEDIATES.iter().position(|&v| v == bits).map(|i| i as u8)
    } else {
        None
    }
}

/// Look up the packed index of a float small immediate (powers of two).
pub fn small_imm_from_float(value: f64) -> Option<u8> {
    let bits = (value as f32).to_bits();
    SMALL_IMMEDIATES[32..]
        .iter()
        .position(|&v| v == bits)
        .map(|i| (i + 32) as u8)
}

/// ALU source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Src {
    /// Accumulator r0..r5.
    Acc(u8),
    /// Register file entry rf0..rf63.
    Rf(u8),
    /// Small immediate by packed index into `SMALL_IMMEDIATES`.
    SmallImm(u8),
}

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Src::Acc(n) => write!(f, "r{}", n),
            Src::Rf(n) => write!(f, "rf{}", n),
            Src::SmallImm(i) => {
                let i = i as usize;
                let bits = SMALL_IMMEDIATES.get(i).copied().unwrap_or(0);
                if i < 32 {
                    write!(f, "{}", bits as i32)
                } else {
                    write!(f, "{:?}", f32::from_bits(bits))
                }
            }
        }
    }
}

// ── Flags ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cond {
    #[default]
    None,
    Ifa,
    Ifb,
    Ifna,
    Ifnb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PushFlags {
    #[default]
    None,
    Pushz,
    Pushn,
    Pushc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateFlags {
    #[default]
    None,
    Andz,
    Andnz,
    Nornz,
    Norz,
    Andn,
    Andnn,
    Nornn,
    Norn,
    Andc,
    Andnc,
    Nornc,
    Norc,
}

const CONDS: &[(Cond, &str)] = &[
    (Cond::Ifa, "ifa"),
    (Cond::Ifb, "ifb"),
    (Cond::Ifna, "ifna"),
    (Cond::Ifnb, "ifnb"),
];

const PUSH_FLAGS: &[(PushFlags, &str)] = &[
    (PushFlags::Pushz, "pushz"),
    (PushFlags::Pushn, "pushn"),
    (PushFlags::Pushc, "pushc"),
];

const UPDATE_FLAGS: &[(UpdateFlags, &str)] = &[
    (UpdateFlags::Andz, "andz"),
    (UpdateFlags::Andnz, "andnz"),
    (UpdateFlags::Nornz, "nornz"),
    (UpdateFlags::Norz, "norz"),
    (UpdateFlags::Andn, "andn"),
    (UpdateFlags::Andnn, "andnn"),
    (UpdateFlags::Nornn, "nornn"),
    (UpdateFlags::Norn, "norn"),
    (UpdateFlags::Andc, "andc"),
    (UpdateFlags::Andnc, "andnc"),
    (UpdateFlags::Nornc, "nornc"),
    (UpdateFlags::Norc, "norc"),
];

/// An opcode suffix: condition, push-flags or update-flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSuffix {
    Cond(Cond),
    Push(PushFlags),
    Update(UpdateFlags),
}

impl FlagSuffix {
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some((c, _)) = CONDS.iter().find(|(_, n)| *n == name) {
            return Some(FlagSuffix::Cond(*c));
        }
        if let Some((p, _)) = PUSH_FLAGS.iter().find(|(_, n)| *n == name) {
            return Some(FlagSuffix::Push(*p));
        }
        UPDATE_FLAGS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(u, _)| FlagSuffix::Update(*u))
    }
}

fn cond_name(c: Cond) -> Option<&'static str> {
    CONDS.iter().find(|(x, _)| *x == c).map(|(_, n)| *n)
}

fn push_name(p: PushFlags) -> Option<&'static str> {
    PUSH_FLAGS.iter().find(|(x, _)| *x == p).map(|(_, n)| *n)
}

fn update_name(u: UpdateFlags) -> Option<&'static str> {
    UPDATE_FLAGS.iter().find(|(x, _)| *x == u).map(|(_, n)| *n)
}

// ── Signals ─────────────────────────────────────────────────────────────────

/// Set of signal bits carried by an ALU instruction.
///
/// The small-immediate bits are never stored on an instruction; the encoder
/// derives them from the operands when checking packability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signals(u16);

impl Signals {
    pub const NONE: Signals = Signals(0);
    pub const THRSW: Signals = Signals(1 << 0);
    pub const LDUNIF: Signals = Signals(1 << 1);
    pub const LDUNIFA: Signals = Signals(1 << 2);
    pub const LDUNIFRF: Signals = Signals(1 << 3);
    pub const LDUNIFARF: Signals = Signals(1 << 4);
    pub const LDTMU: Signals = Signals(1 << 5);
    pub const LDVARY: Signals = Signals(1 << 6);
    pub const LDTLB: Signals = Signals(1 << 7);
    pub const LDTLBU: Signals = Signals(1 << 8);
    pub const UCB: Signals = Signals(1 << 9);
    pub const ROT: Signals = Signals(1 << 10);
    pub const WRTMUC: Signals = Signals(1 << 11);
    pub const SMIMM_A: Signals = Signals(1 << 12);
    pub const SMIMM_B: Signals = Signals(1 << 13);
    pub const SMIMM_C: Signals = Signals(1 << 14);
    pub const SMIMM_D: Signals = Signals(1 << 15);

    /// Signals that write their result to `sig_dest`.
    pub const WRITES_ADDRESS: Signals = Signals(
        Self::LDUNIFRF.0
            | Self::LDUNIFARF.0
            | Self::LDVARY.0
            | Self::LDTMU.0
            | Self::LDTLB.0
            | Self::LDTLBU.0,
    );

    pub const SMALL_IMMS: Signals =
        Signals(Self::SMIMM_A.0 | Self::SMIMM_B.0 | Self::SMIMM_C.0 | Self::SMIMM_D.0);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn or(self, other: Signals) -> Signals {
        Signals(self.0 | other.0)
    }

    pub const fn contains(self, other: Signals) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Signals) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Signals) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Signals) {
        self.0 &= !other.0;
    }

    pub fn from_name(name: &str) -> Option<Signals> {
        SIGNAL_NAMES.iter().find(|(_, n)| *n == name).map(|(s, _)| *s)
    }

    /// Individual signal bits in display order.
    pub fn iter(self) -> impl Iterator<Item = (Signals, &'static str)> {
        SIGNAL_NAMES
            .iter()
            .copied()
            .filter(move |(s, _)| self.contains(*s))
    }
}

const SIGNAL_NAMES: &[(Signals, &str)] = &[
    (Signals::THRSW, "thrsw"),
    (Signals::LDUNIF, "ldunif"),
    (Signals::LDUNIFA, "ldunifa"),
    (Signals::LDUNIFRF, "ldunifrf"),
    (Signals::LDUNIFARF, "ldunifarf"),
    (Signals::LDTMU, "ldtmu"),
    (Signals::LDVARY, "ldvary"),
    (Signals::LDTLB, "ldtlb"),
    (Signals::LDTLBU, "ldtlbu"),
    (Signals::UCB, "ucb"),
    (Signals::ROT, "rot"),
    (Signals::WRTMUC, "wrtmuc"),
];

// ── Branch ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BranchCond {
    #[default]
    Always,
    A0,
    Na0,
    Alla,
    Anyna,
    Anya,
    Allna,
}

const BRANCH_CONDS: &[(BranchCond, &str)] = &[
    (BranchCond::Always, "always"),
    (BranchCond::A0, "a0"),
    (BranchCond::Na0, "na0"),
    (BranchCond::Alla, "alla"),
    (BranchCond::Anyna, "anyna"),
    (BranchCond::Anya, "anya"),
    (BranchCond::Allna, "allna"),
];

impl BranchCond {
    pub fn from_name(name: &str) -> Option<Self> {
        BRANCH_CONDS.iter().find(|(_, n)| *n == name).map(|(c, _)| *c)
    }

    pub fn name(self) -> &'static str {
        BRANCH_CONDS
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, n)| *n)
            .unwrap_or("always")
    }
}

/// Multisample-flag sign for branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MsfSign {
    #[default]
    None,
    P,
    Q,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub cond: BranchCond,
    pub msfign: MsfSign,
    /// First successor: the block jumped to when the branch is taken.
    pub target: BlockId,
    pub target_label: String,
    /// Byte offset from the end of the delay slots, set by finalization.
    pub offset: Option<i32>,
}

impl Branch {
    /// A branch whose condition and msfign combination is safe right after
    /// SETMSF.
    pub fn is_safe_after_setmsf(&self) -> bool {
        self.msfign == MsfSign::None
            || matches!(
                self.cond,
                BranchCond::Always | BranchCond::A0 | BranchCond::Na0
            )
    }
}

// ── ALU slots ───────────────────────────────────────────────────────────────

/// One ALU slot: opcode, destination, sources and flag fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AluSlot<Op> {
    pub op: Op,
    pub dest: Dest,
    pub a: Option<Src>,
    pub b: Option<Src>,
    pub cond: Cond,
    pub pf: PushFlags,
    pub uf: UpdateFlags,
}

impl<Op: Copy> AluSlot<Op> {
    pub fn new(op: Op, dest: Dest, a: Option<Src>, b: Option<Src>) -> Self {
        AluSlot {
            op,
            dest,
            a,
            b,
            cond: Cond::None,
            pf: PushFlags::None,
            uf: UpdateFlags::None,
        }
    }

    /// Same operands and flags under another opcode.
    pub fn with_op<Other>(&self, op: Other) -> AluSlot<Other> {
        AluSlot {
            op,
            dest: self.dest,
            a: self.a,
            b: self.b,
            cond: self.cond,
            pf: self.pf,
            uf: self.uf,
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = Src> + '_ {
        self.a.iter().chain(self.b.iter()).copied()
    }

    pub fn reads_flags(&self) -> bool {
        self.cond != Cond::None || self.uf != UpdateFlags::None
    }

    pub fn writes_flags(&self) -> bool {
        self.pf != PushFlags::None || self.uf != UpdateFlags::None
    }
}

pub type AddSlot = AluSlot<AddOp>;
pub type MulSlot = AluSlot<MulOp>;

impl AddSlot {
    pub fn nop() -> Self {
        AluSlot::new(AddOp::Nop, Dest::NOP, None, None)
    }

    pub fn is_nop(&self) -> bool {
        self.op == AddOp::Nop
    }
}

impl MulSlot {
    pub fn nop() -> Self {
        AluSlot::new(MulOp::Nop, Dest::NOP, None, None)
    }

    pub fn is_nop(&self) -> bool {
        self.op == MulOp::Nop
    }
}

/// The ALU form of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alu {
    pub add: AddSlot,
    pub mul: MulSlot,
    pub sigs: Signals,
    /// Destination of the address-writing signal, if any.
    pub sig_dest: Option<Dest>,
}

impl Alu {
    pub fn nop() -> Self {
        Alu {
            add: AddSlot::nop(),
            mul: MulSlot::nop(),
            sigs: Signals::NONE,
            sig_dest: None,
        }
    }

    pub fn add_dest(&self) -> Option<Dest> {
        (!self.add.is_nop()).then_some(self.add.dest)
    }

    pub fn mul_dest(&self) -> Option<Dest> {
        (!self.mul.is_nop()).then_some(self.mul.dest)
    }

    pub fn sig_writes_address(&self) -> bool {
        self.sigs.intersects(Signals::WRITES_ADDRESS)
    }

    /// The destination written by an address-writing signal.
    pub fn signal_dest(&self) -> Option<Dest> {
        if self.sig_writes_address() {
            Some(self.sig_dest.unwrap_or(Dest::NOP))
        } else {
            None
        }
    }

    /// Every destination the instruction writes explicitly.
    pub fn dests(&self) -> impl Iterator<Item = Dest> + '_ {
        self.add_dest()
            .into_iter()
            .chain(self.mul_dest())
            .chain(self.signal_dest())
    }

    /// Sources read by the add slot, limited to the opcode's arity.
    pub fn add_sources(&self) -> impl Iterator<Item = Src> + '_ {
        self.add.sources().take(self.add.op.num_src())
    }

    pub fn mul_sources(&self) -> impl Iterator<Item = Src> + '_ {
        self.mul.sources().take(self.mul.op.num_src())
    }

    pub fn sources(&self) -> impl Iterator<Item = Src> + '_ {
        self.add_sources().chain(self.mul_sources())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Alu(Alu),
    Branch(Branch),
}

// ── Instruction ─────────────────────────────────────────────────────────────

/// One QPU instruction plus the scheduling metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub kind: InstKind,
    /// Index into the program uniform table, for instructions consuming a
    /// uniform-stream entry (ldunif or a sideband uniform).
    pub uniform: Option<u32>,
    /// TMU result words that this instruction's lookup will return.
    pub ldtmu_count: u32,
    /// Last thread switch before the program end.
    pub is_last_thrsw: bool,
    /// Writes the depth value to the TLB.
    pub is_tlb_z_write: bool,
    /// Indices (within the source block) of the instructions this bundle
    /// represents. Empty for scheduler-generated no-ops.
    pub origins: Vec<u32>,
}

impl Inst {
    pub fn alu(alu: Alu) -> Self {
        Inst {
            kind: InstKind::Alu(alu),
            uniform: None,
            ldtmu_count: 0,
            is_last_thrsw: false,
            is_tlb_z_write: false,
            origins: Vec::new(),
        }
    }

    pub fn branch(branch: Branch) -> Self {
        Inst {
            kind: InstKind::Branch(branch),
            ..Inst::alu(Alu::nop())
        }
    }

    pub fn nop() -> Self {
        Inst::alu(Alu::nop())
    }

    /// A standalone thread-switch signal.
    pub fn thrsw() -> Self {
        let mut alu = Alu::nop();
        alu.sigs = Signals::THRSW;
        Inst::alu(alu)
    }

    pub fn as_alu(&self) -> Option<&Alu> {
        match &self.kind {
            InstKind::Alu(a) => Some(a),
            InstKind::Branch(_) => None,
        }
    }

    pub fn as_alu_mut(&mut self) -> Option<&mut Alu> {
        match &mut self.kind {
            InstKind::Alu(a) => Some(a),
            InstKind::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match &self.kind {
            InstKind::Branch(b) => Some(b),
            InstKind::Alu(_) => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match &mut self.kind {
            InstKind::Branch(b) => Some(b),
            InstKind::Alu(_) => None,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, InstKind::Branch(_))
    }

    pub fn sigs(&self) -> Signals {
        self.as_alu().map(|a| a.sigs).unwrap_or(Signals::NONE)
    }

    pub fn has_sig(&self, sig: Signals) -> bool {
        self.sigs().intersects(sig)
    }

    pub fn has_uniform(&self) -> bool {
        self.uniform.is_some()
    }

    pub fn add_op(&self) -> AddOp {
        self.as_alu().map(|a| a.add.op).unwrap_or(AddOp::Nop)
    }

    pub fn mul_op(&self) -> MulOp {
        self.as_alu().map(|a| a.mul.op).unwrap_or(MulOp::Nop)
    }

    /// No ALU work and no signals.
    pub fn is_nop(&self) -> bool {
        match &self.kind {
            InstKind::Alu(a) => a.add.is_nop() && a.mul.is_nop() && a.sigs.is_empty(),
            InstKind::Branch(_) => false,
        }
    }

    pub fn sig_writes_address(&self) -> bool {
        self.as_alu().is_some_and(|a| a.sig_writes_address())
    }

    /// Magic addresses written by the add and mul slots.
    fn alu_magic_writes(&self) -> impl Iterator<Item = Waddr> + '_ {
        self.as_alu()
            .into_iter()
            .flat_map(|a| a.add_dest().into_iter().chain(a.mul_dest()))
            .filter_map(Dest::magic)
    }

    /// Magic addresses written by the ALU slots and the signal destination.
    pub fn magic_writes(&self) -> impl Iterator<Item = Waddr> + '_ {
        self.as_alu()
            .into_iter()
            .flat_map(|a| a.dests())
            .filter_map(Dest::magic)
    }

    fn writes_magic(&self, w: Waddr) -> bool {
        self.magic_writes().any(|m| m == w)
    }

    pub fn writes_r3(&self, caps: &Caps) -> bool {
        caps.has_accumulators() && self.writes_magic(Waddr::R3)
    }

    pub fn writes_r4(&self, caps: &Caps) -> bool {
        caps.has_accumulators()
            && (self.alu_magic_writes().any(|w| w == Waddr::R4 || w.is_sfu())
                || self.writes_magic(Waddr::R4))
    }

    pub fn writes_r5(&self, caps: &Caps) -> bool {
        caps.has_accumulators()
            && (self.writes_magic(Waddr::R5)
                || self.has_sig(Signals::LDVARY.or(Signals::LDUNIF).or(Signals::LDUNIFA)))
    }

    pub fn writes_rf0_implicitly(&self, caps: &Caps) -> bool {
        caps.implicit_rf0
            && self.has_sig(Signals::LDVARY.or(Signals::LDUNIF).or(Signals::LDUNIFA))
    }

    pub fn writes_accum(&self, caps: &Caps) -> bool {
        if !caps.has_accumulators() {
            return false;
        }
        self.writes_r3(caps)
            || self.writes_r4(caps)
            || self.writes_r5(caps)
            || self.alu_magic_writes().any(|w| w.accumulator().is_some())
    }

    /// Explicit register-file write of `reg` by an ALU slot or signal.
    pub fn writes_rf(&self, reg: u8) -> bool {
        self.as_alu()
            .is_some_and(|a| a.dests().any(|d| d == Dest::Rf(reg)))
    }

    /// Some ALU slot writes the register file (not a magic address).
    pub fn alu_writes_rf(&self) -> bool {
        self.as_alu().is_some_and(|a| {
            a.add_dest().is_some_and(|d| d.rf().is_some())
                || a.mul_dest().is_some_and(|d| d.rf().is_some())
        })
    }

    /// The address-writing signal targets the register file.
    pub fn sig_writes_rf(&self) -> bool {
        self.as_alu()
            .and_then(|a| a.signal_dest())
            .is_some_and(|d| d.rf().is_some())
    }

    pub fn reads_rf(&self, reg: u8) -> bool {
        self.as_alu()
            .is_some_and(|a| a.sources().any(|s| s == Src::Rf(reg)))
    }

    pub fn reads_acc(&self, n: u8) -> bool {
        self.as_alu()
            .is_some_and(|a| a.sources().any(|s| s == Src::Acc(n)))
    }

    /// SFU driven through an add opcode.
    pub fn is_sfu(&self) -> bool {
        self.add_op().is_sfu()
    }

    /// SFU driven by writing one of its magic addresses.
    pub fn is_legacy_sfu(&self) -> bool {
        self.alu_magic_writes().any(Waddr::is_sfu)
    }

    pub fn uses_sfu(&self) -> bool {
        self.is_sfu() || self.is_legacy_sfu()
    }

    pub fn writes_tmu(&self) -> bool {
        self.alu_magic_writes().any(Waddr::is_tmu)
    }

    pub fn writes_tmu_not_tmuc(&self) -> bool {
        self.writes_tmu() && !self.alu_magic_writes().any(|w| w == Waddr::Tmuc)
    }

    pub fn waits_on_tmu(&self) -> bool {
        self.has_sig(Signals::LDTMU) || self.add_op() == AddOp::Tmuwt
    }

    pub fn reads_tlb(&self) -> bool {
        self.has_sig(Signals::LDTLB.or(Signals::LDTLBU))
    }

    pub fn writes_tlb(&self) -> bool {
        self.alu_magic_writes().any(Waddr::is_tlb)
    }

    pub fn is_tlb(&self) -> bool {
        self.reads_tlb() || self.writes_tlb()
    }

    pub fn reads_vpm(&self) -> bool {
        self.add_op().reads_vpm()
    }

    pub fn writes_vpm(&self) -> bool {
        self.add_op().writes_vpm() || self.alu_magic_writes().any(Waddr::is_vpm)
    }

    pub fn waits_vpm(&self) -> bool {
        self.add_op() == AddOp::Vpmwt
    }

    pub fn writes_tsy(&self) -> bool {
        self.as_alu()
            .and_then(|a| a.add_dest())
            .and_then(Dest::magic)
            .is_some_and(Waddr::is_tsy)
    }

    pub fn writes_unifa(&self) -> bool {
        self.writes_magic(Waddr::Unifa)
    }

    pub fn reads_flags(&self) -> bool {
        match &self.kind {
            InstKind::Branch(b) => b.cond != BranchCond::Always,
            InstKind::Alu(a) => a.add.reads_flags() || a.mul.reads_flags() || a.add.op.reads_flags(),
        }
    }

    pub fn writes_flags(&self) -> bool {
        self.as_alu()
            .is_some_and(|a| a.add.writes_flags() || a.mul.writes_flags())
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

fn write_slot<Op: Copy>(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    slot: &AluSlot<Op>,
    num_src: usize,
) -> fmt::Result {
    f.write_str(name)?;
    for suffix in [
        cond_name(slot.cond),
        push_name(slot.pf),
        update_name(slot.uf),
    ]
    .into_iter()
    .flatten()
    {
        write!(f, ".{}", suffix)?;
    }
    if name == "nop" {
        return Ok(());
    }
    let srcs: Vec<Src> = slot.sources().take(num_src).collect();
    if slot.dest == Dest::NOP && srcs.is_empty() {
        return Ok(());
    }
    write!(f, " {}", slot.dest)?;
    for s in srcs {
        write!(f, ", {}", s)?;
    }
    Ok(())
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut attrs: Vec<String> = Vec::new();
        match &self.kind {
            InstKind::Branch(b) => {
                if b.cond == BranchCond::Always {
                    write!(f, "b {}", b.target_label)?;
                } else {
                    write!(f, "b.{} {}", b.cond.name(), b.target_label)?;
                }
                match b.msfign {
                    MsfSign::None => {}
                    MsfSign::P => attrs.push("msfign=p".into()),
                    MsfSign::Q => attrs.push("msfign=q".into()),
                }
                if let Some(off) = b.offset {
                    attrs.push(format!("offset={}", off));
                }
            }
            InstKind::Alu(a) => {
                write_slot(f, a.add.op.name(), &a.add, a.add.op.num_src())?;
                f.write_str(" ; ")?;
                write_slot(f, a.mul.op.name(), &a.mul, a.mul.op.num_src())?;
                for (sig, name) in a.sigs.iter() {
                    match a.sig_dest {
                        Some(dest) if Signals::WRITES_ADDRESS.contains(sig) => {
                            write!(f, " ; {}.{}", name, dest)?
                        }
                        _ => write!(f, " ; {}", name)?,
                    }
                }
            }
        }
        if let Some(u) = self.uniform {
            attrs.push(format!("unif={}", u));
        }
        if self.ldtmu_count > 0 {
            attrs.push(format!("ldtmu={}", self.ldtmu_count));
        }
        if self.is_last_thrsw {
            attrs.push("last_thrsw".into());
        }
        if self.is_tlb_z_write {
            attrs.push("tlb_z".into());
        }
        if !attrs.is_empty() {
            write!(f, " [{}]", attrs.join(", "))?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Caps, Generation};

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

    fn with_sig(mut inst: Inst, sig: Signals, dest: Option<Dest>) -> Inst {
        let alu = inst.as_alu_mut().unwrap();
        alu.sigs.insert(sig);
        alu.sig_dest = dest;
        inst
    }

    #[test]
    fn opcode_tables_round_trip() {
        for (op, name, _) in ADD_OPS {
            assert_eq!(AddOp::from_name(name), Some(*op));
            assert_eq!(op.name(), *name);
        }
        for (op, name, _) in MUL_OPS {
            assert_eq!(MulOp::from_name(name), Some(*op));
        }
        assert_eq!(AddOp::Fadd.num_src(), 2);
        assert_eq!(AddOp::Tmuwt.num_src(), 0);
        assert_eq!(MulOp::Fmov.num_src(), 1);
    }

    #[test]
    fn small_immediates_lookup() {
        assert_eq!(small_imm_from_int(0), Some(0));
        assert_eq!(small_imm_from_int(-1), Some(31));
        assert_eq!(small_imm_from_int(16), None);
        assert_eq!(small_imm_from_float(1.0), Some(40));
        assert_eq!(small_imm_from_float(0.3), None);
        assert_eq!(Src::SmallImm(31).to_string(), "-1");
        assert_eq!(Src::SmallImm(40).to_string(), "1.0");
    }

    #[test]
    fn sfu_magic_write_is_r4_write_on_v42_only() {
        let i = add(AddOp::Or, Dest::Magic(Waddr::Recip), Some(Src::Rf(1)), Some(Src::Rf(1)));
        assert!(i.writes_r4(&v42()));
        assert!(!i.writes_r4(&v71()));
        assert!(i.is_legacy_sfu());
        assert!(i.uses_sfu());
        assert!(!i.is_sfu());
    }

    #[test]
    fn implicit_load_writes_follow_generation() {
        let i = with_sig(Inst::nop(), Signals::LDUNIF, None);
        assert!(i.writes_r5(&v42()));
        assert!(!i.writes_rf0_implicitly(&v42()));
        assert!(!i.writes_r5(&v71()));
        assert!(i.writes_rf0_implicitly(&v71()));
        assert!(i.writes_accum(&v42()));
        assert!(!i.writes_accum(&v71()));
    }

    #[test]
    fn address_writing_signal_reports_destination() {
        let i = with_sig(Inst::nop(), Signals::LDTMU, Some(Dest::Rf(7)));
        assert!(i.sig_writes_address());
        assert!(i.writes_rf(7));
        assert!(i.sig_writes_rf());
        assert!(i.waits_on_tmu());
        assert!(!i.alu_writes_rf());
    }

    #[test]
    fn unused_sources_are_not_reads() {
        // NOT takes one source; a stray second operand is ignored.
        let i = add(AddOp::Not, Dest::Rf(1), Some(Src::Rf(2)), Some(Src::Rf(3)));
        assert!(i.reads_rf(2));
        assert!(!i.reads_rf(3));
    }

    #[test]
    fn flag_queries() {
        let mut i = add(AddOp::Fadd, Dest::Rf(1), Some(Src::Rf(2)), Some(Src::Rf(3)));
        assert!(!i.reads_flags() && !i.writes_flags());
        i.as_alu_mut().unwrap().add.pf = PushFlags::Pushz;
        assert!(i.writes_flags());
        i.as_alu_mut().unwrap().add.cond = Cond::Ifa;
        assert!(i.reads_flags());

        let vfla = add(AddOp::Vfla, Dest::Rf(1), None, None);
        assert!(vfla.reads_flags());
    }

    #[test]
    fn tmu_and_tlb_classification() {
        let tmud = add(AddOp::Mov, Dest::Magic(Waddr::Tmud), Some(Src::Rf(1)), None);
        assert!(tmud.writes_tmu());
        assert!(tmud.writes_tmu_not_tmuc());
        let tmuc = add(AddOp::Mov, Dest::Magic(Waddr::Tmuc), Some(Src::Rf(1)), None);
        assert!(!tmuc.writes_tmu_not_tmuc());
        assert!(Waddr::Tmus.is_tmu_sequence_terminator());
        assert!(!Waddr::Tmud.is_reorderable_tmu_write());
        assert!(Waddr::Tmut.is_reorderable_tmu_write());

        let tlb = add(AddOp::Mov, Dest::Magic(Waddr::Tlb), Some(Src::Rf(1)), None);
        assert!(tlb.is_tlb() && tlb.writes_tlb() && !tlb.reads_tlb());
    }

    #[test]
    fn display_formats_slots_and_signals() {
        let mut i = add(AddOp::Fadd, Dest::Rf(1), Some(Src::Rf(2)), Some(Src::SmallImm(2)));
        i.as_alu_mut().unwrap().add.pf = PushFlags::Pushz;
        let i = with_sig(i, Signals::LDVARY, Some(Dest::Rf(6)));
        assert_eq!(i.to_string(), "fadd.pushz rf1, rf2, 2 ; nop ; ldvary.rf6");

        let mut t = Inst::thrsw();
        t.is_last_thrsw = true;
        assert_eq!(t.to_string(), "nop ; nop ; thrsw [last_thrsw]");

        let tmuwt = add(AddOp::Tmuwt, Dest::NOP, None, None);
        assert_eq!(tmuwt.to_string(), "tmuwt ; nop");
    }

    #[test]
    fn branch_display_and_msf_safety() {
        let mut b = Branch {
            cond: BranchCond::Anya,
            msfign: MsfSign::P,
            target: BlockId(1),
            target_label: "loop".into(),
            offset: None,
        };
        assert!(!b.is_safe_after_setmsf());
        let mut i = Inst::branch(b.clone());
        i.uniform = Some(3);
        assert_eq!(i.to_string(), "b.anya loop [msfign=p, unif=3]");
        b.cond = BranchCond::Na0;
        assert!(b.is_safe_after_setmsf());
        assert!(Inst::branch(b).reads_flags());
    }
}
