// device.rs — Target device description and per-generation capabilities
//
// Describes the QPU a program is scheduled for. The generation-dependent
// rules consulted on the scheduling hot path are resolved once into a
// `Caps` table, so the scheduler tests named capabilities rather than
// version numbers.
//
// Preconditions: none.
// Postconditions: `DeviceInfo::caps()` depends only on the generation.
// Failure modes: unknown generation / stage names are rejected by `from_name`.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encoder::{V41_SIG_MAP, V71_SIG_MAP};
use crate::inst::Signals;

// ── Generation ──────────────────────────────────────────────────────────────

/// Hardware generation of the QPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// 4.2: accumulators r0-r5, two shared register-file read ports.
    V42,
    /// 7.1: no accumulators, per-operand register addressing.
    V71,
}

impl Generation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "v42" | "42" => Some(Generation::V42),
            "v71" | "71" => Some(Generation::V71),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Generation::V42 => "v42",
            Generation::V71 => "v71",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shader stage of the program. Only fragment shaders pipeline varyings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vertex" | "vs" => Some(ShaderStage::Vertex),
            "fragment" | "fs" => Some(ShaderStage::Fragment),
            "compute" | "cs" => Some(ShaderStage::Compute),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

// ── Device info ─────────────────────────────────────────────────────────────

/// Per-program target description.
///
/// Deserializable from a JSON device file (`--config`); missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub generation: Generation,
    /// Threads per QPU (1, 2 or 4). Sizes the per-thread TMU output FIFO share.
    pub threads: u32,
    pub stage: ShaderStage,
    /// Number of varyings the fragment shader loads with `ldvary`.
    pub num_inputs: u32,
    /// Take the pixel scoreboard lock on the first thread switch instead of
    /// the last one.
    pub lock_scoreboard_on_first_thrsw: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            generation: Generation::V42,
            threads: 4,
            stage: ShaderStage::Fragment,
            num_inputs: 0,
            lock_scoreboard_on_first_thrsw: false,
        }
    }
}

impl DeviceInfo {
    pub fn new(generation: Generation) -> Self {
        DeviceInfo {
            generation,
            ..DeviceInfo::default()
        }
    }

    /// Resolve the capability table for this device's generation.
    pub fn caps(&self) -> Caps {
        Caps::for_generation(self.generation)
    }

    /// Canonical compact JSON, used for build fingerprints.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Maximum TMU result words that may be outstanding per thread.
    pub fn tmu_fifo_share(&self) -> u32 {
        16 / self.threads.max(1)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ".target {} threads={} stage={} inputs={}",
            self.generation,
            self.threads,
            self.stage.name(),
            self.num_inputs
        )?;
        if self.lock_scoreboard_on_first_thrsw {
            write!(f, " scb_first_thrsw")?;
        }
        Ok(())
    }
}

// ── Capabilities ────────────────────────────────────────────────────────────

/// How two instructions' peripheral accesses may share one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralRules {
    /// One access per bundle, except WRTMUC + TMU write and TMU read + VPM.
    SingleAccess,
    /// At most one restricted access, one TMU read and one TLB access.
    Restricted,
}

/// Which registers fragment setup may clobber during thread-end delay slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrendRegisters {
    /// rf0..rf2 must not be read; no physical register writes at all.
    ReadsRf0To2,
    /// rf2 and rf3 must not be read or written.
    Rf2Rf3,
}

/// Generation-dependent rules, resolved once per program.
#[derive(Debug, Clone, Copy)]
pub struct Caps {
    pub generation: Generation,
    /// Accumulator registers r0..r(n-1). Zero when only the register file exists.
    pub accumulators: u8,
    /// Signal loads (ldvary, ldunif, ldunifa) write rf0 implicitly.
    pub implicit_rf0: bool,
    /// ALU operands share two register-file read ports; small immediates
    /// occupy the second one.
    pub shared_read_ports: bool,
    /// MOV/FMOV in the mul slot may move to the add slot when merging.
    pub mov_to_add_slot: bool,
    /// RECIP/RSQRT/EXP/LOG/SIN/RSQRT2 exist as add opcodes.
    pub alu_sfu_ops: bool,
    pub peripherals: PeripheralRules,
    /// Encodable signal combinations.
    pub sig_map: &'static [Signals],
    /// ldvary is only forbidden in the last thrsw delay slot (otherwise in
    /// every slot after the first).
    pub ldvary_in_thrsw_slot_1: bool,
    pub thrend_registers: ThrendRegisters,
    /// VPMWT / TMUWT restrictions apply in thread-end slots.
    pub thrend_wait_restrictions: bool,
    /// The thread-end instruction itself must only write magic registers.
    pub thrend_slot0_magic_only: bool,
    /// Branches with msfign and a non-a0 condition must not follow SETMSF.
    pub msf_branch_restricted: bool,
}

impl Caps {
    pub fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::V42 => Caps {
                generation,
                accumulators: 6,
                implicit_rf0: false,
                shared_read_ports: true,
                mov_to_add_slot: false,
                alu_sfu_ops: false,
                peripherals: PeripheralRules::SingleAccess,
                sig_map: &V41_SIG_MAP,
                ldvary_in_thrsw_slot_1: false,
                thrend_registers: ThrendRegisters::ReadsRf0To2,
                thrend_wait_restrictions: true,
                thrend_slot0_magic_only: false,
                msf_branch_restricted: true,
            },
            Generation::V71 => Caps {
                generation,
                accumulators: 0,
                implicit_rf0: true,
                shared_read_ports: false,
                mov_to_add_slot: true,
                alu_sfu_ops: true,
                peripherals: PeripheralRules::Restricted,
                sig_map: &V71_SIG_MAP,
                ldvary_in_thrsw_slot_1: true,
                thrend_registers: ThrendRegisters::Rf2Rf3,
                thrend_wait_restrictions: false,
                thrend_slot0_magic_only: true,
                msf_branch_restricted: false,
            },
        }
    }

    pub fn has_accumulators(&self) -> bool {
        self.accumulators > 0
    }
}
