// program.rs — Program containers before and after scheduling
//
// `Program` is the scheduler input: device description, uniform table and
// basic blocks of unscheduled instructions. `ScheduledProgram` is the
// output: the same blocks in final order with their instruction-pointer
// and uniform-stream bookkeeping.
//
// Preconditions: none (types only).
// Postconditions: `ScheduledProgram` block ranges are contiguous and in
//   program order.
// Failure modes: JSON serialization errors are returned to the caller.
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::ast::Span;
use crate::device::DeviceInfo;
use crate::diag::no_span;
use crate::inst::Inst;

/// Dense block index within a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// ── Uniforms ──

/// What a uniform-stream entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UniformKind {
    Const,
    UboAddr,
    SsboOffset,
    TmuConfigP0,
    TmuConfigP1,
    TextureSize,
    ViewportXScale,
    ViewportYScale,
    ViewportZOffset,
    ViewportZScale,
    LineWidth,
    SampleMask,
    SpillOffset,
}

const UNIFORM_KINDS: &[(UniformKind, &str)] = &[
    (UniformKind::Const, "const"),
    (UniformKind::UboAddr, "ubo_addr"),
    (UniformKind::SsboOffset, "ssbo_offset"),
    (UniformKind::TmuConfigP0, "tmu_config_p0"),
    (UniformKind::TmuConfigP1, "tmu_config_p1"),
    (UniformKind::TextureSize, "texture_size"),
    (UniformKind::ViewportXScale, "viewport_x_scale"),
    (UniformKind::ViewportYScale, "viewport_y_scale"),
    (UniformKind::ViewportZOffset, "viewport_z_offset"),
    (UniformKind::ViewportZScale, "viewport_z_scale"),
    (UniformKind::LineWidth, "line_width"),
    (UniformKind::SampleMask, "sample_mask"),
    (UniformKind::SpillOffset, "spill_offset"),
];

impl UniformKind {
    pub fn from_name(name: &str) -> Option<Self> {
        UNIFORM_KINDS.iter().find(|(_, n)| *n == name).map(|(k, _)| *k)
    }

    pub fn name(self) -> &'static str {
        UNIFORM_KINDS
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, n)| *n)
            .unwrap_or("const")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Uniform {
    pub kind: UniformKind,
    pub value: u32,
}

impl Uniform {
    pub fn constant(value: u32) -> Self {
        Uniform {
            kind: UniformKind::Const,
            value,
        }
    }
}

impl fmt::Display for Uniform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".uniform {} {:#010x}", self.kind.name(), self.value)
    }
}

// ── Input program ──

#[derive(Debug, Clone)]
pub struct Block {
    pub label: String,
    pub span: Span,
    pub instructions: Vec<Inst>,
    /// Taken and fall-through successors. A block ending in a branch jumps to
    /// `successors[0]`; a block without a branch falls through to it.
    pub successors: [Option<BlockId>; 2],
}

impl Block {
    pub fn new(label: impl Into<String>) -> Self {
        Block {
            label: label.into(),
            span: no_span(),
            instructions: Vec::new(),
            successors: [None, None],
        }
    }

    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.successors.iter().flatten().copied()
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub device: DeviceInfo,
    pub uniforms: Vec<Uniform>,
    pub blocks: Vec<Block>,
}

impl Program {
    pub fn new(device: DeviceInfo) -> Self {
        Program {
            device,
            uniforms: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }
}

fn write_block_header(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    successors: &[Option<BlockId>; 2],
    labels: &[&str],
) -> fmt::Result {
    write!(f, "block {}", label)?;
    let succ: Vec<&str> = successors
        .iter()
        .flatten()
        .filter_map(|id| labels.get(id.index()).copied())
        .collect();
    if !succ.is_empty() {
        write!(f, " -> {}", succ.join(", "))?;
    }
    f.write_str(":")
}

/// Prints the program back in assembly form.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.device)?;
        for u in &self.uniforms {
            writeln!(f, "{}", u)?;
        }
        let labels: Vec<&str> = self.blocks.iter().map(|b| b.label.as_str()).collect();
        for block in &self.blocks {
            write_block_header(f, &block.label, &block.successors, &labels)?;
            writeln!(f)?;
            for inst in &block.instructions {
                writeln!(f, "    {}", inst)?;
            }
        }
        Ok(())
    }
}

// ── Scheduled program ──

#[derive(Debug, Clone)]
pub struct ScheduledBlock {
    pub label: String,
    pub successors: [Option<BlockId>; 2],
    /// Program-wide index of the first instruction.
    pub start_ip: u32,
    /// Program-wide index of the last instruction.
    pub end_ip: u32,
    pub branch_ip: Option<u32>,
    /// First uniform-stream index consumed by this block.
    pub start_uniform: u32,
    pub branch_uniform: Option<u32>,
    pub instructions: Vec<Inst>,
}

impl ScheduledBlock {
    pub fn new(label: impl Into<String>, successors: [Option<BlockId>; 2]) -> Self {
        ScheduledBlock {
            label: label.into(),
            successors,
            start_ip: 0,
            end_ip: 0,
            branch_ip: None,
            start_uniform: 0,
            branch_uniform: None,
            instructions: Vec::new(),
        }
    }

    /// Number of emitted instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    /// Issued instructions, one per cycle.
    pub cycles: u32,
    /// Source instructions scheduled.
    pub instructions: u32,
    /// No-ops in the final program.
    pub nops: u32,
    /// Bundles issued while an SFU result they read was still pending.
    pub stalls: u32,
    /// Instructions paired into another instruction's bundle.
    pub merged: u32,
    /// Sum of per-block estimated completion times, counting latency the
    /// hardware hides behind thread switches.
    pub estimated_cycles: u32,
}

impl fmt::Display for ScheduleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycles={} instructions={} nops={} stalls={} merged={} estimated={}",
            self.cycles, self.instructions, self.nops, self.stalls, self.merged, self.estimated_cycles
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledProgram {
    pub device: DeviceInfo,
    pub uniforms: Vec<Uniform>,
    pub blocks: Vec<ScheduledBlock>,
    pub stats: ScheduleStats,
}

impl ScheduledProgram {
    /// All instructions in program order.
    pub fn instructions(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let labels: Vec<&str> = self.blocks.iter().map(|b| b.label.as_str()).collect();
        let report = ProgramReport {
            device: &self.device,
            uniforms: &self.uniforms,
            blocks: self
                .blocks
                .iter()
                .map(|b| BlockReport {
                    label: &b.label,
                    successors: b
                        .successors
                        .iter()
                        .flatten()
                        .filter_map(|id| labels.get(id.index()).copied())
                        .collect(),
                    start_ip: b.start_ip,
                    end_ip: b.end_ip,
                    branch_ip: b.branch_ip,
                    start_uniform: b.start_uniform,
                    branch_uniform: b.branch_uniform,
                    instructions: b.instructions.iter().map(|i| i.to_string()).collect(),
                })
                .collect(),
            stats: &self.stats,
        };
        serde_json::to_string_pretty(&report)
    }
}

#[derive(Serialize)]
struct ProgramReport<'a> {
    device: &'a DeviceInfo,
    uniforms: &'a [Uniform],
    blocks: Vec<BlockReport<'a>>,
    stats: &'a ScheduleStats,
}

#[derive(Serialize)]
struct BlockReport<'a> {
    label: &'a str,
    successors: Vec<&'a str>,
    start_ip: u32,
    end_ip: u32,
    branch_ip: Option<u32>,
    start_uniform: u32,
    branch_uniform: Option<u32>,
    instructions: Vec<String>,
}

/// The scheduled listing: each block with its instruction pointers.
impl fmt::Display for ScheduledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.device)?;
        for u in &self.uniforms {
            writeln!(f, "{}", u)?;
        }
        let labels: Vec<&str> = self.blocks.iter().map(|b| b.label.as_str()).collect();
        for block in &self.blocks {
            write_block_header(f, &block.label, &block.successors, &labels)?;
            writeln!(f)?;
            writeln!(f, "  # ip {}..={} unif {}", block.start_ip, block.end_ip, block.start_uniform)?;
            for (i, inst) in block.instructions.iter().enumerate() {
                writeln!(f, "    {:04}: {}", block.start_ip as usize + i, inst)?;
            }
        }
        writeln!(f, "# {}", self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Generation;

    #[test]
    fn uniform_kinds_round_trip() {
        for (kind, name) in UNIFORM_KINDS {
            assert_eq!(UniformKind::from_name(name), Some(*kind));
        }
        assert_eq!(
            Uniform::constant(0x3f80_0000).to_string(),
            ".uniform const 0x3f800000"
        );
    }

    #[test]
    fn program_prints_as_assembly() {
        let mut p = Program::new(DeviceInfo::new(Generation::V71));
        p.uniforms.push(Uniform::constant(1));
        let mut a = Block::new("entry");
        a.successors = [Some(BlockId(1)), None];
        a.instructions.push(Inst::nop());
        p.blocks.push(a);
        p.blocks.push(Block::new("exit"));
        assert_eq!(
            p.to_string(),
            ".target v71 threads=4 stage=fragment inputs=0\n\
             .uniform const 0x00000001\n\
             block entry -> exit:\n    nop ; nop\n\
             block exit:\n"
        );
        assert_eq!(p.instruction_count(), 1);
    }

    #[test]
    fn json_report_names_successors() {
        let mut b = ScheduledBlock::new("entry", [Some(BlockId(0)), None]);
        b.instructions.push(Inst::nop());
        let sp = ScheduledProgram {
            device: DeviceInfo::default(),
            uniforms: vec![],
            blocks: vec![b],
            stats: ScheduleStats::default(),
        };
        let v: serde_json::Value = serde_json::from_str(&sp.to_json().unwrap()).unwrap();
        assert_eq!(v["blocks"][0]["successors"][0], "entry");
        assert_eq!(v["blocks"][0]["instructions"][0], "nop ; nop");
        assert_eq!(v["device"]["generation"], "v42");
    }
}
