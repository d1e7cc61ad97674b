// resolve.rs — From .qasm AST to a typed program
//
// Walks the parsed AST, resolves opcodes, registers, signals and block
// labels for the target generation, and validates everything the scheduler
// takes for granted: operand counts, encodable signal sets, read ports,
// uniform indices, branch placement and standalone thread switches.
//
// Preconditions: `file` is a well-formed AST from the parser.
// Postconditions: `program` is only meaningful when no error diagnostics
//   were produced; then every instruction satisfies the scheduler's input
//   contract.
// Failure modes: unknown names, generation-illegal operands, malformed
//   directives or attributes produce `Diagnostic` entries. Resolution
//   continues past errors.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::{self, Arg, Ident, InstLine, LineKind, Part, SourceFile, Span, Value};
use crate::device::{DeviceInfo, Generation, ShaderStage};
use crate::diag::{codes, Diagnostic};
use crate::encoder::QpuEncoder;
use crate::inst::{
    small_imm_from_float, small_imm_from_int, AddOp, Alu, AluSlot, Branch, BranchCond, Dest,
    FlagSuffix, Inst, MsfSign, MulOp, Signals, Src, Waddr,
};
use crate::program::{Block, BlockId, Program, Uniform, UniformKind};

// ── Public types ────────────────────────────────────────────────────────────

/// Result of resolution.
#[derive(Debug)]
pub struct ResolveResult {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
}

/// Overrides applied on top of the `.target` line.
#[derive(Debug, Clone, Default)]
pub struct TargetOverrides {
    /// Replaces the whole device description (from `--config`).
    pub device: Option<DeviceInfo>,
    pub generation: Option<Generation>,
    pub threads: Option<u32>,
}

impl TargetOverrides {
    fn apply(&self, device: &mut DeviceInfo) {
        if let Some(d) = &self.device {
            *device = d.clone();
        }
        if let Some(g) = self.generation {
            device.generation = g;
        }
        if let Some(t) = self.threads {
            device.threads = t;
        }
    }
}

// ── Resolver state ──────────────────────────────────────────────────────────

struct PendingBlock {
    block: Block,
    header_successors: Vec<Ident>,
    /// Label and span of the branch at the end of the block.
    branch_target: Option<Ident>,
}

struct Resolver {
    device: DeviceInfo,
    seen_target: bool,
    uniforms: Vec<Uniform>,
    blocks: Vec<PendingBlock>,
    labels: HashMap<String, (BlockId, Span)>,
    /// Uniform reads with their spans, checked once all directives are seen.
    uniform_reads: Vec<(u32, Span)>,
    diagnostics: Vec<Diagnostic>,
}

impl Resolver {
    fn new() -> Self {
        Resolver {
            device: DeviceInfo::default(),
            seen_target: false,
            uniforms: Vec::new(),
            blocks: Vec::new(),
            labels: HashMap::new(),
            uniform_reads: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    // ── Directives ──

    fn directive(&mut self, d: &ast::Directive, span: Span) {
        match d.name.name.as_str() {
            "target" => self.target(d, span),
            "uniform" => self.uniform(d, span),
            other => self.error(
                codes::E0108,
                d.name.span,
                format!("unknown directive `.{}`", other),
            ),
        }
    }

    fn target(&mut self, d: &ast::Directive, span: Span) {
        if self.seen_target {
            self.error(codes::E0108, span, "duplicate `.target` directive");
            return;
        }
        self.seen_target = true;

        let mut args = d.args.iter();
        match args.next() {
            Some(Arg { key: None, value: Value::Ident(g), .. }) => {
                match Generation::from_name(&g.name) {
                    Some(gen) => self.device.generation = gen,
                    None => self.error(
                        codes::E0108,
                        g.span,
                        format!("unknown generation `{}` (expected v42 or v71)", g.name),
                    ),
                }
            }
            _ => {
                self.error(codes::E0108, span, "`.target` needs a generation (v42 or v71)");
                return;
            }
        }

        for arg in args {
            let key = arg.key.as_ref().map(|k| k.name.as_str());
            match (key, &arg.value) {
                (Some("threads"), Value::Int(n, _)) if matches!(n, 1 | 2 | 4) => {
                    self.device.threads = *n as u32;
                }
                (Some("inputs"), Value::Int(n, _)) if *n >= 0 => {
                    self.device.num_inputs = *n as u32;
                }
                (Some("stage"), Value::Ident(s)) if ShaderStage::from_name(&s.name).is_some() => {
                    if let Some(stage) = ShaderStage::from_name(&s.name) {
                        self.device.stage = stage;
                    }
                }
                (None, Value::Ident(f)) if f.name == "scb_first_thrsw" => {
                    self.device.lock_scoreboard_on_first_thrsw = true;
                }
                _ => self.error(
                    codes::E0108,
                    arg.span,
                    "malformed `.target` option (expected threads=1|2|4, stage=NAME, \
                     inputs=N or scb_first_thrsw)",
                ),
            }
        }
    }

    fn uniform(&mut self, d: &ast::Directive, span: Span) {
        let parsed = match d.args.as_slice() {
            [Arg {
                key: None,
                value: Value::Ident(kind),
                ..
            }, Arg {
                key: None,
                value: Value::Int(v, _),
                ..
            }] => UniformKind::from_name(&kind.name).zip(uniform_word(*v)),
            _ => None,
        };
        match parsed {
            Some((kind, value)) => self.uniforms.push(Uniform { kind, value }),
            None => self.error(
                codes::E0108,
                span,
                "malformed `.uniform` (expected `.uniform KIND VALUE`)",
            ),
        }
    }

    // ── Blocks ──

    fn block_header(&mut self, h: &ast::BlockHeader, span: Span) {
        let id = BlockId(self.blocks.len() as u32);
        if let Some((_, first)) = self.labels.get(&h.label.name) {
            let d = Diagnostic::error(
                codes::E0103,
                h.label.span,
                format!("duplicate block label `{}`", h.label.name),
            )
            .with_related(*first, "first defined here");
            self.diagnostics.push(d);
        } else {
            self.labels.insert(h.label.name.clone(), (id, h.label.span));
        }
        if h.successors.len() > 2 {
            self.error(
                codes::E0102,
                span,
                format!("block `{}` lists more than two successors", h.label.name),
            );
        }
        let mut block = Block::new(h.label.name.clone());
        block.span = span;
        self.blocks.push(PendingBlock {
            block,
            header_successors: h.successors.clone(),
            branch_target: None,
        });
    }

    fn inst_line(&mut self, line: &InstLine, span: Span) {
        let Some(current) = self.blocks.len().checked_sub(1) else {
            self.error(codes::E0112, span, "instruction outside a block");
            return;
        };
        if self.blocks[current].branch_target.is_some() {
            self.error(
                codes::E0111,
                span,
                "a branch must be the last instruction of its block",
            );
        }

        let is_branch = line.parts.first().is_some_and(|p| p.opcode.name == "b");
        let inst = if is_branch {
            self.branch(line, span, current)
        } else {
            self.alu_inst(line, span)
        };
        if let Some(inst) = inst {
            if let Some(u) = inst.uniform {
                self.uniform_reads.push((u, span));
            }
            self.blocks[current].block.instructions.push(inst);
        }
    }

    fn branch(&mut self, line: &InstLine, span: Span, current: usize) -> Option<Inst> {
        let part = &line.parts[0];
        if line.parts.len() > 1 {
            self.error(codes::E0110, span, "a branch cannot be paired with other parts");
            return None;
        }
        let cond = match part.suffixes.as_slice() {
            [] => BranchCond::Always,
            [c] => match BranchCond::from_name(&c.name) {
                Some(cond) => cond,
                None => {
                    self.error(
                        codes::E0101,
                        c.span,
                        format!("unknown branch condition `{}`", c.name),
                    );
                    return None;
                }
            },
            _ => {
                self.error(codes::E0101, part.span, "a branch takes one condition");
                return None;
            }
        };
        let target = match part.operands.as_slice() {
            [Value::Ident(t)] => t.clone(),
            _ => {
                self.error(codes::E0110, part.span, "a branch takes one target label");
                return None;
            }
        };

        let mut branch = Branch {
            cond,
            msfign: MsfSign::None,
            target: BlockId(0),
            target_label: target.name.clone(),
            offset: None,
        };
        let mut inst = Inst::branch(branch.clone());
        for attr in &line.attrs {
            match (attr.key.as_ref().map(|k| k.name.as_str()), &attr.value) {
                (Some("msfign"), Value::Ident(s)) if s.name == "p" => branch.msfign = MsfSign::P,
                (Some("msfign"), Value::Ident(s)) if s.name == "q" => branch.msfign = MsfSign::Q,
                // Listings print the resolved offset; it is recomputed.
                (Some("offset"), Value::Int(..)) => {}
                _ => self.common_attr(attr, &mut inst),
            }
        }
        if let Some(b) = inst.as_branch_mut() {
            b.msfign = branch.msfign;
        }
        self.blocks[current].branch_target = Some(target);
        Some(inst)
    }

    fn alu_inst(&mut self, line: &InstLine, span: Span) -> Option<Inst> {
        let generation = self.device.generation;
        let mut alu = Alu::nop();
        let mut slots_seen = 0;
        let mut ok = true;

        for part in &line.parts {
            if let Some(sig) = Signals::from_name(&part.opcode.name) {
                ok &= self.signal(part, sig, &mut alu);
                continue;
            }
            match slots_seen {
                0 => match AddOp::from_name(&part.opcode.name) {
                    Some(op) if op.requires_v71() && generation != Generation::V71 => {
                        self.error(
                            codes::E0104,
                            part.opcode.span,
                            format!("`{}` is not available on {}", op.name(), generation),
                        );
                        ok = false;
                    }
                    Some(op) => match self.slot(part, op, op.num_src()) {
                        Some(slot) => alu.add = slot,
                        None => ok = false,
                    },
                    None => {
                        let mut d = Diagnostic::error(
                            codes::E0100,
                            part.opcode.span,
                            format!("unknown add opcode `{}`", part.opcode.name),
                        );
                        if MulOp::from_name(&part.opcode.name).is_some() {
                            d = d.with_hint(format!(
                                "mul opcodes go in the second part: `nop ; {} ...`",
                                part.opcode.name
                            ));
                        }
                        self.diagnostics.push(d);
                        ok = false;
                    }
                },
                1 => match MulOp::from_name(&part.opcode.name) {
                    Some(op) => match self.slot(part, op, op.num_src()) {
                        Some(slot) => alu.mul = slot,
                        None => ok = false,
                    },
                    None => {
                        self.error(
                            codes::E0100,
                            part.opcode.span,
                            format!("unknown mul opcode `{}`", part.opcode.name),
                        );
                        ok = false;
                    }
                },
                _ => {
                    self.error(
                        codes::E0100,
                        part.opcode.span,
                        format!("unknown signal `{}`", part.opcode.name),
                    );
                    ok = false;
                }
            }
            slots_seen += 1;
        }
        if !ok {
            return None;
        }

        let encoder = QpuEncoder::new(self.device.caps());
        if !encoder.read_ports_fit(&alu) {
            self.error(
                codes::E0106,
                span,
                "too many register-file reads or small immediates in one instruction",
            );
            return None;
        }
        if !encoder.alu_sigs_packable(&alu, Signals::NONE) {
            self.error(
                codes::E0105,
                span,
                format!("signal combination is not encodable on {}", generation),
            );
            return None;
        }
        if alu.sigs.contains(Signals::THRSW)
            && (alu.sigs != Signals::THRSW || !alu.add.is_nop() || !alu.mul.is_nop())
        {
            self.error(
                codes::E0105,
                span,
                "thrsw must be a standalone `nop ; nop ; thrsw` instruction",
            );
            return None;
        }

        let mut inst = Inst::alu(alu);
        for attr in &line.attrs {
            self.common_attr(attr, &mut inst);
        }
        let reads_uniform = inst.has_sig(UNIFORM_READERS);
        if reads_uniform && inst.uniform.is_none() {
            self.error(codes::E0107, span, "ldunif and wrtmuc need a `unif=N` attribute");
        }
        if !reads_uniform && inst.uniform.is_some() {
            self.error(codes::E0107, span, "`unif=N` on an instruction that reads no uniform");
        }
        if inst.is_last_thrsw && !inst.has_sig(Signals::THRSW) {
            self.error(codes::E0107, span, "`last_thrsw` on an instruction without thrsw");
        }
        Some(inst)
    }

    fn signal(&mut self, part: &Part, sig: Signals, alu: &mut Alu) -> bool {
        if !part.operands.is_empty() {
            self.error(codes::E0110, part.span, "signals take no operands");
            return false;
        }
        if alu.sigs.contains(sig) {
            self.error(codes::E0105, part.span, format!("duplicate signal `{}`", part.opcode.name));
            return false;
        }
        match part.suffixes.as_slice() {
            [] => {}
            [d] if Signals::WRITES_ADDRESS.contains(sig) => {
                if alu.sig_dest.is_some() {
                    self.error(
                        codes::E0105,
                        part.span,
                        "only one signal may write an address",
                    );
                    return false;
                }
                match self.dest(d) {
                    Some(dest) => alu.sig_dest = Some(dest),
                    None => return false,
                }
            }
            _ => {
                self.error(
                    codes::E0101,
                    part.span,
                    format!("signal `{}` takes no destination", part.opcode.name),
                );
                return false;
            }
        }
        alu.sigs.insert(sig);
        true
    }

    fn slot<Op: Copy>(&mut self, part: &Part, op: Op, num_src: usize) -> Option<AluSlot<Op>> {
        let mut slot = AluSlot::new(op, Dest::NOP, None, None);
        for s in &part.suffixes {
            match FlagSuffix::from_name(&s.name) {
                Some(FlagSuffix::Cond(c)) => slot.cond = c,
                Some(FlagSuffix::Push(p)) => slot.pf = p,
                Some(FlagSuffix::Update(u)) => slot.uf = u,
                None => {
                    self.error(
                        codes::E0101,
                        s.span,
                        format!("unknown flag suffix `{}`", s.name),
                    );
                    return None;
                }
            }
        }

        let operands = part.operands.as_slice();
        let (dest, srcs) = match operands {
            [] if num_src == 0 => (None, operands),
            [d, rest @ ..] if rest.len() == num_src => (Some(d), rest),
            _ => {
                self.error(
                    codes::E0110,
                    part.span,
                    format!(
                        "`{}` takes a destination and {} source(s), got {} operand(s)",
                        part.opcode.name,
                        num_src,
                        operands.len()
                    ),
                );
                return None;
            }
        };

        if let Some(d) = dest {
            let Value::Ident(id) = d else {
                self.error(codes::E0101, d.span(), "destination must be a register");
                return None;
            };
            slot.dest = self.dest(id)?;
        }
        let mut srcs = srcs.iter();
        if let Some(v) = srcs.next() {
            slot.a = Some(self.src(v)?);
        }
        if let Some(v) = srcs.next() {
            slot.b = Some(self.src(v)?);
        }
        Some(slot)
    }

    fn dest(&mut self, id: &Ident) -> Option<Dest> {
        if let Some(n) = parse_rf(&id.name) {
            return Some(Dest::Rf(n));
        }
        match Waddr::from_name(&id.name) {
            Some(w) if w.accumulator().is_some() && !self.device.caps().has_accumulators() => {
                self.error(
                    codes::E0104,
                    id.span,
                    format!("accumulator `{}` does not exist on {}", id.name, self.device.generation),
                );
                None
            }
            Some(w) => Some(Dest::Magic(w)),
            None => {
                self.error(codes::E0101, id.span, format!("unknown register `{}`", id.name));
                None
            }
        }
    }

    fn src(&mut self, v: &Value) -> Option<Src> {
        match v {
            Value::Ident(id) => {
                if let Some(n) = parse_rf(&id.name) {
                    return Some(Src::Rf(n));
                }
                match Waddr::from_name(&id.name).and_then(Waddr::accumulator) {
                    Some(_) if !self.device.caps().has_accumulators() => {
                        self.error(
                            codes::E0104,
                            id.span,
                            format!(
                                "accumulator `{}` does not exist on {}",
                                id.name, self.device.generation
                            ),
                        );
                        None
                    }
                    Some(n) => Some(Src::Acc(n)),
                    None => {
                        self.error(codes::E0101, id.span, format!("unknown operand `{}`", id.name));
                        None
                    }
                }
            }
            Value::Int(n, span) => match small_imm_from_int(*n) {
                Some(i) => Some(Src::SmallImm(i)),
                None => {
                    self.error(
                        codes::E0106,
                        *span,
                        format!("{} is not an encodable small immediate", n),
                    );
                    None
                }
            },
            Value::Float(x, span) => match small_imm_from_float(*x) {
                Some(i) => Some(Src::SmallImm(i)),
                None => {
                    self.error(
                        codes::E0106,
                        *span,
                        format!("{:?} is not an encodable small immediate", x),
                    );
                    None
                }
            },
        }
    }

    /// Attributes valid on every instruction.
    fn common_attr(&mut self, attr: &Arg, inst: &mut Inst) {
        let key = attr.key.as_ref().map(|k| k.name.as_str());
        match (key, &attr.value) {
            (Some("unif"), Value::Int(n, _)) if *n >= 0 => inst.uniform = Some(*n as u32),
            (Some("ldtmu"), Value::Int(n, _)) if *n >= 0 => inst.ldtmu_count = *n as u32,
            (None, Value::Ident(f)) if f.name == "last_thrsw" => inst.is_last_thrsw = true,
            (None, Value::Ident(f)) if f.name == "tlb_z" => inst.is_tlb_z_write = true,
            _ => self.error(
                codes::E0107,
                attr.span,
                "malformed attribute (expected unif=N, ldtmu=N, last_thrsw, tlb_z or msfign=p|q)",
            ),
        }
    }

    // ── Finish ──

    fn finish(mut self) -> ResolveResult {
        let n = self.blocks.len();
        let mut blocks = Vec::with_capacity(n);
        let pending = std::mem::take(&mut self.blocks);

        for (i, p) in pending.into_iter().enumerate() {
            let mut block = p.block;
            let lookup = |r: &mut Resolver, id: &Ident| -> Option<BlockId> {
                match r.labels.get(&id.name) {
                    Some((b, _)) => Some(*b),
                    None => {
                        r.error(codes::E0102, id.span, format!("unknown block label `{}`", id.name));
                        None
                    }
                }
            };
            let next = (i + 1 < n).then(|| BlockId(i as u32 + 1));

            let declared: Vec<Option<BlockId>> =
                p.header_successors.iter().map(|s| lookup(&mut self, s)).collect();

            match &p.branch_target {
                Some(target) => {
                    let Some(t) = lookup(&mut self, target) else {
                        blocks.push(block);
                        continue;
                    };
                    if let Some(b) = block.instructions.last_mut().and_then(Inst::as_branch_mut) {
                        b.target = t;
                    }
                    let cond = block
                        .instructions
                        .last()
                        .and_then(Inst::as_branch)
                        .map_or(BranchCond::Always, |b| b.cond);
                    if declared.is_empty() {
                        let fallthrough = if cond == BranchCond::Always { None } else { next };
                        block.successors = [Some(t), fallthrough];
                    } else if declared.first().copied().flatten() != Some(t) {
                        self.error(
                            codes::E0102,
                            target.span,
                            format!(
                                "branch target `{}` must be the first successor of block `{}`",
                                target.name, block.label
                            ),
                        );
                    } else {
                        block.successors = [Some(t), declared.get(1).copied().flatten()];
                    }
                }
                None => {
                    block.successors = if declared.is_empty() {
                        [next, None]
                    } else {
                        [
                            declared.first().copied().flatten(),
                            declared.get(1).copied().flatten(),
                        ]
                    };
                }
            }
            blocks.push(block);
        }

        // Uniform reads and coverage.
        let count = self.uniforms.len() as u32;
        let mut used = vec![false; self.uniforms.len()];
        for (u, span) in std::mem::take(&mut self.uniform_reads) {
            match used.get_mut(u as usize) {
                Some(flag) => *flag = true,
                None => self.error(
                    codes::E0109,
                    span,
                    format!("uniform index {} out of range ({} declared)", u, count),
                ),
            }
        }
        for (i, used) in used.iter().enumerate() {
            if !used {
                self.diagnostics.push(Diagnostic::warning(
                    codes::W0002,
                    crate::diag::no_span(),
                    format!("uniform {} is never consumed", i),
                ));
            }
        }

        if blocks.iter().all(|b| b.instructions.is_empty()) {
            self.diagnostics.push(Diagnostic::warning(
                codes::W0001,
                crate::diag::no_span(),
                "program has no instructions",
            ));
        }

        let mut program = Program::new(self.device);
        program.uniforms = self.uniforms;
        program.blocks = blocks;
        ResolveResult {
            program,
            diagnostics: self.diagnostics,
        }
    }
}

/// Signals that consume the next uniform-stream entry.
const UNIFORM_READERS: Signals = Signals::LDUNIF
    .or(Signals::LDUNIFRF)
    .or(Signals::WRTMUC);

/// A 32-bit uniform word; negative values are stored as two's complement.
fn uniform_word(v: i64) -> Option<u32> {
    u32::try_from(v)
        .ok()
        .or_else(|| i32::try_from(v).ok().map(|x| x as u32))
}

/// `rfN` with N in 0..64.
fn parse_rf(name: &str) -> Option<u8> {
    let n: u8 = name.strip_prefix("rf")?.parse().ok()?;
    (n < 64).then_some(n)
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Resolve a parsed file into a program.
pub fn resolve(file: &SourceFile, overrides: &TargetOverrides) -> ResolveResult {
    let mut r = Resolver::new();

    // The target line decides register legality, so read it first.
    let target_line = file.lines.iter().position(|l| {
        matches!(&l.kind, LineKind::Directive(d) if d.name.name == "target")
    });
    if let Some(line) = target_line.map(|i| &file.lines[i]) {
        if let LineKind::Directive(d) = &line.kind {
            r.target(d, line.span);
        }
    }
    overrides.apply(&mut r.device);

    for (i, line) in file.lines.iter().enumerate() {
        match &line.kind {
            LineKind::Directive(_) if Some(i) == target_line => {
                if !r.blocks.is_empty() {
                    r.error(codes::E0108, line.span, "`.target` must come before the first block");
                }
            }
            LineKind::Directive(d) => r.directive(d, line.span),
            LineKind::BlockHeader(h) => r.block_header(h, line.span),
            LineKind::Inst(inst) => r.inst_line(inst, line.span),
        }
    }
    r.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn resolve_src(src: &str) -> ResolveResult {
        let parsed = parse(src);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        let file = parsed.file.expect("file");
        resolve(&file, &TargetOverrides::default())
    }

    fn resolve_ok(src: &str) -> Program {
        let r = resolve_src(src);
        let errors: Vec<_> = r.diagnostics.iter().filter(|d| d.is_error()).collect();
        assert!(errors.is_empty(), "unexpected errors: {:#?}", errors);
        r.program
    }

    fn first_error(src: &str) -> crate::diag::DiagCode {
        let r = resolve_src(src);
        r.diagnostics
            .iter()
            .find(|d| d.is_error())
            .and_then(|d| d.code)
            .expect("expected an error")
    }

    #[test]
    fn target_line_sets_device() {
        let p = resolve_ok(".target v71 threads=2 stage=compute inputs=3 scb_first_thrsw\nblock a:\n  nop ; nop\n");
        assert_eq!(p.device.generation, Generation::V71);
        assert_eq!(p.device.threads, 2);
        assert_eq!(p.device.stage, ShaderStage::Compute);
        assert_eq!(p.device.num_inputs, 3);
        assert!(p.device.lock_scoreboard_on_first_thrsw);
    }

    #[test]
    fn overrides_beat_the_target_line() {
        let parsed = parse(".target v42 threads=4\nblock a:\n  nop ; nop\n");
        let file = parsed.file.expect("file");
        let o = TargetOverrides {
            generation: Some(Generation::V71),
            threads: Some(1),
            ..TargetOverrides::default()
        };
        let r = resolve(&file, &o);
        assert_eq!(r.program.device.generation, Generation::V71);
        assert_eq!(r.program.device.threads, 1);
    }

    #[test]
    fn alu_parts_and_signals() {
        let p = resolve_ok(
            ".target v42\n.uniform const 1\nblock a:\n  fadd.pushz rf1, r4, rf2 ; fmul rf4, rf5, r1 ; ldunif [unif=0]\n",
        );
        let inst = &p.blocks[0].instructions[0];
        let alu = inst.as_alu().expect("alu");
        assert_eq!(alu.add.op, AddOp::Fadd);
        assert_eq!(alu.add.a, Some(Src::Acc(4)));
        assert_eq!(alu.add.b, Some(Src::Rf(2)));
        assert_eq!(alu.mul.op, MulOp::Fmul);
        assert_eq!(alu.mul.b, Some(Src::Acc(1)));
        assert!(alu.sigs.contains(Signals::LDUNIF));
        assert_eq!(inst.uniform, Some(0));
    }

    #[test]
    fn printed_instructions_resolve_back() {
        let src = ".target v71\nblock a:\n  fadd.pushz rf1, rf2, 2 ; nop ; ldvary.rf6\n  tmuwt ; nop\n";
        let p = resolve_ok(src);
        let printed: Vec<String> = p.blocks[0].instructions.iter().map(|i| i.to_string()).collect();
        assert_eq!(printed[0], "fadd.pushz rf1, rf2, 2 ; nop ; ldvary.rf6");
        let again = resolve_ok(&p.to_string());
        assert_eq!(again.blocks[0].instructions, p.blocks[0].instructions);
    }

    #[test]
    fn small_immediates_resolve() {
        let p = resolve_ok(".target v71\nblock a:\n  fadd rf1, rf2, 0.5 ; nop\n  add rf3, rf4, -1 ; nop\n");
        let a = p.blocks[0].instructions[0].as_alu().expect("alu");
        assert_eq!(a.add.b, small_imm_from_float(0.5).map(Src::SmallImm));
        let b = p.blocks[0].instructions[1].as_alu().expect("alu");
        assert_eq!(b.add.b, small_imm_from_int(-1).map(Src::SmallImm));
    }

    #[test]
    fn branch_successors_are_derived() {
        let p = resolve_ok(
            ".target v71\n.uniform const 0\nblock a:\n  b.anya c [unif=0]\nblock b:\n  nop ; nop\nblock c:\n  nop ; nop\n",
        );
        assert_eq!(p.blocks[0].successors, [Some(BlockId(2)), Some(BlockId(1))]);
        assert_eq!(p.blocks[1].successors, [Some(BlockId(2)), None]);
        assert_eq!(p.blocks[2].successors, [None, None]);
        let b = p.blocks[0].instructions[0].as_branch().expect("branch");
        assert_eq!(b.target, BlockId(2));
    }

    #[test]
    fn unknown_opcode_suggests_mul_slot() {
        let r = resolve_src(".target v42\nblock a:\n  fmul rf1, rf2, rf3\n");
        let d = &r.diagnostics[0];
        assert_eq!(d.code, Some(codes::E0100));
        assert!(d.hint.as_deref().is_some_and(|h| h.contains("nop ; fmul")));
    }

    #[test]
    fn resolution_errors() {
        assert_eq!(first_error(".target v42\nblock a:\n  fadd rf1, rf2\n"), codes::E0110);
        assert_eq!(first_error(".target v42\nblock a:\n  fadd rf1, rf2, rx\n"), codes::E0101);
        assert_eq!(first_error(".target v71\nblock a:\n  fadd rf1, r4, rf2\n"), codes::E0104);
        assert_eq!(first_error(".target v42\nblock a:\n  recip rf1, rf2\n"), codes::E0104);
        assert_eq!(first_error(".target v42\nblock a:\n  fadd rf1, rf2, 99\n"), codes::E0106);
        assert_eq!(first_error(".target v42\nblock a:\nblock a:\n"), codes::E0103);
        assert_eq!(first_error(".target v42\nblock a:\n  b nowhere\n"), codes::E0102);
        assert_eq!(first_error(".target v42\nblock a:\n  b a\n  nop ; nop\n"), codes::E0111);
        assert_eq!(first_error("  nop ; nop\n"), codes::E0112);
        assert_eq!(first_error(".target v42\nblock a:\n  nop ; nop ; ldunif [unif=3]\n"), codes::E0109);
        assert_eq!(first_error(".target v99\n"), codes::E0108);
        assert_eq!(first_error(".target v42\nblock a:\n  nop ; nop [bogus]\n"), codes::E0107);
        assert_eq!(first_error(".target v42\nblock a:\n  nop ; nop ; ldunif\n"), codes::E0107);
        assert_eq!(
            first_error(".target v42\nblock a:\n  fadd rf1, rf2, rf3 ; nop ; thrsw\n"),
            codes::E0105
        );
    }

    #[test]
    fn uniform_values_are_32_bit_words() {
        let p = resolve_ok(
            ".target v71\n.uniform const -1\n.uniform const 0xffffffff\nblock a:\n  \
             nop ; nop ; ldunifrf.rf1 [unif=0]\n  nop ; nop ; ldunifrf.rf2 [unif=1]\n",
        );
        assert_eq!(p.uniforms[0].value, u32::MAX);
        assert_eq!(p.uniforms[1].value, u32::MAX);
        assert_eq!(
            first_error(".target v71\n.uniform const 4294967296\nblock a:\n  nop ; nop\n"),
            codes::E0108
        );
    }

    #[test]
    fn warnings_for_unused_uniforms_and_empty_program() {
        let r = resolve_src(".target v42\n.uniform const 7\nblock a:\n");
        let codes_seen: Vec<_> = r.diagnostics.iter().filter_map(|d| d.code).collect();
        assert!(codes_seen.contains(&codes::W0002));
        assert!(codes_seen.contains(&codes::W0001));
        assert!(r.diagnostics.iter().all(|d| !d.is_error()));
    }
}
