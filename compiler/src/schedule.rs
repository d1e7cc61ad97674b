// schedule.rs — List scheduling of QPU instructions
//
// Schedules every block of a program in order with one shared scoreboard.
// Per block: build the dependency graph, annotate critical-path delays, then
// repeatedly pick the best ready instruction, pair as many other ready
// instructions into its bundle as the encoder allows, and emit the bundle
// (handing thread switches and branches to the delay-slot packer). After
// the last block the program-end thread switch is emitted.
//
// Preconditions: `program` passed resolve validation (uniform indices in
//   range, branches last in their block, standalone thrsw instructions).
// Postconditions: every source instruction is represented exactly once in
//   the output; dependency order is preserved; branch offsets are not yet
//   resolved (see finalize.rs).
// Failure modes: dependency cycles (E0200), missing merge point for a last
//   thrsw (E0201), uniform index out of range (E0109).
// Side effects: none. The optional trace is returned in the result.

use std::fmt;

use crate::critical_path::compute_delays;
use crate::dep_graph::{self, DepGraph, NodeId};
use crate::device::{Caps, DeviceInfo, ShaderStage};
use crate::diag::{codes, Diagnostic};
use crate::encoder::{BundleEncoder, QpuEncoder};
use crate::inst::{Dest, Inst, Signals, Src};
use crate::program::{Block, Program, ScheduleStats, ScheduledBlock, ScheduledProgram, Uniform};
use crate::scoreboard::{instruction_priority, Scoreboard, MAX_SCHEDULE_PRIORITY};
use crate::delay_slots::valid_after_thrsw;

// ── Options and trace ──

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedOptions {
    /// Record a per-tick trace of the ready list and choices.
    pub debug: bool,
}

/// Human-readable log of scheduling decisions, filled when
/// `SchedOptions::debug` is set.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    lines: Vec<String>,
}

impl Trace {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Result of scheduling a program.
#[derive(Debug)]
pub struct ScheduleResult {
    pub schedule: ScheduledProgram,
    pub trace: Trace,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Scheduler state ──

/// A ready instruction picked by `choose`, with the bundle it forms when
/// paired with the instruction being built.
struct Choice {
    node: NodeId,
    bundle: Option<Inst>,
}

/// Program-wide scheduling state.
pub(crate) struct Scheduler<'a, E: BundleEncoder + ?Sized> {
    pub(crate) device: &'a DeviceInfo,
    pub(crate) caps: Caps,
    pub(crate) encoder: &'a E,
    pub(crate) scoreboard: Scoreboard,
    /// Instructions emitted so far, across all blocks.
    pub(crate) inst_count: u32,
    stats: ScheduleStats,
    trace: Option<Trace>,
}

impl<'a, E: BundleEncoder + ?Sized> Scheduler<'a, E> {
    pub(crate) fn new(device: &'a DeviceInfo, encoder: &'a E, options: &SchedOptions) -> Self {
        Scheduler {
            device,
            caps: device.caps(),
            encoder,
            scoreboard: Scoreboard::new(),
            inst_count: 0,
            stats: ScheduleStats::default(),
            trace: options.debug.then(Trace::default),
        }
    }

    pub(crate) fn trace(&mut self, line: impl FnOnce() -> String) {
        if let Some(t) = self.trace.as_mut() {
            t.push(line());
        }
    }

    /// Append `inst` to the block and advance the clock.
    pub(crate) fn insert_scheduled(&mut self, out: &mut Vec<Inst>, inst: Inst) {
        self.scoreboard.update_for_chosen(&self.caps, &inst);
        out.push(inst);
        self.inst_count += 1;
        self.scoreboard.tick += 1;
    }

    pub(crate) fn emit_nop(&mut self, out: &mut Vec<Inst>) {
        let nop = self.encoder.nop();
        self.insert_scheduled(out, nop);
    }

    // ── Selection ──

    fn ldvary_pipelining(&self) -> bool {
        self.device.stage == ShaderStage::Fragment
            && self.scoreboard.ldvary_count < self.device.num_inputs
    }

    /// Whether `inst` may issue at the current tick, ignoring pairing.
    fn issuable(&self, graph: &DepGraph, inst: &Inst) -> bool {
        let sb = &self.scoreboard;
        let caps = &self.caps;

        // Branches go last in the block.
        if inst.is_branch() && graph.heads().len() != 1 {
            return false;
        }
        if inst.has_sig(Signals::LDUNIFA.or(Signals::LDUNIFARF))
            && sb.tick - sb.last_unifa_write_tick <= 3
        {
            return false;
        }
        if sb.reads_too_soon(caps, inst) || sb.writes_too_soon(caps, inst) {
            return false;
        }
        if sb.pixel_scoreboard_too_soon(self.device.lock_scoreboard_on_first_thrsw, inst) {
            return false;
        }
        // ldunif writes the ldvary destination register a tick sooner.
        if inst.has_sig(Signals::LDUNIF.or(Signals::LDUNIFA))
            && sb.tick == sb.last_ldvary_tick + 1
        {
            return false;
        }
        if sb.last_thrsw_tick + 2 >= sb.tick && !valid_after_thrsw(sb, caps, inst) {
            return false;
        }
        if let Some(branch) = inst.as_branch() {
            if sb.last_branch_tick + 3 >= sb.tick || sb.last_unifa_write_tick + 3 >= sb.tick {
                return false;
            }
            if sb.last_setmsf_tick == sb.tick - 1 && !branch.is_safe_after_setmsf() {
                return false;
            }
        }
        true
    }

    /// Pairing checks against the bundle under construction. Returns the
    /// merged bundle when `inst` may join it.
    fn pair_with(&self, prev: &Inst, inst: &Inst) -> Option<Inst> {
        let sb = &self.scoreboard;
        if inst.has_sig(Signals::THRSW) {
            return None;
        }
        if prev.has_uniform() && inst.has_uniform() {
            return None;
        }
        // Two uniform-stream loads in one bundle.
        let ldunifa = Signals::LDUNIFA.or(Signals::LDUNIFARF);
        if (prev.has_uniform() && inst.has_sig(ldunifa))
            || (prev.has_sig(ldunifa) && inst.has_uniform())
        {
            return None;
        }
        if sb.pixel_scoreboard_too_soon(self.device.lock_scoreboard_on_first_thrsw, inst) {
            return None;
        }
        // A paired ldvary moves up one instruction, which must not be the
        // last slot of a thrsw.
        if inst.has_sig(Signals::LDVARY) {
            let in_window = if self.caps.ldvary_in_thrsw_slot_1 {
                sb.last_thrsw_tick + 2 == sb.tick - 1
            } else {
                sb.last_thrsw_tick + 2 >= sb.tick - 1
            };
            if in_window {
                return None;
            }
        }
        // Don't overflow the TMU output FIFO behind a stalling ldtmu.
        if prev.has_sig(Signals::LDTMU)
            && !sb.first_ldtmu_after_thrsw
            && sb.pending_ldtmu_count + inst.ldtmu_count > self.device.tmu_fifo_share()
        {
            return None;
        }
        self.encoder.try_merge(prev, inst)
    }

    /// Pick the next instruction to issue (`prev` is `None`) or to pair into
    /// the bundle `prev`.
    fn choose(&mut self, graph: &DepGraph, prev: Option<&Inst>) -> Option<Choice> {
        if prev.is_some_and(|p| p.has_sig(Signals::THRSW)) {
            return None;
        }

        let mut pipelining = self.ldvary_pipelining();
        let choice = loop {
            let mut skipped_for_pipelining = false;
            let mut best: Option<(Choice, i32, u32)> = None;

            for &id in graph.heads() {
                let node = graph.node(id);
                let inst = &node.inst;

                // Keep ldunif out of the way of an ldvary sequence.
                if pipelining && inst.has_sig(Signals::LDUNIF.or(Signals::LDUNIFRF)) {
                    skipped_for_pipelining = true;
                    continue;
                }
                if !self.issuable(graph, inst) {
                    continue;
                }

                let bundle = match prev {
                    Some(p) => match self.pair_with(p, inst) {
                        Some(b) => Some(b),
                        None => continue,
                    },
                    None => None,
                };

                let mut prio = instruction_priority(inst);
                if self.scoreboard.read_stalls(inst) {
                    if prev.is_some() {
                        continue;
                    }
                    prio -= MAX_SCHEDULE_PRIORITY;
                }

                let better = match &best {
                    None => true,
                    Some((_, best_prio, best_delay)) => {
                        prio > *best_prio || (prio == *best_prio && node.delay > *best_delay)
                    }
                };
                if better {
                    best = Some((Choice { node: id, bundle }, prio, node.delay));
                }
            }

            if best.is_none() && prev.is_none() && skipped_for_pipelining && pipelining {
                pipelining = false;
                continue;
            }
            break best.map(|(c, _, _)| c);
        };

        if let Some(c) = &choice {
            if graph.node(c.node).inst.has_sig(Signals::LDVARY) {
                self.scoreboard.ldvary_count += 1;
                if prev.is_some() {
                    self.scoreboard.fixup_ldvary = true;
                }
            }
        }
        choice
    }

    // ── ldvary pipelining ──

    /// Move the ldvary just paired into `inst` up into the previously
    /// emitted instruction, so the next instruction of the ldvary sequence
    /// can pair into `inst`.
    fn fixup_pipelined_ldvary(&mut self, out: &mut [Inst], inst: &mut Inst) -> bool {
        let Some(alu) = inst.as_alu() else {
            return false;
        };
        let Some(dest) = alu.sig_dest else {
            return false;
        };

        // The ldvary result would overwrite an operand of `inst`.
        let reads_dest = alu.sources().any(|s| match (s, dest) {
            (Src::Rf(r), Dest::Rf(d)) => r == d,
            (Src::Acc(a), Dest::Magic(w)) => w.accumulator() == Some(a),
            _ => false,
        });
        if reads_dest {
            return false;
        }
        // ldunif would write the ldvary register in the same tick.
        if alu.sigs.contains(Signals::LDUNIF) {
            return false;
        }

        let Some(prev) = out.last_mut() else {
            return false;
        };
        let Some(palu) = prev.as_alu() else {
            return false;
        };
        if palu.add_dest() == Some(dest) || palu.mul_dest() == Some(dest) {
            return false;
        }
        if palu.sig_writes_address() || !self.encoder.sig_packable(prev, Signals::LDVARY) {
            return false;
        }
        // ldvary's destination is encoded in the condition field.
        if prev.writes_flags() || prev.reads_flags() {
            return false;
        }

        if let Some(palu) = prev.as_alu_mut() {
            palu.sigs.insert(Signals::LDVARY);
            palu.sig_dest = Some(dest);
        }
        self.scoreboard.last_ldvary_tick = self.scoreboard.tick - 1;

        if let Some(alu) = inst.as_alu_mut() {
            alu.sigs.remove(Signals::LDVARY);
            alu.sig_dest = None;
        }

        if self.caps.implicit_rf0 {
            self.scoreboard.last_implicit_rf0_write_tick = self.scoreboard.tick;
            self.scoreboard.set_rf0_flops_conflict(inst);
        }
        true
    }

    // ── Block loop ──

    fn dump_state(&mut self, graph: &DepGraph, time: u32) {
        if self.trace.is_none() {
            return;
        }
        self.trace(|| format!("t={:4}: current list:", time));
        for &id in graph.heads() {
            let node = graph.node(id);
            self.trace(|| format!("         t={:4}: {}", node.unblocked_time, node.inst));
            for e in &node.children {
                let child = graph.node(e.child);
                self.trace(|| {
                    format!(
                        "                 - {} ({} parents, {})",
                        child.inst,
                        child.parent_count,
                        if e.write_after_read { 'w' } else { 'r' }
                    )
                });
            }
        }
    }

    /// Schedule one block, appending to `uniforms_out` the uniform-stream
    /// entries in their new order.
    fn schedule_block(
        &mut self,
        block: &Block,
        uniforms: &[Uniform],
        uniforms_out: &mut Vec<Uniform>,
        sched: &mut ScheduledBlock,
    ) -> Result<u32, Diagnostic> {
        let instructions: Vec<Inst> = block
            .instructions
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                let mut inst = inst.clone();
                inst.origins = vec![i as u32];
                inst
            })
            .collect();
        let mut graph = dep_graph::build(&instructions, &self.caps);
        compute_delays(&mut graph);

        let mut out: Vec<Inst> = Vec::with_capacity(instructions.len());
        let mut time: u32 = 0;

        while !graph.heads().is_empty() {
            self.dump_state(&graph, time);
            let chosen = self.choose(&graph, None);

            let mut inst = match &chosen {
                Some(c) => graph.node(c.node).inst.clone(),
                None => self.encoder.nop(),
            };
            self.trace(|| format!("t={:4}: chose:   {}", time, inst));

            let mut merged: Vec<NodeId> = Vec::new();
            if let Some(c) = &chosen {
                time = time.max(graph.node(c.node).unblocked_time);
                graph.pre_remove_head(c.node);

                while let Some(m) = self.choose(&graph, Some(&inst)) {
                    time = time.max(graph.node(m.node).unblocked_time);
                    graph.pre_remove_head(m.node);
                    merged.push(m.node);
                    if let Some(bundle) = m.bundle {
                        inst = bundle;
                    }
                    self.stats.merged += 1;
                    self.trace(|| format!("t={:4}: merging: {}", time, graph.node(m.node).inst));
                    self.trace(|| format!("         result: {}", inst));

                    if self.scoreboard.fixup_ldvary {
                        self.scoreboard.fixup_ldvary = false;
                        if self.fixup_pipelined_ldvary(&mut out, &mut inst) {
                            // Lets the next instruction of the ldvary
                            // sequence pair into this bundle.
                            graph.mark_scheduled(m.node, time);
                        }
                    }
                }
                if self.scoreboard.read_stalls(&inst) {
                    self.stats.stalls += 1;
                }
            }

            // Rewrite the uniform index to its position in the new stream.
            if let Some(index) = inst.uniform {
                let entry = uniforms.get(index as usize).copied().ok_or_else(|| {
                    Diagnostic::error(
                        codes::E0109,
                        block.span,
                        format!("uniform index {} out of range in block `{}`", index, block.label),
                    )
                })?;
                let next = uniforms_out.len() as u32;
                if inst.is_branch() {
                    sched.branch_uniform = Some(next);
                }
                uniforms_out.push(entry);
                inst.uniform = Some(next);
            }

            if let Some(c) = &chosen {
                graph.mark_scheduled(c.node, time);
            }
            for &m in &merged {
                graph.mark_scheduled(m, time);
            }

            if inst.has_sig(Signals::THRSW) {
                time += self.emit_thrsw(&mut out, inst, false)?;
            } else if inst.is_branch() {
                sched.branch_ip = Some(self.emit_branch(&mut out, inst));
            } else {
                self.insert_scheduled(&mut out, inst);
            }
        }

        if let Some(id) = graph.unscheduled().next() {
            return Err(Diagnostic::error(
                codes::E0200,
                block.span,
                format!(
                    "dependency cycle in block `{}` at instruction {}: {}",
                    block.label,
                    graph.node(id).index,
                    graph.node(id).inst
                ),
            ));
        }

        sched.instructions = out;
        Ok(time)
    }

    fn pre_schedule_listing(&mut self, program: &Program) {
        if self.trace.is_none() {
            return;
        }
        self.trace(|| "Pre-schedule instructions".to_string());
        for (i, block) in program.blocks.iter().enumerate() {
            self.trace(|| format!("BLOCK {} ({})", i, block.label));
            for inst in &block.instructions {
                self.trace(|| inst.to_string());
            }
        }
        self.trace(String::new);
    }
}

// ── Driver ──

/// Schedule `program` with the encoder for its target generation.
pub fn schedule(program: &Program, options: &SchedOptions) -> ScheduleResult {
    let encoder = QpuEncoder::new(program.device.caps());
    schedule_with(program, &encoder, options)
}

/// Schedule every block in program order with one shared scoreboard, then
/// emit the program-end thread switch into the last block.
pub fn schedule_with<E: BundleEncoder + ?Sized>(
    program: &Program,
    encoder: &E,
    options: &SchedOptions,
) -> ScheduleResult {
    let mut s = Scheduler::new(&program.device, encoder, options);
    s.pre_schedule_listing(program);

    let mut diagnostics = Vec::new();
    let mut uniforms_out: Vec<Uniform> = Vec::with_capacity(program.uniforms.len());
    let mut blocks: Vec<ScheduledBlock> = Vec::with_capacity(program.blocks.len());
    let mut estimated_cycles: u32 = 0;

    for block in &program.blocks {
        let mut sched = ScheduledBlock::new(block.label.clone(), block.successors);
        sched.start_ip = s.inst_count;
        sched.start_uniform = uniforms_out.len() as u32;
        match s.schedule_block(block, &program.uniforms, &mut uniforms_out, &mut sched) {
            Ok(cycles) => estimated_cycles += cycles,
            Err(d) => {
                diagnostics.push(d);
                blocks.push(sched);
                break;
            }
        }
        sched.end_ip = s.inst_count.saturating_sub(1).max(sched.start_ip);
        blocks.push(sched);
    }

    if diagnostics.is_empty() {
        if let Some(last) = blocks.last_mut() {
            let mut out = std::mem::take(&mut last.instructions);
            match s.emit_thrsw(&mut out, Inst::thrsw(), true) {
                Ok(_) => {}
                Err(d) => diagnostics.push(d),
            }
            last.instructions = out;
            last.end_ip = s.inst_count.saturating_sub(1);
        }
    }

    let mut stats = s.stats;
    stats.cycles = s.inst_count;
    stats.instructions = program.instruction_count() as u32;
    stats.nops = blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| encoder.is_nop(i))
        .count() as u32;
    stats.estimated_cycles = estimated_cycles;

    ScheduleResult {
        schedule: ScheduledProgram {
            device: program.device.clone(),
            uniforms: uniforms_out,
            blocks,
            stats,
        },
        trace: s.trace.unwrap_or_default(),
        diagnostics,
    }
}
