// dep_graph.rs — Per-block dependency DAG
//
// Builds the read/write hazard graph for one basic block. Every topological
// order of the graph is a legal reordering of the block (timing aside).
// Edges always point from an earlier instruction to a later one.
//
// Two passes over the block: forward (program order) records true and
// output dependencies, reverse records anti-dependencies so a reader stays
// ahead of the next writer. Anti-dependency edges are tagged so the
// scheduler can drop them when the reader issues, letting the writer share
// the reader's bundle.
//
// Preconditions: instructions passed resolve validation.
// Postconditions: no self edges; each (parent, child, kind) edge appears
//   once.
// Failure modes: none.
// Side effects: none.

use crate::critical_path::latency;
use crate::device::Caps;
use crate::inst::{AddOp, Dest, Inst, MulOp, Signals, Src, Waddr};

pub type NodeId = usize;

/// Outgoing edge of a schedule node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEdge {
    pub child: NodeId,
    /// Created by the reverse pass: the parent only reads what the child
    /// overwrites.
    pub write_after_read: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleNode {
    pub inst: Inst,
    /// Index of the instruction in the source block.
    pub index: u32,
    /// Critical-path length from this node to the end of the block.
    pub delay: u32,
    /// Earliest tick at which the node's inputs are ready.
    pub unblocked_time: u32,
    pub children: Vec<DepEdge>,
    pub parent_count: u32,
    pub scheduled: bool,
}

/// Arena DAG with a ready list ("heads") in insertion order.
#[derive(Debug, Clone)]
pub struct DepGraph {
    pub nodes: Vec<ScheduleNode>,
    heads: Vec<NodeId>,
}

impl DepGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Unscheduled nodes with no unresolved parents, oldest first.
    pub fn heads(&self) -> &[NodeId] {
        &self.heads
    }

    pub fn node(&self, id: NodeId) -> &ScheduleNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ScheduleNode {
        &mut self.nodes[id]
    }

    /// All edges as `(parent, edge)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, DepEdge)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(p, n)| n.children.iter().map(move |e| (p, *e)))
    }

    pub fn unscheduled(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.scheduled)
            .map(|(i, _)| i)
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId, write_after_read: bool) {
        if parent == child {
            return;
        }
        let edge = DepEdge {
            child,
            write_after_read,
        };
        if self.nodes[parent].children.contains(&edge) {
            return;
        }
        self.nodes[parent].children.push(edge);
        self.nodes[child].parent_count += 1;
    }

    fn remove_from_heads(&mut self, id: NodeId) {
        self.heads.retain(|&h| h != id);
    }

    fn release_child(&mut self, child: NodeId) {
        let c = &mut self.nodes[child];
        c.parent_count -= 1;
        if c.parent_count == 0 && !c.scheduled {
            self.heads.push(child);
        }
    }

    /// Take `id` off the ready list and drop its anti-dependency edges, so
    /// instructions that only had to wait for this read may join its bundle.
    pub fn pre_remove_head(&mut self, id: NodeId) {
        self.remove_from_heads(id);
        let (war, rest): (Vec<DepEdge>, Vec<DepEdge>) = self.nodes[id]
            .children
            .iter()
            .partition(|e| e.write_after_read);
        self.nodes[id].children = rest;
        for e in war {
            self.release_child(e.child);
        }
    }

    /// Retire `id`: propagate readiness to its children and release them.
    pub fn mark_scheduled(&mut self, id: NodeId, time: u32) {
        self.remove_from_heads(id);
        self.nodes[id].scheduled = true;
        let children = std::mem::take(&mut self.nodes[id].children);
        for e in &children {
            let latency = latency(&self.nodes[id].inst, &self.nodes[e.child].inst);
            let child = &mut self.nodes[e.child];
            child.unblocked_time = child.unblocked_time.max(time + latency);
        }
        for e in children {
            self.release_child(e.child);
        }
    }
}

// ── Builder ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Last writer of every hazard-tracked location.
struct DepState {
    dir: Direction,
    last_r: [Option<NodeId>; 6],
    last_rf: [Option<NodeId>; 64],
    last_sf: Option<NodeId>,
    last_vpm_read: Option<NodeId>,
    last_tmu_write: Option<NodeId>,
    last_tmu_config: Option<NodeId>,
    last_tmu_read: Option<NodeId>,
    last_tlb: Option<NodeId>,
    last_vpm: Option<NodeId>,
    last_unif: Option<NodeId>,
    last_rtop: Option<NodeId>,
    last_unifa: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
enum Loc {
    R(usize),
    Rf(usize),
    Sf,
    VpmRead,
    TmuWrite,
    TmuConfig,
    TmuRead,
    Tlb,
    Vpm,
    Unif,
    Rtop,
    Unifa,
}

impl DepState {
    fn new(dir: Direction) -> Self {
        DepState {
            dir,
            last_r: [None; 6],
            last_rf: [None; 64],
            last_sf: None,
            last_vpm_read: None,
            last_tmu_write: None,
            last_tmu_config: None,
            last_tmu_read: None,
            last_tlb: None,
            last_vpm: None,
            last_unif: None,
            last_rtop: None,
            last_unifa: None,
        }
    }

    fn slot(&mut self, loc: Loc) -> &mut Option<NodeId> {
        match loc {
            Loc::R(n) => &mut self.last_r[n],
            Loc::Rf(n) => &mut self.last_rf[n],
            Loc::Sf => &mut self.last_sf,
            Loc::VpmRead => &mut self.last_vpm_read,
            Loc::TmuWrite => &mut self.last_tmu_write,
            Loc::TmuConfig => &mut self.last_tmu_config,
            Loc::TmuRead => &mut self.last_tmu_read,
            Loc::Tlb => &mut self.last_tlb,
            Loc::Vpm => &mut self.last_vpm,
            Loc::Unif => &mut self.last_unif,
            Loc::Rtop => &mut self.last_rtop,
            Loc::Unifa => &mut self.last_unifa,
        }
    }
}

struct Builder<'a> {
    graph: &'a mut DepGraph,
    state: DepState,
    caps: &'a Caps,
}

impl Builder<'_> {
    fn add_dep(&mut self, before: Option<NodeId>, after: NodeId, write: bool) {
        let Some(before) = before else {
            return;
        };
        let write_after_read = !write && self.state.dir == Direction::Reverse;
        match self.state.dir {
            Direction::Forward => self.graph.add_edge(before, after, write_after_read),
            Direction::Reverse => self.graph.add_edge(after, before, write_after_read),
        }
    }

    fn read(&mut self, loc: Loc, n: NodeId) {
        let before = *self.state.slot(loc);
        self.add_dep(before, n, false);
    }

    fn write(&mut self, loc: Loc, n: NodeId) {
        let before = *self.state.slot(loc);
        self.add_dep(before, n, true);
        *self.state.slot(loc) = Some(n);
    }

    fn source(&mut self, src: Src, n: NodeId) {
        match src {
            Src::Acc(r) if (r as usize) < 6 => self.read(Loc::R(r as usize), n),
            Src::Rf(r) if (r as usize) < 64 => self.read(Loc::Rf(r as usize), n),
            _ => {}
        }
    }

    fn waddr(&mut self, dest: Dest, n: NodeId) {
        let w = match dest {
            Dest::Rf(r) => {
                if (r as usize) < 64 {
                    self.write(Loc::Rf(r as usize), n);
                }
                return;
            }
            Dest::Magic(w) => w,
        };

        if w.is_tmu() {
            if w.is_tmu_sequence_terminator() || w == Waddr::Tmud {
                self.write(Loc::TmuWrite, n);
            } else {
                self.read(Loc::TmuWrite, n);
            }
            if w.is_tmu_sequence_terminator() {
                self.write(Loc::TmuConfig, n);
            }
            return;
        }
        if w.is_sfu() {
            // Covered by the implicit r4 write.
            return;
        }
        match w {
            Waddr::R0 | Waddr::R1 | Waddr::R2 => {
                if let Some(r) = w.accumulator() {
                    self.write(Loc::R(r as usize), n);
                }
            }
            Waddr::R3 | Waddr::R4 | Waddr::R5 => {}
            Waddr::Vpm | Waddr::Vpmu => self.write(Loc::Vpm, n),
            Waddr::Tlb | Waddr::Tlbu => self.write(Loc::Tlb, n),
            Waddr::Sync | Waddr::Syncb | Waddr::Syncu => {
                self.write(Loc::TmuWrite, n);
                self.write(Loc::TmuRead, n);
            }
            Waddr::Unifa => self.write(Loc::Unifa, n),
            _ => {}
        }
    }

    fn calculate_deps(&mut self, n: NodeId) {
        let inst = self.graph.nodes[n].inst.clone();
        let caps = self.caps;

        if let Some(branch) = inst.as_branch() {
            if branch.cond != crate::inst::BranchCond::Always {
                self.read(Loc::Sf, n);
            }
            self.write(Loc::Unif, n);
            return;
        }
        let Some(alu) = inst.as_alu() else {
            return;
        };

        for src in alu.sources() {
            self.source(src, n);
        }

        match alu.add.op {
            AddOp::Vpmsetup => {
                self.write(Loc::Vpm, n);
                self.write(Loc::VpmRead, n);
            }
            AddOp::Stvpmv | AddOp::Stvpmd | AddOp::Stvpmp => self.write(Loc::Vpm, n),
            AddOp::Ldvpmv | AddOp::Ldvpmd | AddOp::Ldvpmg | AddOp::Ldvpmp => {
                self.write(Loc::Vpm, n)
            }
            AddOp::Vpmwt => self.read(Loc::Vpm, n),
            AddOp::Msf => self.read(Loc::Tlb, n),
            AddOp::Setmsf => {
                self.write(Loc::TmuWrite, n);
                self.write(Loc::Tlb, n);
            }
            AddOp::Setrevf => self.write(Loc::Tlb, n),
            _ => {}
        }

        // MULTOP sets rtop and UMUL24 consumes it; keep both in order.
        if matches!(alu.mul.op, MulOp::Multop | MulOp::Umul24) {
            self.write(Loc::Rtop, n);
        }

        if let Some(d) = alu.add_dest() {
            self.waddr(d, n);
        }
        if let Some(d) = alu.mul_dest() {
            self.waddr(d, n);
        }
        if let Some(d) = alu.signal_dest() {
            self.waddr(d, n);
        }

        if inst.writes_r3(caps) {
            self.write(Loc::R(3), n);
        }
        if inst.writes_r4(caps) {
            self.write(Loc::R(4), n);
        }
        if inst.writes_r5(caps) {
            self.write(Loc::R(5), n);
        }
        if inst.writes_rf0_implicitly(caps) {
            self.write(Loc::Rf(0), n);
        }

        if alu.sigs.contains(Signals::THRSW) {
            // Accumulators and flags do not survive the switch.
            for r in 0..6 {
                self.write(Loc::R(r), n);
            }
            self.write(Loc::Sf, n);
            self.write(Loc::Rtop, n);
            // Scoreboard-locked accesses stay after the last switch.
            self.write(Loc::Tlb, n);
            self.write(Loc::TmuWrite, n);
            self.write(Loc::TmuConfig, n);
        }

        if inst.waits_on_tmu() {
            // Results come back through a FIFO.
            self.write(Loc::TmuRead, n);
            self.read(Loc::TmuConfig, n);
        }

        if alu.sigs.contains(Signals::WRTMUC) {
            self.read(Loc::TmuConfig, n);
        }

        if inst.reads_tlb() {
            self.write(Loc::Tlb, n);
        }

        if inst.has_uniform() {
            self.write(Loc::Unif, n);
        }

        if alu.sigs.intersects(Signals::LDUNIFA.or(Signals::LDUNIFARF)) {
            self.write(Loc::Unifa, n);
        }

        if inst.reads_flags() {
            self.read(Loc::Sf, n);
        }
        if inst.writes_flags() {
            self.write(Loc::Sf, n);
        }
    }
}

/// Build the dependency graph of one block. Node ids equal block indices.
pub fn build(instructions: &[Inst], caps: &Caps) -> DepGraph {
    let nodes = instructions
        .iter()
        .enumerate()
        .map(|(i, inst)| ScheduleNode {
            inst: inst.clone(),
            index: i as u32,
            delay: 0,
            unblocked_time: 0,
            children: Vec::new(),
            parent_count: 0,
            scheduled: false,
        })
        .collect();
    let mut graph = DepGraph {
        nodes,
        heads: Vec::new(),
    };

    let n = graph.nodes.len();
    {
        let mut b = Builder {
            graph: &mut graph,
            state: DepState::new(Direction::Forward),
            caps,
        };
        for i in 0..n {
            b.calculate_deps(i);
        }
        b.state = DepState::new(Direction::Reverse);
        for i in (0..n).rev() {
            b.calculate_deps(i);
        }
    }

    graph.heads = (0..n).filter(|&i| graph.nodes[i].parent_count == 0).collect();
    graph
}
