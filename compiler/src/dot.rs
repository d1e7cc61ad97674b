// dot.rs — Graphviz DOT output for per-block dependency graphs
//
// Builds the scheduling dependency graph of every block and renders it in
// DOT format, one cluster per block. Nodes show the instruction and its
// critical-path delay; edges show the issue latency. Write-after-read
// edges are dashed.
//
// Preconditions: `program` is a resolved program.
// Postconditions: returns a valid DOT string.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::critical_path::{compute_delays, critical_path_length, latency};
use crate::dep_graph;
use crate::program::Program;

/// Emit the dependency graph of every block as a Graphviz DOT string.
pub fn emit_dot(program: &Program) -> String {
    let caps = program.device.caps();
    let mut buf = String::new();
    writeln!(buf, "digraph qpusched {{").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Courier\", fontsize=10, shape=box];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for (b, block) in program.blocks.iter().enumerate() {
        let mut graph = dep_graph::build(&block.instructions, &caps);
        compute_delays(&mut graph);

        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_b{b} {{").unwrap();
        writeln!(
            buf,
            "        label=\"block {} (critical path {})\";",
            escape(&block.label),
            critical_path_length(&graph)
        )
        .unwrap();
        writeln!(buf, "        style=rounded;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();

        for (id, node) in graph.nodes.iter().enumerate() {
            let attrs = if graph.heads().contains(&id) {
                ", style=bold"
            } else {
                ""
            };
            writeln!(
                buf,
                "        b{b}_n{id} [label=\"{}: {}\\ndelay={}\"{attrs}];",
                node.index,
                escape(&node.inst.to_string()),
                node.delay
            )
            .unwrap();
        }
        for (parent, edge) in graph.edges() {
            let lat = latency(&graph.node(parent).inst, &graph.node(edge.child).inst);
            let style = if edge.write_after_read {
                ", style=dashed"
            } else {
                ""
            };
            writeln!(
                buf,
                "        b{b}_n{parent} -> b{b}_n{} [label=\"{lat}\"{style}];",
                edge.child
            )
            .unwrap();
        }
        writeln!(buf, "    }}").unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

/// Escape a string for use inside a quoted DOT label.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, Generation};
    use crate::inst::{AddOp, Alu, AluSlot, Dest, Inst, Src};
    use crate::program::Block;

    fn fadd(d: u8, a: u8, b: u8) -> Inst {
        let mut alu = Alu::nop();
        alu.add = AluSlot::new(AddOp::Fadd, Dest::Rf(d), Some(Src::Rf(a)), Some(Src::Rf(b)));
        Inst::alu(alu)
    }

    fn program(blocks: Vec<Vec<Inst>>) -> Program {
        let mut p = Program::new(DeviceInfo::new(Generation::V71));
        for (i, insts) in blocks.into_iter().enumerate() {
            let mut b = Block::new(format!("b{i}"));
            b.instructions = insts;
            p.blocks.push(b);
        }
        p
    }

    #[test]
    fn valid_dot_structure() {
        let dot = emit_dot(&program(vec![vec![fadd(1, 2, 3), fadd(4, 1, 1)]]));
        assert!(dot.starts_with("digraph qpusched {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains("subgraph cluster_b0"));
        assert!(dot.contains("b0_n0 -> b0_n1"));
    }

    #[test]
    fn write_after_read_edges_are_dashed() {
        // n1 reads rf2, n2 overwrites it.
        let dot = emit_dot(&program(vec![vec![fadd(1, 5, 5), fadd(3, 2, 2), fadd(2, 6, 6)]]));
        assert!(dot.contains("b0_n1 -> b0_n2 [label=\"1\", style=dashed];"));
    }

    #[test]
    fn one_cluster_per_block() {
        let dot = emit_dot(&program(vec![vec![fadd(1, 2, 3)], vec![fadd(4, 5, 6)]]));
        assert!(dot.contains("cluster_b0"));
        assert!(dot.contains("cluster_b1"));
        assert!(dot.contains("b1_n0"));
    }

    #[test]
    fn deterministic_output() {
        let p = program(vec![vec![fadd(1, 2, 3), fadd(4, 1, 2), fadd(5, 4, 1)]]);
        assert_eq!(emit_dot(&p), emit_dot(&p));
    }
}
