// qpusched — QPU instruction scheduler
//
// Library root. Leaf modules first: device and instruction model, then the
// per-block scheduler pieces, then finalization, verification and the
// pipeline that strings them together.

pub mod ast;
pub mod critical_path;
pub mod delay_slots;
pub mod dep_graph;
pub mod device;
pub mod diag;
pub mod dot;
pub mod encoder;
pub mod finalize;
pub mod inst;
pub mod lexer;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod program;
pub mod resolve;
pub mod schedule;
pub mod scoreboard;
pub mod verify;
