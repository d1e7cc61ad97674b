// AST node types for .qasm source files.
//
// A .qasm file is a sequence of lines: directives, block headers and
// instruction lines. The AST keeps every opcode, register and attribute as
// text; resolve.rs gives them meaning for the target generation.
// Every node carries a `SimpleSpan` for error reporting in downstream phases.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete .qasm file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub lines: Vec<Line>,
    pub span: Span,
}

/// One non-empty source line with its span.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub kind: LineKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Directive(Directive),
    BlockHeader(BlockHeader),
    Inst(InstLine),
}

// ── directive: '.' IDENT arg* ──

/// `.target v42 threads=4` or `.uniform const 0x3f800000`.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: Ident,
    pub args: Vec<Arg>,
}

// ── block_header: 'block' IDENT ('->' IDENT (',' IDENT)*)? ':' ──

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub label: Ident,
    pub successors: Vec<Ident>,
}

// ── inst_line: part (';' part)* ('[' arg (',' arg)* ']')? ──

#[derive(Debug, Clone, PartialEq)]
pub struct InstLine {
    pub parts: Vec<Part>,
    pub attrs: Vec<Arg>,
}

/// One `;`-separated part: an ALU slot, a signal or a branch.
///
/// `fadd.pushz rf1, rf2, 2` has opcode `fadd`, suffix `pushz` and three
/// operands. `ldvary.rf6` has suffix `rf6` and no operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub opcode: Ident,
    pub suffixes: Vec<Ident>,
    pub operands: Vec<Value>,
    pub span: Span,
}

// ── Leaves ──

/// `key=value` or a bare value.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub key: Option<Ident>,
    pub value: Value,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Ident(Ident),
    Int(i64, Span),
    Float(f64, Span),
}

impl Value {
    pub fn span(&self) -> Span {
        match self {
            Value::Ident(id) => id.span,
            Value::Int(_, s) | Value::Float(_, s) => *s,
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Value::Ident(id) => Some(&id.name),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v, _) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
