// diag.rs — Diagnostics shared by every pass
//
// Parse, resolve, scheduling and verification problems are all reported as
// `Diagnostic` values carrying a stable code from `codes`.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use chumsky::span::Span as _;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`, `W0001`).
///
/// Once assigned, a code keeps its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // Parse
    pub const E0001: DiagCode = DiagCode("E0001"); // syntax error

    // Resolve
    pub const E0100: DiagCode = DiagCode("E0100"); // unknown opcode
    pub const E0101: DiagCode = DiagCode("E0101"); // unknown register or operand
    pub const E0102: DiagCode = DiagCode("E0102"); // unknown block label
    pub const E0103: DiagCode = DiagCode("E0103"); // duplicate block label
    pub const E0104: DiagCode = DiagCode("E0104"); // operand illegal on target generation
    pub const E0105: DiagCode = DiagCode("E0105"); // unencodable signal combination
    pub const E0106: DiagCode = DiagCode("E0106"); // read ports / small immediates exhausted
    pub const E0107: DiagCode = DiagCode("E0107"); // malformed attribute
    pub const E0108: DiagCode = DiagCode("E0108"); // malformed .target / .uniform directive
    pub const E0109: DiagCode = DiagCode("E0109"); // uniform index out of range
    pub const E0110: DiagCode = DiagCode("E0110"); // wrong operand count
    pub const E0111: DiagCode = DiagCode("E0111"); // branch not at end of block
    pub const E0112: DiagCode = DiagCode("E0112"); // instruction outside a block

    // Scheduling
    pub const E0200: DiagCode = DiagCode("E0200"); // dependency cycle
    pub const E0201: DiagCode = DiagCode("E0201"); // no merge point for last thrsw
    pub const E0202: DiagCode = DiagCode("E0202"); // branch not found in block tail
    pub const E0203: DiagCode = DiagCode("E0203"); // block without branch does not fall through
    pub const E0204: DiagCode = DiagCode("E0204"); // not-taken successor does not follow branch slots

    // Verification
    pub const E0300: DiagCode = DiagCode("E0300"); // schedule cert failed

    // Warnings
    pub const W0001: DiagCode = DiagCode("W0001"); // empty program
    pub const W0002: DiagCode = DiagCode("W0002"); // uniform never consumed
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    /// An error with a code.
    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }

    /// Render with a `line:col` prefix resolved against `source`.
    pub fn render(&self, path: &str, source: &str) -> String {
        let (line, col) = line_col(source, self.span.start());
        let mut out = format!("{}:{}:{}: {}", path, line, col, self);
        for rel in &self.related_spans {
            let (l, c) = line_col(source, rel.span.start());
            out.push_str(&format!("\n  note: {}:{}:{}: {}", path, l, c, rel.label));
        }
        out
    }
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
    (line, col)
}

/// Span used for diagnostics about programs built without source text.
pub fn no_span() -> Span {
    Span::new((), 0..0)
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
