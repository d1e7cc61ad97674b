// Parser for .qasm source files.
//
// Parses a token stream (from the lexer) into an AST. Grammar:
//
//   file        = NL* (line (NL+ line)*)? NL*
//   line        = directive | block_header | inst_line
//   directive   = '.' IDENT arg*
//   block_header= 'block' IDENT ('->' IDENT (',' IDENT)*)? ':'
//   inst_line   = part (';' part)* ('[' arg (',' arg)* ']')?
//   part        = IDENT ('.' IDENT)* (value (',' value)*)?
//   arg         = IDENT ('=' value)? | value
//
// Uses chumsky combinators.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub file: Option<SourceFile>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a .qasm source string. Lexes then parses.
///
/// Lex errors come first in `errors`, then parse errors.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = file_parser(source);
    let (file, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        file,
        errors: all_errors,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `file_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn file_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, SourceFile, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Newlines ──

    let nl = just(Token::Newline).repeated().ignored();

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Value ──

    let literal = select! {
        Token::Int(v) = e => Value::Int(v, e.span()),
        Token::Hex(v) = e => Value::Int(v, e.span()),
        Token::Float(v) = e => Value::Float(v, e.span()),
    };

    let value = ident.clone().map(Value::Ident).or(literal.clone());

    // ── Arg: key=value or bare value ──

    let arg = {
        let ident_arg = ident
            .clone()
            .then(just(Token::Equals).ignore_then(value.clone()).or_not())
            .map_with(|(name, opt_val), e| match opt_val {
                Some(value) => Arg {
                    key: Some(name),
                    value,
                    span: e.span(),
                },
                None => Arg {
                    key: None,
                    value: Value::Ident(name),
                    span: e.span(),
                },
            });
        let literal_arg = literal.clone().map_with(|value, e| Arg {
            key: None,
            value,
            span: e.span(),
        });
        ident_arg.or(literal_arg)
    };

    // ── Directive ──

    let directive = just(Token::Dot)
        .ignore_then(ident.clone())
        .then(arg.clone().repeated().collect::<Vec<_>>())
        .map(|(name, args)| LineKind::Directive(Directive { name, args }));

    // ── Block header ──

    let successors = just(Token::Arrow)
        .ignore_then(
            ident
                .clone()
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .or_not()
        .map(Option::unwrap_or_default);

    let block_header = just(Token::Block)
        .ignore_then(ident.clone())
        .then(successors)
        .then_ignore(just(Token::Colon))
        .map(|(label, successors)| LineKind::BlockHeader(BlockHeader { label, successors }));

    // ── Instruction line ──

    let part = ident
        .clone()
        .then(
            just(Token::Dot)
                .ignore_then(ident.clone())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then(
            value
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>(),
        )
        .map_with(|((opcode, suffixes), operands), e| Part {
            opcode,
            suffixes,
            operands,
            span: e.span(),
        });

    let attrs = arg
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket))
        .or_not()
        .map(Option::unwrap_or_default);

    let inst_line = part
        .separated_by(just(Token::Semi))
        .at_least(1)
        .collect::<Vec<_>>()
        .then(attrs)
        .map(|(parts, attrs)| LineKind::Inst(InstLine { parts, attrs }));

    // ── Line dispatch ──

    let line = choice((directive, block_header, inst_line)).map_with(|kind, e| Line {
        kind,
        span: e.span(),
    });

    // ── File ──

    nl.clone()
        .ignore_then(
            line.separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map_with(move |lines, e| SourceFile {
            lines,
            span: e.span(),
        })
}

// ── Tests ──
