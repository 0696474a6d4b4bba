use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, take_while};
use winnow::{ModalResult, Parser};

use conduit_types::ConduitError;

use crate::ast::*;
use crate::value::Value;

const RESERVED: &[&str] = &[
    "true", "false", "null", "and", "or", "not", "eq", "ne", "lt", "le", "gt", "ge", "div",
    "mod", "empty",
];

const EQUALITY_OPS: &[(&str, BinaryOp)] = &[
    ("==", BinaryOp::Eq),
    ("!=", BinaryOp::Ne),
    ("eq", BinaryOp::Eq),
    ("ne", BinaryOp::Ne),
];

const RELATIONAL_OPS: &[(&str, BinaryOp)] = &[
    ("<=", BinaryOp::Le),
    (">=", BinaryOp::Ge),
    ("<", BinaryOp::Lt),
    (">", BinaryOp::Gt),
    ("le", BinaryOp::Le),
    ("ge", BinaryOp::Ge),
    ("lt", BinaryOp::Lt),
    ("gt", BinaryOp::Gt),
];

const ADDITIVE_OPS: &[(&str, BinaryOp)] = &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)];

const MULTIPLICATIVE_OPS: &[(&str, BinaryOp)] = &[
    ("*", BinaryOp::Mul),
    ("/", BinaryOp::Div),
    ("%", BinaryOp::Mod),
    ("div", BinaryOp::Div),
    ("mod", BinaryOp::Mod),
];

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn backtrack() -> ErrMode<ContextError> {
    ErrMode::Backtrack(ContextError::new())
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (take_while(1, is_ident_start), take_while(0.., is_ident_char))
        .take()
        .parse_next(input)
}

/// Consume `word` if it is the next whole word in the input.
fn eat_word(input: &mut &str, word: &str) -> bool {
    match input.strip_prefix(word) {
        Some(rest) if !rest.starts_with(is_ident_char) => {
            *input = rest;
            true
        }
        _ => false,
    }
}

/// Consume the first operator of `ops` found at the start of the input.
fn eat_operator(input: &mut &str, ops: &[(&'static str, BinaryOp)]) -> Option<BinaryOp> {
    for (symbol, op) in ops {
        if symbol.starts_with(is_ident_start) {
            if eat_word(input, symbol) {
                return Some(*op);
            }
        } else if let Some(rest) = input.strip_prefix(symbol) {
            *input = rest;
            return Some(*op);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

/// Single- or double-quoted string with backslash escapes.
fn string_literal(input: &mut &str) -> ModalResult<String> {
    let quote = any
        .verify(|c: &char| *c == '"' || *c == '\'')
        .parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = any
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| make_cut_error("closing quote"))?;
        match c {
            c if c == quote => break,
            '\\' => {
                let esc = any
                    .parse_next(input)
                    .map_err(|_: ErrMode<ContextError>| make_cut_error("escape character"))?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    '\'' => s.push('\''),
                    '$' => s.push('$'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Integer or float literal (no sign; negation is a unary operator).
fn number_literal(input: &mut &str) -> ModalResult<Value> {
    let text: &str = (digit1, opt(('.', digit1))).take().parse_next(input)?;
    if text.contains('.') {
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|_| make_cut_error("float literal"))
    } else {
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| make_cut_error("integer literal within 64-bit range"))
    }
}

// ---------------------------------------------------------------------------
// Primary expressions
// ---------------------------------------------------------------------------

/// `ns:name(args)`, a keyword literal, or a dotted variable path.
fn name_expr(input: &mut &str) -> ModalResult<Expr> {
    let first = identifier.parse_next(input)?;
    match first {
        "true" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" => return Ok(Expr::Literal(Value::Bool(false))),
        "null" => return Ok(Expr::Literal(Value::Null)),
        kw if RESERVED.contains(&kw) => return Err(backtrack()),
        _ => {}
    }

    let checkpoint = *input;
    if let Some(name) = opt(preceded(':', identifier)).parse_next(input)? {
        let _ = ws.parse_next(input)?;
        if input.starts_with('(') {
            let args = call_args.parse_next(input)?;
            return Ok(Expr::Call {
                namespace: first.to_string(),
                name: name.to_string(),
                args,
            });
        }
        *input = checkpoint;
    }

    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut path = vec![first.to_string()];
    path.extend(rest.into_iter().map(str::to_string));
    Ok(Expr::Variable(path))
}

/// `( expr, expr, ... )`
fn call_args(input: &mut &str) -> ModalResult<Vec<Expr>> {
    let _ = '('.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let mut args = Vec::new();
    if opt(')').parse_next(input)?.is_some() {
        return Ok(args);
    }
    loop {
        let arg = ternary.parse_next(input).map_err(ErrMode::cut)?;
        args.push(arg);
        let _ = ws.parse_next(input)?;
        if opt(',').parse_next(input)?.is_some() {
            let _ = ws.parse_next(input)?;
            continue;
        }
        if opt(')').parse_next(input)?.is_some() {
            break;
        }
        return Err(make_cut_error("',' or ')' in argument list"));
    }
    Ok(args)
}

fn parenthesized(input: &mut &str) -> ModalResult<Expr> {
    let _ = '('.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let inner = ternary.parse_next(input).map_err(ErrMode::cut)?;
    let _ = ws.parse_next(input)?;
    if opt(')').parse_next(input)?.is_none() {
        return Err(make_cut_error("closing ')'"));
    }
    Ok(inner)
}

fn primary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    match input.chars().next() {
        Some('(') => parenthesized(input),
        Some('"') | Some('\'') => string_literal.map(|s| Expr::Literal(Value::String(s))).parse_next(input),
        Some(c) if c.is_ascii_digit() => number_literal.map(Expr::Literal).parse_next(input),
        Some(c) if is_ident_start(c) => name_expr(input),
        _ => Err(backtrack()),
    }
}

/// Primary followed by any number of `[index]` or `.member` suffixes.
fn postfix(input: &mut &str) -> ModalResult<Expr> {
    let mut expr = primary(input)?;
    loop {
        let checkpoint = *input;
        let _ = ws.parse_next(input)?;
        if opt('[').parse_next(input)?.is_some() {
            let _ = ws.parse_next(input)?;
            let index = ternary.parse_next(input).map_err(ErrMode::cut)?;
            let _ = ws.parse_next(input)?;
            if opt(']').parse_next(input)?.is_none() {
                return Err(make_cut_error("closing ']'"));
            }
            expr = Expr::Index(Box::new(expr), Box::new(index));
        } else if let Some(member) = opt(preceded('.', identifier)).parse_next(input)? {
            expr = Expr::Member(Box::new(expr), member.to_string());
        } else {
            *input = checkpoint;
            return Ok(expr);
        }
    }
}

fn unary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    let op = if input.starts_with('!') && !input.starts_with("!=") {
        *input = &input[1..];
        Some(UnaryOp::Not)
    } else if input.starts_with('-') {
        *input = &input[1..];
        Some(UnaryOp::Neg)
    } else if eat_word(input, "not") {
        Some(UnaryOp::Not)
    } else if eat_word(input, "empty") {
        Some(UnaryOp::Empty)
    } else {
        None
    };

    let Some(op) = op else {
        return postfix(input);
    };
    let operand = unary.parse_next(input).map_err(|_| make_cut_error("operand after unary operator"))?;
    Ok(match (op, operand) {
        (UnaryOp::Neg, Expr::Literal(Value::Int(i))) => Expr::Literal(Value::Int(-i)),
        (UnaryOp::Neg, Expr::Literal(Value::Float(x))) => Expr::Literal(Value::Float(-x)),
        (op, operand) => Expr::Unary(op, Box::new(operand)),
    })
}

// ---------------------------------------------------------------------------
// Binary operators (lowest precedence last)
// ---------------------------------------------------------------------------

fn binary_chain(
    input: &mut &str,
    operand: fn(&mut &str) -> ModalResult<Expr>,
    ops: &[(&'static str, BinaryOp)],
) -> ModalResult<Expr> {
    let mut lhs = operand(input)?;
    loop {
        let checkpoint = *input;
        let _ = ws.parse_next(input)?;
        let Some(op) = eat_operator(input, ops) else {
            *input = checkpoint;
            return Ok(lhs);
        };
        let rhs = operand(input).map_err(|_| make_cut_error("expression after operator"))?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
}

fn multiplicative(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, unary, MULTIPLICATIVE_OPS)
}

fn additive(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, multiplicative, ADDITIVE_OPS)
}

fn relational(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, additive, RELATIONAL_OPS)
}

fn equality(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, relational, EQUALITY_OPS)
}

fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, equality, &[("&&", BinaryOp::And), ("and", BinaryOp::And)])
}

fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    binary_chain(input, and_expr, &[("||", BinaryOp::Or), ("or", BinaryOp::Or)])
}

/// `cond ? a : b`, right-associative.
fn ternary(input: &mut &str) -> ModalResult<Expr> {
    let cond = or_expr(input)?;
    let checkpoint = *input;
    let _ = ws.parse_next(input)?;
    if opt('?').parse_next(input)?.is_none() {
        *input = checkpoint;
        return Ok(cond);
    }
    let then = ternary.parse_next(input).map_err(ErrMode::cut)?;
    let _ = ws.parse_next(input)?;
    if opt(':').parse_next(input)?.is_none() {
        return Err(make_cut_error("':' in conditional expression"));
    }
    let otherwise = ternary.parse_next(input).map_err(ErrMode::cut)?;
    Ok(Expr::Ternary(
        Box::new(cond),
        Box::new(then),
        Box::new(otherwise),
    ))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Compute (line, col) of the unconsumed remainder within `source`.
fn offset_to_line_col(source: &str, remaining: &str) -> (usize, usize) {
    let consumed = source.len().saturating_sub(remaining.len());
    let prefix = &source[..consumed];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

fn to_parse_error(source: &str, remaining: &str, err: ErrMode<ContextError>) -> ConduitError {
    let (line, col) = offset_to_line_col(source, remaining);
    let message = match err {
        ErrMode::Backtrack(e) | ErrMode::Cut(e) => e.to_string(),
        ErrMode::Incomplete(_) => "incomplete input".to_string(),
    };
    ConduitError::Parse {
        line,
        col,
        message: if message.is_empty() {
            "invalid expression".to_string()
        } else {
            message
        },
    }
}

fn trailing_error(source: &str, remaining: &str) -> ConduitError {
    let (line, col) = offset_to_line_col(source, remaining);
    let snippet: String = remaining.chars().take(20).collect();
    ConduitError::Parse {
        line,
        col,
        message: format!("unexpected input '{snippet}'"),
    }
}

/// Parse a bare expression such as `a == 1 && str:contains(b, 'x')`.
pub fn parse_expression(text: &str) -> Result<Expr, ConduitError> {
    let mut input = text;
    let expr = ternary
        .parse_next(&mut input)
        .map_err(|e| to_parse_error(text, input, e))?;
    let _ = ws
        .parse_next(&mut input)
        .map_err(|e| to_parse_error(text, input, e))?;
    if !input.is_empty() {
        return Err(trailing_error(text, input));
    }
    Ok(expr)
}

/// Parse text with `${...}` interpolations. `\$` yields a literal `$`.
pub fn parse_template(text: &str) -> Result<Template, ConduitError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("\\$") {
            literal.push('$');
            rest = &rest[2..];
        } else if rest.starts_with("${") {
            if !literal.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut literal)));
            }
            let mut input = &rest[2..];
            let _ = ws
                .parse_next(&mut input)
                .map_err(|e| to_parse_error(text, input, e))?;
            let expr = ternary
                .parse_next(&mut input)
                .map_err(|e| to_parse_error(text, input, e))?;
            let _ = ws
                .parse_next(&mut input)
                .map_err(|e| to_parse_error(text, input, e))?;
            match input.strip_prefix('}') {
                Some(after) => rest = after,
                None if input.is_empty() => {
                    let (line, col) = offset_to_line_col(text, input);
                    return Err(ConduitError::Parse {
                        line,
                        col,
                        message: "unterminated '${' expression".to_string(),
                    });
                }
                None => return Err(trailing_error(text, input)),
            }
            parts.push(TemplatePart::Expr(expr));
        } else {
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    if !literal.is_empty() {
        parts.push(TemplatePart::Text(literal));
    }
    Ok(Template { parts })
}
