//! Restricted expressions for chain conditions, filters and templates.
//!
//! The grammar is deliberately small: literals, dotted paths with `[n]`
//! indices, comparisons, `&& || !`, parentheses and four built-in
//! functions. There is no assignment, no arithmetic and no way to call
//! anything else, so an expression can only read the chain context.
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | cmp
//! cmp     := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := literal | path | func "(" args ")" | "(" expr ")"
//! path    := ident ( "." ident | "[" integer "]" )*
//! func    := "exists" | "len" | "contains" | "empty"
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Nesting ceiling for parenthesized and negated sub-expressions.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd { expected: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity { name: String, expected: usize, got: usize },

    #[error("expression nests too deeply")]
    TooDeep,

    #[error("invalid path '{path}'")]
    InvalidPath { path: String },
}

// ─── Paths ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A dotted reference into the chain context, e.g. `steps.fetch.result[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

impl Path {
    /// Parse a standalone path.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser::new(tokens);
        let path = match parser.next() {
            Some(Token::Ident(root)) => parser.path_tail(root)?,
            _ => {
                return Err(ExprError::InvalidPath {
                    path: source.to_string(),
                })
            }
        };
        if parser.peek().is_some() {
            return Err(ExprError::InvalidPath {
                path: source.to_string(),
            });
        }
        Ok(path)
    }

    /// The step id when this path has the form `steps.<id>...`.
    pub fn step_reference(&self) -> Option<&str> {
        if self.root != "steps" {
            return None;
        }
        match self.segments.first() {
            Some(Segment::Field(id)) => Some(id),
            _ => None,
        }
    }

    /// Follow `segments` starting from `value`.
    pub fn walk<'a>(segments: &[Segment], value: &'a Value) -> Option<&'a Value> {
        segments.iter().try_fold(value, |current, segment| match segment {
            Segment::Field(name) => current.get(name.as_str()),
            Segment::Index(i) => current.get(*i),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => write!(f, ".{name}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// Where expressions read values from.
pub trait Scope {
    /// Value at `path`, or `None` when any segment is missing.
    fn lookup(&self, path: &Path) -> Option<Value>;
}

// ─── AST ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exists,
    Len,
    Contains,
    Empty,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "exists" => Some(Self::Exists),
            "len" => Some(Self::Len),
            "contains" => Some(Self::Contains),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Contains => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser::new(tokens);
        let expr = parser.or(0)?;
        match parser.next() {
            None => Ok(expr),
            Some(tok) => Err(ExprError::UnexpectedToken {
                found: tok.to_string(),
                expected: "end of expression".into(),
            }),
        }
    }

    /// Every path the expression reads.
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Self::Literal(_) => {}
            Self::Path(path) => out.push(path),
            Self::Not(inner) => inner.collect_paths(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
            Self::Call { args, .. } => args.iter().for_each(|a| a.collect_paths(out)),
        }
    }

    pub fn eval(&self, scope: &dyn Scope) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(path) => scope.lookup(path).unwrap_or(Value::Null),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(scope))),
            Self::Binary { op: BinOp::And, lhs, rhs } => {
                Value::Bool(truthy(&lhs.eval(scope)) && truthy(&rhs.eval(scope)))
            }
            Self::Binary { op: BinOp::Or, lhs, rhs } => {
                Value::Bool(truthy(&lhs.eval(scope)) || truthy(&rhs.eval(scope)))
            }
            Self::Binary { op, lhs, rhs } => {
                let (a, b) = (lhs.eval(scope), rhs.eval(scope));
                Value::Bool(compare(*op, &a, &b))
            }
            Self::Call { func, args } => call(*func, args, scope),
        }
    }

    /// Evaluate and reduce to a boolean.
    pub fn is_true(&self, scope: &dyn Scope) -> bool {
        truthy(&self.eval(scope))
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(op: BinOp, a: &Value, b: &Value) -> bool {
    match op {
        BinOp::Eq => values_equal(a, b),
        BinOp::Ne => !values_equal(a, b),
        BinOp::Lt => order(a, b) == Some(Ordering::Less),
        BinOp::Le => matches!(order(a, b), Some(Ordering::Less | Ordering::Equal)),
        BinOp::Gt => order(a, b) == Some(Ordering::Greater),
        BinOp::Ge => matches!(order(a, b), Some(Ordering::Greater | Ordering::Equal)),
        BinOp::And | BinOp::Or => false,
    }
}

fn call(func: Func, args: &[Expr], scope: &dyn Scope) -> Value {
    let arg = |i: usize| args.get(i).map(|a| a.eval(scope)).unwrap_or(Value::Null);
    match func {
        Func::Exists => Value::Bool(!arg(0).is_null()),
        Func::Len => {
            let len = match arg(0) {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            };
            Value::from(len)
        }
        Func::Empty => Value::Bool(match arg(0) {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }),
        Func::Contains => {
            let needle = arg(1);
            Value::Bool(match arg(0) {
                Value::String(hay) => needle.as_str().is_some_and(|n| hay.contains(n)),
                Value::Array(items) => items.iter().any(|item| values_equal(item, &needle)),
                Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
                _ => false,
            })
        }
    }
}

// ─── Templates ───────────────────────────────────────────────────────────────

/// Pieces of a `{{path}}` template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Placeholder(Path),
}

/// Split a template into text and placeholders. An unterminated `{{` is
/// literal text.
pub fn parse_template(template: &str) -> Result<Vec<TemplatePart>, ExprError> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        if start > 0 {
            parts.push(TemplatePart::Text(rest[..start].to_string()));
        }
        let inner = rest[start + 2..start + 2 + len].trim();
        parts.push(TemplatePart::Placeholder(Path::parse(inner)?));
        rest = &rest[start + 2 + len + 2..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }
    Ok(parts)
}

/// Substitute every `{{path}}`. Strings are inserted raw, missing values as
/// nothing, anything else as compact JSON.
pub fn render_template(template: &str, scope: &dyn Scope) -> Result<String, ExprError> {
    let mut out = String::with_capacity(template.len());
    for part in parse_template(template)? {
        match part {
            TemplatePart::Text(text) => out.push_str(&text),
            TemplatePart::Placeholder(path) => match scope.lookup(&path) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
            },
        }
    }
    Ok(out)
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Not,
    Op(BinOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Dot => f.write_str("."),
            Self::LBracket => f.write_str("["),
            Self::RBracket => f.write_str("]"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::Comma => f.write_str(","),
            Self::Not => f.write_str("!"),
            Self::Op(op) => f.write_str(match op {
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::And => "&&",
                BinOp::Or => "||",
            }),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(BinOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(BinOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Op(BinOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(BinOp::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Op(BinOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(BinOp::Gt));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::Op(BinOp::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Op(BinOp::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                text.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || (chars[i] == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedChar { ch: c, offset: start })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset: i }),
        }
    }
    Ok(tokens)
}

// ─── Parser ──────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(ExprError::UnexpectedToken {
                found: tok.to_string(),
                expected: format!("'{expected}'"),
            }),
            None => Err(ExprError::UnexpectedEnd {
                expected: format!("'{expected}'"),
            }),
        }
    }

    fn or(&mut self, depth: usize) -> Result<Expr, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        let mut lhs = self.and(depth)?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.pos += 1;
            let rhs = self.and(depth)?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let mut lhs = self.unary(depth)?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.pos += 1;
            let rhs = self.unary(depth)?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self, depth: usize) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            if depth + 1 > MAX_DEPTH {
                return Err(ExprError::TooDeep);
            }
            return Ok(Expr::Not(Box::new(self.unary(depth + 1)?)));
        }
        self.comparison(depth)
    }

    fn comparison(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let lhs = self.primary(depth)?;
        match self.peek() {
            Some(Token::Op(op)) if !matches!(op, BinOp::And | BinOp::Or) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.primary(depth)?;
                Ok(Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            _ => Ok(lhs),
        }
    }

    fn primary(&mut self, depth: usize) -> Result<Expr, ExprError> {
        let expected = "a value, path or '('";
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.or(depth + 1)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let keyword = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = keyword {
                    return Ok(Expr::Literal(value));
                }
                if self.peek() == Some(&Token::LParen) {
                    return self.call(name, depth);
                }
                Ok(Expr::Path(self.path_tail(name)?))
            }
            Some(tok) => Err(ExprError::UnexpectedToken {
                found: tok.to_string(),
                expected: expected.into(),
            }),
            None => Err(ExprError::UnexpectedEnd {
                expected: expected.into(),
            }),
        }
    }

    fn call(&mut self, name: String, depth: usize) -> Result<Expr, ExprError> {
        let func = Func::from_name(&name).ok_or(ExprError::UnknownFunction { name: name.clone() })?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.or(depth + 1)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != func.arity() {
            return Err(ExprError::Arity {
                name,
                expected: func.arity(),
                got: args.len(),
            });
        }
        Ok(Expr::Call { func, args })
    }

    fn path_tail(&mut self, root: String) -> Result<Path, ExprError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(field)) => segments.push(Segment::Field(field)),
                        Some(tok) => {
                            return Err(ExprError::UnexpectedToken {
                                found: tok.to_string(),
                                expected: "a field name".into(),
                            })
                        }
                        None => {
                            return Err(ExprError::UnexpectedEnd {
                                expected: "a field name".into(),
                            })
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        Some(Token::Str(key)) => segments.push(Segment::Field(key)),
                        Some(tok) => {
                            return Err(ExprError::UnexpectedToken {
                                found: tok.to_string(),
                                expected: "an index".into(),
                            })
                        }
                        None => {
                            return Err(ExprError::UnexpectedEnd {
                                expected: "an index".into(),
                            })
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Path { root, segments })
    }
}
