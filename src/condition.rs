//! Restricted boolean expressions for conditional stages.
//!
//! A stage's `condition` is compiled once, when the pipeline definition is
//! loaded, and evaluated against the run's document metadata right before
//! the stage would be dispatched. The language is deliberately tiny and
//! side-effect free:
//!
//! ```text
//! expr    := or
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | primary
//! primary := "(" expr ")" | "true" | "false" | path [ cmp literal ]
//! cmp     := "==" | "!=" | ">" | ">=" | "<" | "<="
//! literal := number | "string" | 'string' | true | false
//! path    := ident ( "." ident )*
//! ```
//!
//! A bare path is a named predicate: `has_images` is true when the metadata
//! value under `has_images` is truthy (non-zero, non-empty, `true`).

use crate::run::Metadata;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*(?:(?P<op>&&|\|\||==|!=|>=|<=|[()!<>])|(?P<num>-?\d+(?:\.\d+)?)|"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<ident>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*))"#,
    )
    .expect("token regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Number(f64),
    Str(String),
    Ident(String),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Bool(bool),
}

/// A compiled condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Const(bool),
    Truthy(String),
    Compare {
        path: String,
        op: CmpOp,
        value: Literal,
    },
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

/// Parse failure with a short, user-facing description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

impl Condition {
    /// Compile an expression.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ParseError("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ParseError(format!(
                "unexpected token {:?} at position {}",
                parser.tokens[parser.pos], parser.pos
            )));
        }
        Ok(expr)
    }

    /// Evaluate against run metadata. Never fails: missing keys are falsy.
    pub fn evaluate(&self, metadata: &Metadata) -> bool {
        match self {
            Condition::Const(b) => *b,
            Condition::Truthy(path) => lookup(metadata, path).map(truthy).unwrap_or(false),
            Condition::Compare { path, op, value } => match lookup(metadata, path) {
                Some(actual) => compare(actual, *op, value),
                None => *op == CmpOp::Ne,
            },
            Condition::Not(inner) => !inner.evaluate(metadata),
            Condition::And(a, b) => a.evaluate(metadata) && b.evaluate(metadata),
            Condition::Or(a, b) => a.evaluate(metadata) || b.evaluate(metadata),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while !rest.trim_start().is_empty() {
        let caps = TOKEN_RE.captures(rest).ok_or_else(|| {
            ParseError(format!("unrecognised input near '{}'", rest.trim_start()))
        })?;
        let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);

        let token = if let Some(op) = caps.name("op") {
            match op.as_str() {
                "(" => Token::LParen,
                ")" => Token::RParen,
                "!" => Token::Not,
                "&&" => Token::And,
                "||" => Token::Or,
                "==" => Token::Cmp(CmpOp::Eq),
                "!=" => Token::Cmp(CmpOp::Ne),
                ">=" => Token::Cmp(CmpOp::Ge),
                "<=" => Token::Cmp(CmpOp::Le),
                ">" => Token::Cmp(CmpOp::Gt),
                _ => Token::Cmp(CmpOp::Lt),
            }
        } else if let Some(n) = caps.name("num") {
            let v = n
                .as_str()
                .parse::<f64>()
                .map_err(|e| ParseError(format!("bad number '{}': {e}", n.as_str())))?;
            Token::Number(v)
        } else if let Some(s) = caps.name("dq").or_else(|| caps.name("sq")) {
            Token::Str(s.as_str().to_string())
        } else if let Some(id) = caps.name("ident") {
            match id.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                other => Token::Ident(other.to_string()),
            }
        } else {
            return Err(ParseError(format!("unrecognised input near '{rest}'")));
        };

        tokens.push(token);
        rest = &rest[whole..];
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Condition, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ParseError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ParseError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError("missing ')'".into())),
                }
            }
            Some(Token::Ident(id)) if id == "true" => Ok(Condition::Const(true)),
            Some(Token::Ident(id)) if id == "false" => Ok(Condition::Const(false)),
            Some(Token::Ident(path)) => {
                if let Some(Token::Cmp(op)) = self.peek().cloned() {
                    self.pos += 1;
                    let value = self.parse_literal()?;
                    Ok(Condition::Compare { path, op, value })
                } else {
                    Ok(Condition::Truthy(path))
                }
            }
            Some(other) => Err(ParseError(format!("unexpected token {other:?}"))),
            None => Err(ParseError("unexpected end of expression".into())),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Literal::Number(n)),
            Some(Token::Str(s)) => Ok(Literal::String(s)),
            Some(Token::Ident(id)) if id == "true" => Ok(Literal::Bool(true)),
            Some(Token::Ident(id)) if id == "false" => Ok(Literal::Bool(false)),
            Some(other) => Err(ParseError(format!(
                "expected a literal after comparison, found {other:?}"
            ))),
            None => Err(ParseError("expected a literal after comparison".into())),
        }
    }
}

fn lookup<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = metadata.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(actual: &Value, op: CmpOp, expected: &Literal) -> bool {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (actual, expected) {
        (Value::Number(a), Literal::Number(b)) => a.as_f64().and_then(|a| a.partial_cmp(b)),
        (Value::String(a), Literal::Number(b)) => {
            a.parse::<f64>().ok().and_then(|a| a.partial_cmp(b))
        }
        (Value::String(a), Literal::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (ordering, op) {
        (Some(o), CmpOp::Eq) => o == Ordering::Equal,
        (Some(o), CmpOp::Ne) => o != Ordering::Equal,
        (Some(o), CmpOp::Gt) => o == Ordering::Greater,
        (Some(o), CmpOp::Ge) => o != Ordering::Less,
        (Some(o), CmpOp::Lt) => o == Ordering::Less,
        (Some(o), CmpOp::Le) => o != Ordering::Greater,
        // Incomparable types are never equal.
        (None, CmpOp::Ne) => true,
        (None, _) => false,
    }
}
