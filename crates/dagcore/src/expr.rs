//! Expression language for condition vertices.
//!
//! Expressions are parsed once when a graph is built and evaluated against the
//! run's parameter map every time the condition vertex executes.
//!
//! Supported:
//! - literals: numbers, `'single'` or `"double"` quoted strings, `true`, `false`, `null`
//! - identifiers, resolved from the parameter map (`.` allowed inside a name)
//! - `!` and unary `-`, `* / %`, `+ -`, `< <= > >=`, `== !=`, `&&`, `||`
//! - parentheses
//!
//! `&&` and `||` short-circuit, so `ready && count > 1` does not need `count`
//! when `ready` is false.

use crate::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("no parameter '{0}' found")]
    UnknownVariable(String),

    #[error("operator {op} can't be applied to {left} and {right}")]
    Type {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
    vars: Vec<String>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            cursor: 0,
            end: source.len(),
        };
        let root = parser.expression(0)?;
        if let Some((pos, token)) = parser.tokens.get(parser.cursor) {
            return Err(ExprError::Syntax {
                pos: *pos,
                message: format!("unexpected {}", token),
            });
        }

        let mut vars = Vec::new();
        root.collect_vars(&mut vars);
        Ok(Self {
            source: source.to_string(),
            root,
            vars,
        })
    }

    pub fn evaluate(&self, params: &HashMap<String, Value>) -> Result<Value, ExprError> {
        self.root.eval(params)
    }

    /// The text this expression was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parameter names referenced by the expression, in order of first use.
    pub fn vars(&self) -> &[String] {
        &self.vars
    }
}

impl FromStr for Expression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol {
            "||" => BinaryOp::Or,
            "&&" => BinaryOp::And,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            _ => return None,
        };
        Some(op)
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_vars(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    fn eval(&self, params: &HashMap<String, Value>) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => params
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Not(inner) => match inner.eval(params)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(type_error("!", &other, &other)),
            },
            Expr::Neg(inner) => match inner.eval(params)? {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(type_error("-", &other, &other)),
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !as_bool("&&", lhs.eval(params)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool("&&", rhs.eval(params)?)?))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if as_bool("||", lhs.eval(params)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool("||", rhs.eval(params)?)?))
            }
            Expr::Binary(op, lhs, rhs) => apply(*op, lhs.eval(params)?, rhs.eval(params)?),
        }
    }
}

fn as_bool(op: &'static str, value: Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(type_error(op, &other, &Value::Bool(true))),
    }
}

fn type_error(op: &'static str, left: &Value, right: &Value) -> ExprError {
    ExprError::Type {
        op,
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn apply(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    use std::cmp::Ordering;

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }

    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (*a, *b);
            let value = match op {
                BinaryOp::Add => Value::Number(a + b),
                BinaryOp::Sub => Value::Number(a - b),
                BinaryOp::Mul => Value::Number(a * b),
                BinaryOp::Div if b == 0.0 => return Err(ExprError::DivisionByZero),
                BinaryOp::Div => Value::Number(a / b),
                BinaryOp::Rem if b == 0.0 => return Err(ExprError::DivisionByZero),
                BinaryOp::Rem => Value::Number(a % b),
                BinaryOp::Lt => Value::Bool(a < b),
                BinaryOp::Le => Value::Bool(a <= b),
                BinaryOp::Gt => Value::Bool(a > b),
                BinaryOp::Ge => Value::Bool(a >= b),
                _ => return Err(type_error(op.symbol(), &lhs, &rhs)),
            };
            Ok(value)
        }
        (Value::String(a), Value::String(b)) => {
            let ordering = a.cmp(b);
            let value = match op {
                BinaryOp::Add => Value::String(format!("{}{}", a, b)),
                BinaryOp::Lt => Value::Bool(ordering == Ordering::Less),
                BinaryOp::Le => Value::Bool(ordering != Ordering::Greater),
                BinaryOp::Gt => Value::Bool(ordering == Ordering::Greater),
                BinaryOp::Ge => Value::Bool(ordering != Ordering::Less),
                _ => return Err(type_error(op.symbol(), &lhs, &rhs)),
            };
            Ok(value)
        }
        _ => Err(type_error(op.symbol(), &lhs, &rhs)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Ident(name) => write!(f, "identifier {}", name),
            Token::Op(op) => write!(f, "operator {}", op),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

const OPERATORS: [&str; 14] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;

        if c == b'(' || c == b')' {
            tokens.push((start, if c == b'(' { Token::LParen } else { Token::RParen }));
            pos += 1;
        } else if c.is_ascii_digit()
            || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            let text = &source[start..pos];
            let n = text.parse::<f64>().map_err(|_| ExprError::Syntax {
                pos: start,
                message: format!("invalid number {}", text),
            })?;
            tokens.push((start, Token::Number(n)));
        } else if c == b'"' || c == b'\'' {
            pos += 1;
            let body = pos;
            while pos < bytes.len() && bytes[pos] != c {
                pos += 1;
            }
            if pos >= bytes.len() {
                return Err(ExprError::Syntax {
                    pos: start,
                    message: "unterminated string".to_string(),
                });
            }
            tokens.push((start, Token::Str(source[body..pos].to_string())));
            pos += 1;
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while pos < bytes.len()
                && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'.')
            {
                pos += 1;
            }
            tokens.push((start, Token::Ident(source[start..pos].to_string())));
        } else {
            let rest = &source[pos..];
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| ExprError::Syntax {
                    pos: start,
                    message: format!(
                        "unexpected character '{}'",
                        rest.chars().next().unwrap_or('?')
                    ),
                })?;
            tokens.push((start, Token::Op(*op)));
            pos += op.len();
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, t)| t)
    }

    fn pos(&self) -> usize {
        self.tokens.get(self.cursor).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, t)| t.clone());
        self.cursor += 1;
        token
    }

    /// Precedence climbing: parse operators binding tighter than `min_prec`.
    fn expression(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(symbol)) => match BinaryOp::from_symbol(symbol) {
                    Some(op) if op.precedence() > min_prec => op,
                    _ => break,
                },
                _ => break,
            };
            self.cursor += 1;
            let rhs = self.expression(op.precedence())?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.cursor += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Op("-")) => {
                self.cursor += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let pos = self.pos();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Var(name),
            }),
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Syntax {
                        pos,
                        message: "unclosed '('".to_string(),
                    }),
                }
            }
            Some(token) => Err(ExprError::Syntax {
                pos,
                message: format!("unexpected {}", token),
            }),
            None => Err(ExprError::Syntax {
                pos,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}
