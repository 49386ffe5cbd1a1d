//! RQL conditions used by the `condition` and `live-channel-condition` headers
//!
//! Supported: `eq, ne, gt, ge, lt, le, in, like, exists, and, or, not`.
//! Properties are unquoted JSON pointers (`attributes/location/city`),
//! values are JSON literals (`"text"`, `42`, `1.5`, `true`, `false`, `null`).

use crate::pointer::JsonPointer;
use logos::Logos;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unterminated string at position {0}")]
    UnterminatedString(usize),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),

    #[error("operator '{0}' needs at least one argument")]
    MissingArguments(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parsed RQL condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        op: Comparison,
        pointer: JsonPointer,
        value: Value,
    },
    In {
        pointer: JsonPointer,
        values: Vec<Value>,
    },
    Like {
        pointer: JsonPointer,
        pattern: String,
    },
    Exists(JsonPointer),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.condition()?;
        match parser.advance() {
            None => Ok(condition),
            Some((token, position)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
        }
    }

    /// Evaluate against a JSON document
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Condition::Compare { op, pointer, value } => {
                let actual = pointer.get(doc);
                match (op, actual) {
                    (Comparison::Eq, Some(actual)) => json_eq(actual, value),
                    (Comparison::Ne, Some(actual)) => !json_eq(actual, value),
                    (Comparison::Ne, None) => true,
                    (_, None) => false,
                    (op, Some(actual)) => match json_cmp(actual, value) {
                        Some(ordering) => match op {
                            Comparison::Gt => ordering == Ordering::Greater,
                            Comparison::Ge => ordering != Ordering::Less,
                            Comparison::Lt => ordering == Ordering::Less,
                            Comparison::Le => ordering != Ordering::Greater,
                            Comparison::Eq | Comparison::Ne => false,
                        },
                        None => false,
                    },
                }
            }
            Condition::In { pointer, values } => pointer
                .get(doc)
                .map(|actual| values.iter().any(|v| json_eq(actual, v)))
                .unwrap_or(false),
            Condition::Like { pointer, pattern } => match pointer.get(doc) {
                Some(Value::String(s)) => glob_match(pattern, s),
                _ => false,
            },
            Condition::Exists(pointer) => pointer.get(doc).is_some(),
            Condition::And(parts) => parts.iter().all(|c| c.matches(doc)),
            Condition::Or(parts) => parts.iter().any(|c| c.matches(doc)),
            Condition::Not(inner) => !inner.matches(doc),
        }
    }

    /// Every pointer the condition reads
    pub fn referenced_pointers(&self) -> BTreeSet<JsonPointer> {
        let mut out = BTreeSet::new();
        self.collect_pointers(&mut out);
        out
    }

    fn collect_pointers(&self, out: &mut BTreeSet<JsonPointer>) {
        match self {
            Condition::Compare { pointer, .. }
            | Condition::In { pointer, .. }
            | Condition::Like { pointer, .. }
            | Condition::Exists(pointer) => {
                out.insert(pointer.clone());
            }
            Condition::And(parts) | Condition::Or(parts) => {
                parts.iter().for_each(|c| c.collect_pointers(out))
            }
            Condition::Not(inner) => inner.collect_pointers(out),
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `*` matches any run of characters, `?` exactly one
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("(")]
    Open,
    #[token(")")]
    Close,
    #[token(",")]
    Comma,

    /// Quoted JSON string, quotes and escapes kept
    #[regex(r#""([^"\\]|\\.)*""#, |lex| lex.slice().to_string())]
    Str(String),

    /// Operator name, pointer or unquoted literal
    #[regex(r#"[^ \t\r\n(),"]+"#, |lex| lex.slice().to_string())]
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Str(raw) | Token::Word(raw) => f.write_str(raw),
        }
    }
}

/// Tokens with their byte offsets
fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let mut lexer = Token::lexer(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next() {
        let position = lexer.span().start;
        match token {
            Ok(token) => tokens.push((token, position)),
            Err(()) => {
                return Err(if input[position..].starts_with('"') {
                    ConditionError::UnterminatedString(position)
                } else {
                    ConditionError::UnexpectedToken {
                        found: lexer.slice().to_string(),
                        position,
                    }
                })
            }
        }
    }
    Ok(tokens)
}

/// Recursive descent over the token stream
struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let next = self.tokens.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn unexpected(found: Option<(Token, usize)>) -> ConditionError {
        match found {
            Some((token, position)) => ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            },
            None => ConditionError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        match self.advance() {
            Some((token, _)) if token == expected => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    fn word(&mut self) -> Result<String, ConditionError> {
        match self.advance() {
            Some((Token::Word(word), _)) => Ok(word),
            other => Err(Self::unexpected(other)),
        }
    }

    fn try_comma(&mut self) -> bool {
        if self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn condition(&mut self) -> Result<Condition, ConditionError> {
        let op = self.word()?;
        self.expect(Token::Open)?;
        let condition = match op.as_str() {
            "and" | "or" => {
                let mut parts = vec![self.condition()?];
                while self.try_comma() {
                    parts.push(self.condition()?);
                }
                if op == "and" {
                    Condition::And(parts)
                } else {
                    Condition::Or(parts)
                }
            }
            "not" => Condition::Not(Box::new(self.condition()?)),
            "exists" => Condition::Exists(self.pointer()?),
            "like" => {
                let pointer = self.pointer()?;
                self.expect(Token::Comma)?;
                match self.literal()? {
                    Value::String(pattern) => Condition::Like { pointer, pattern },
                    other => return Err(ConditionError::InvalidLiteral(other.to_string())),
                }
            }
            "in" => {
                let pointer = self.pointer()?;
                let mut values = Vec::new();
                while self.try_comma() {
                    values.push(self.literal()?);
                }
                if values.is_empty() {
                    return Err(ConditionError::MissingArguments(op));
                }
                Condition::In { pointer, values }
            }
            "eq" | "ne" | "gt" | "ge" | "lt" | "le" => {
                let comparison = match op.as_str() {
                    "eq" => Comparison::Eq,
                    "ne" => Comparison::Ne,
                    "gt" => Comparison::Gt,
                    "ge" => Comparison::Ge,
                    "lt" => Comparison::Lt,
                    _ => Comparison::Le,
                };
                let pointer = self.pointer()?;
                self.expect(Token::Comma)?;
                let value = self.literal()?;
                Condition::Compare {
                    op: comparison,
                    pointer,
                    value,
                }
            }
            _ => return Err(ConditionError::UnknownOperator(op)),
        };
        self.expect(Token::Close)?;
        Ok(condition)
    }

    fn pointer(&mut self) -> Result<JsonPointer, ConditionError> {
        self.word().map(|raw| JsonPointer::parse(&raw))
    }

    fn literal(&mut self) -> Result<Value, ConditionError> {
        match self.advance() {
            Some((Token::Str(raw) | Token::Word(raw), _)) => {
                serde_json::from_str(&raw).map_err(|_| ConditionError::InvalidLiteral(raw))
            }
            other => Err(Self::unexpected(other)),
        }
    }
}
