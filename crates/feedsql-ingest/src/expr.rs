//! Field expressions
//!
//! A small closed expression language evaluated against one feed item. It can
//! project attributes, call a fixed set of pure functions and do simple
//! arithmetic; it has no access to anything but the item it is given.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := INTEGER | FLOAT | STRING | true | false | null
//!          | IDENT '(' [expr (',' expr)*] ')'
//!          | path | '(' expr ')'
//! path    := IDENT ('.' IDENT | '[' INTEGER ']' | '[' STRING ']')*
//! ```
//!
//! Examples: `title`, `int(id)`, `lower(trim(category))`,
//! `format_date(published, '%Y-%m-%d')`, `coalesce(author, 'anonymous')`,
//! `categories[0]`, `'https://example.org' + link`.

use chrono::format::{Item, StrftimeItems};
use std::fmt::{self, Write as _};

use crate::error::ExtractionError;
use crate::feed::FeedItem;
use crate::value::Value;

/// A parsed expression together with its source text
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse an expression; function names and arities are checked here
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_expr(Precedence::None)?;
        match parser.peek() {
            Token::Eof => Ok(Self {
                source: source.to_string(),
                root,
            }),
            other => Err(ParseError(format!("unexpected {} after expression", other))),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one item
    pub fn evaluate(&self, item: &FeedItem) -> Result<Value, ExtractionError> {
        self.root.eval(item)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Syntax error in an expression
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Comma,
    Dot,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Integer(i) => write!(f, "number {}", i),
            Token::Float(x) => write!(f, "number {}", x),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Percent => f.write_str("'%'"),
            Token::OpenParen => f.write_str("'('"),
            Token::CloseParen => f.write_str("')'"),
            Token::OpenBracket => f.write_str("'['"),
            Token::CloseBracket => f.write_str("']'"),
            Token::Comma => f.write_str("','"),
            Token::Dot => f.write_str("'.'"),
            Token::Eof => f.write_str("end of expression"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => push(&mut tokens, &mut i, Token::Plus),
            '-' => push(&mut tokens, &mut i, Token::Minus),
            '*' => push(&mut tokens, &mut i, Token::Star),
            '/' => push(&mut tokens, &mut i, Token::Slash),
            '%' => push(&mut tokens, &mut i, Token::Percent),
            '(' => push(&mut tokens, &mut i, Token::OpenParen),
            ')' => push(&mut tokens, &mut i, Token::CloseParen),
            '[' => push(&mut tokens, &mut i, Token::OpenBracket),
            ']' => push(&mut tokens, &mut i, Token::CloseBracket),
            ',' => push(&mut tokens, &mut i, Token::Comma),
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                push(&mut tokens, &mut i, Token::Dot)
            },
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError("unterminated string literal".into())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        },
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(&other) => other,
                                None => return Err(ParseError("unterminated string literal".into())),
                            };
                            text.push(escaped);
                            i += 2;
                        },
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        },
                    }
                }
                tokens.push(Token::Str(text));
            },
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let token = if literal.contains('.') {
                    literal
                        .parse::<f64>()
                        .map(Token::Float)
                        .map_err(|_| ParseError(format!("invalid number '{}'", literal)))?
                } else {
                    literal
                        .parse::<i64>()
                        .map(Token::Integer)
                        .map_err(|_| ParseError(format!("invalid number '{}'", literal)))?
                };
                tokens.push(token);
            },
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            },
            other => return Err(ParseError(format!("unexpected character '{}'", other))),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, token: Token) {
    tokens.push(token);
    *i += 1;
}

// ============================================================================
// Syntax tree
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    Call { function: Function, args: Vec<Expr> },
    Negate(Box<Expr>),
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Term,
    Factor,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<Self> {
        match token {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Subtract),
            Token::Star => Some(BinaryOp::Multiply),
            Token::Slash => Some(BinaryOp::Divide),
            Token::Percent => Some(BinaryOp::Remainder),
            _ => None,
        }
    }

    fn precedence(self) -> Precedence {
        match self {
            BinaryOp::Add | BinaryOp::Subtract => Precedence::Term,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Remainder => Precedence::Factor,
        }
    }
}

/// The closed set of callable functions
#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Str,
    Int,
    Float,
    Lower,
    Upper,
    Trim,
    Len,
    Concat,
    Replace,
    Substr,
    Split,
    Coalesce,
    Date,
    FormatDate,
    Timestamp,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "str" => Function::Str,
            "int" => Function::Int,
            "float" => Function::Float,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "trim" => Function::Trim,
            "len" => Function::Len,
            "concat" => Function::Concat,
            "replace" => Function::Replace,
            "substr" => Function::Substr,
            "split" => Function::Split,
            "coalesce" => Function::Coalesce,
            "date" => Function::Date,
            "format_date" => Function::FormatDate,
            "timestamp" => Function::Timestamp,
            _ => return None,
        })
    }

    /// (min, max) argument count; `None` max means variadic
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::Str
            | Function::Int
            | Function::Float
            | Function::Lower
            | Function::Upper
            | Function::Trim
            | Function::Len
            | Function::Date
            | Function::Timestamp => (1, Some(1)),
            Function::FormatDate => (2, Some(2)),
            Function::Substr => (2, Some(3)),
            Function::Replace | Function::Split => (3, Some(3)),
            Function::Concat | Function::Coalesce => (1, None),
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let token = self.advance();
        if token == expected {
            Ok(())
        } else {
            Err(ParseError(format!("expected {}, found {}", expected, token)))
        }
    }

    fn parse_expr(&mut self, min: Precedence) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;

        while let Some(op) = BinaryOp::from_token(self.peek()) {
            if op.precedence() <= min {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(op.precedence())?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if *self.peek() == Token::Minus {
            self.advance();
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Token::Integer(i) => Ok(Expr::Literal(Value::Integer(i))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::OpenParen => {
                let inner = self.parse_expr(Precedence::None)?;
                self.expect(Token::CloseParen)?;
                Ok(inner)
            },
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Boolean(true))),
                "false" => Ok(Expr::Literal(Value::Boolean(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if *self.peek() == Token::OpenParen => self.parse_call(name),
                _ => self.parse_path(name),
            },
            other => Err(ParseError(format!("unexpected {}", other))),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ParseError> {
        let function =
            Function::lookup(&name).ok_or_else(|| ParseError(format!("unknown function '{}'", name)))?;
        self.expect(Token::OpenParen)?;

        let mut args = Vec::new();
        if *self.peek() != Token::CloseParen {
            loop {
                args.push(self.parse_expr(Precedence::None)?);
                if *self.peek() == Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::CloseParen)?;

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            let expected = match max {
                Some(max) if max == min => format!("{}", min),
                Some(max) => format!("{} to {}", min, max),
                None => format!("at least {}", min),
            };
            return Err(ParseError(format!(
                "function '{}' takes {} argument(s), got {}",
                name,
                expected,
                args.len()
            )));
        }

        Ok(Expr::Call { function, args })
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ParseError> {
        let mut segments = vec![PathSegment::Key(root)];

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Ident(key) => segments.push(PathSegment::Key(key)),
                        other => return Err(ParseError(format!("expected attribute name after '.', found {}", other))),
                    }
                },
                Token::OpenBracket => {
                    self.advance();
                    match self.advance() {
                        Token::Integer(i) if i >= 0 => segments.push(PathSegment::Index(i as usize)),
                        Token::Str(key) => segments.push(PathSegment::Key(key)),
                        other => return Err(ParseError(format!("expected index or key in '[]', found {}", other))),
                    }
                    self.expect(Token::CloseBracket)?;
                },
                _ => break,
            }
        }

        Ok(Expr::Path(segments))
    }
}

// ============================================================================
// Evaluation
// ============================================================================

impl Expr {
    fn eval(&self, item: &FeedItem) -> Result<Value, ExtractionError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(segments) => resolve_path(item, segments),
            Expr::Negate(inner) => match inner.eval(item)? {
                Value::Null => Ok(Value::Null),
                Value::Integer(i) => i
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| ExtractionError::evaluation("integer overflow")),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(ExtractionError::type_mismatch("number", other.type_name())),
            },
            Expr::Binary { op, lhs, rhs } => binary(*op, lhs.eval(item)?, rhs.eval(item)?),
            Expr::Call { function, args } => call(*function, args, item),
        }
    }
}

fn resolve_path(item: &FeedItem, segments: &[PathSegment]) -> Result<Value, ExtractionError> {
    let display = render_path(segments);
    let mut iter = segments.iter();

    let mut current = match iter.next() {
        Some(PathSegment::Key(key)) => item
            .get(key)
            .ok_or_else(|| ExtractionError::MissingAttribute(display.clone()))?,
        _ => return Err(ExtractionError::MissingAttribute(display)),
    };

    for segment in iter {
        let next = match segment {
            PathSegment::Key(key) => current.get(key.as_str()),
            PathSegment::Index(i) => current.get(*i),
        };
        current = next.ok_or_else(|| ExtractionError::MissingAttribute(display.clone()))?;
    }

    Value::from_json(current)
}

fn render_path(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            PathSegment::Key(key) if i == 0 => out.push_str(key),
            PathSegment::Key(key) => {
                out.push('.');
                out.push_str(key);
            },
            PathSegment::Index(idx) => {
                let _ = write!(out, "[{}]", idx);
            },
        }
    }
    out
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExtractionError> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    if op == BinaryOp::Add && (matches!(lhs, Value::Text(_)) || matches!(rhs, Value::Text(_))) {
        return Ok(Value::Text(format!("{}{}", lhs, rhs)));
    }

    match (op, lhs, rhs) {
        (BinaryOp::Divide, l, r) => {
            let (l, r) = (as_f64(&l)?, as_f64(&r)?);
            if r == 0.0 {
                return Err(ExtractionError::evaluation("division by zero"));
            }
            Ok(Value::Float(l / r))
        },
        (BinaryOp::Remainder, Value::Integer(_), Value::Integer(0)) => {
            Err(ExtractionError::evaluation("division by zero"))
        },
        (BinaryOp::Remainder, Value::Integer(l), Value::Integer(r)) => l
            .checked_rem(r)
            .map(Value::Integer)
            .ok_or_else(|| ExtractionError::evaluation("integer overflow")),
        (BinaryOp::Remainder, l, r) => Err(ExtractionError::type_mismatch(
            "integer operands for '%'",
            format!("{} and {}", l.type_name(), r.type_name()),
        )),
        (op, Value::Integer(l), Value::Integer(r)) => {
            let result = match op {
                BinaryOp::Add => l.checked_add(r),
                BinaryOp::Subtract => l.checked_sub(r),
                _ => l.checked_mul(r),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| ExtractionError::evaluation("integer overflow"))
        },
        (op, l, r) => {
            let (l, r) = (as_f64(&l)?, as_f64(&r)?);
            Ok(Value::Float(match op {
                BinaryOp::Add => l + r,
                BinaryOp::Subtract => l - r,
                _ => l * r,
            }))
        },
    }
}

fn as_f64(value: &Value) -> Result<f64, ExtractionError> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        other => Err(ExtractionError::type_mismatch("number", other.type_name())),
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::Text(s) => s,
        other => other.to_string(),
    }
}

fn as_index(value: &Value) -> Result<usize, ExtractionError> {
    match value {
        Value::Integer(i) if *i >= 0 => Ok(*i as usize),
        other => Err(ExtractionError::type_mismatch("non-negative integer", other.type_name())),
    }
}

fn call(function: Function, args: &[Expr], item: &FeedItem) -> Result<Value, ExtractionError> {
    // coalesce must see failures of its arguments, so it evaluates lazily
    if function == Function::Coalesce {
        for arg in args {
            match arg.eval(item) {
                Ok(value) if !value.is_null() => return Ok(value),
                _ => continue,
            }
        }
        return Ok(Value::Null);
    }

    let values = args
        .iter()
        .map(|arg| arg.eval(item))
        .collect::<Result<Vec<_>, _>>()?;

    if function == Function::Concat {
        return Ok(Value::Text(
            values
                .into_iter()
                .map(|v| if v.is_null() { String::new() } else { as_text(v) })
                .collect(),
        ));
    }

    let mut values = values.into_iter();
    let first = values.next().unwrap_or(Value::Null);
    if first.is_null() {
        return Ok(Value::Null);
    }
    let rest: Vec<Value> = values.collect();

    match function {
        Function::Str => Ok(Value::Text(as_text(first))),
        Function::Int => first.coerce(&crate::schema::StorageType::Integer),
        Function::Float => first.coerce(&crate::schema::StorageType::Real),
        Function::Lower => Ok(Value::Text(as_text(first).to_lowercase())),
        Function::Upper => Ok(Value::Text(as_text(first).to_uppercase())),
        Function::Trim => Ok(Value::Text(as_text(first).trim().to_string())),
        Function::Len => Ok(Value::Integer(as_text(first).chars().count() as i64)),
        Function::Replace => {
            let from = as_text(rest[0].clone());
            let to = as_text(rest[1].clone());
            if from.is_empty() {
                return Err(ExtractionError::evaluation("replace() pattern cannot be empty"));
            }
            Ok(Value::Text(as_text(first).replace(&from, &to)))
        },
        Function::Substr => {
            let start = as_index(&rest[0])?;
            let text = as_text(first);
            let chars = text.chars().skip(start);
            Ok(Value::Text(match rest.get(1) {
                Some(len) => chars.take(as_index(len)?).collect(),
                None => chars.collect(),
            }))
        },
        Function::Split => {
            let separator = as_text(rest[0].clone());
            if separator.is_empty() {
                return Err(ExtractionError::evaluation("split() separator cannot be empty"));
            }
            let index = as_index(&rest[1])?;
            Ok(as_text(first)
                .split(separator.as_str())
                .nth(index)
                .map(|part| Value::Text(part.to_string()))
                .unwrap_or(Value::Null))
        },
        Function::Date => first.to_timestamp().map(Value::Timestamp),
        Function::Timestamp => first.to_timestamp().map(|ts| Value::Integer(ts.timestamp())),
        Function::FormatDate => {
            let ts = first.to_timestamp()?;
            let pattern = as_text(rest[0].clone());
            let items: Vec<Item<'_>> = StrftimeItems::new(&pattern).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(ExtractionError::evaluation(format!(
                    "invalid date format '{}'",
                    pattern
                )));
            }
            let mut out = String::new();
            write!(out, "{}", ts.format_with_items(items.into_iter()))
                .map_err(|_| ExtractionError::evaluation(format!("cannot format date with '{}'", pattern)))?;
            Ok(Value::Text(out))
        },
        Function::Concat | Function::Coalesce => Ok(first),
    }
}
