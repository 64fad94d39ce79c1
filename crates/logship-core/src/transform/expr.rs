//! Expression language for filters and topic/partition computation.
//!
//! A small, total language over parsed records: field references, string and
//! integer literals, comparisons, boolean connectives and `+` concatenation.
//! Grammar (precedence low to high):
//!
//! ```text
//! expr   := and ("||" and)*
//! and    := cmp ("&&" cmp)*
//! cmp    := add (("==" | "!=" | "<=" | "<" | ">=" | ">") add)?
//! add    := unary ("+" unary)*
//! unary  := "!" unary | primary
//! primary:= "(" expr ")" | string | integer | "true" | "false" | field
//! field  := ident ("." ident)*
//! ```
//!
//! Field paths resolve against the record: the scalar syslog fields by name,
//! `sd.<section>.<name>` into structured data, and `props.<key>` into parser
//! properties.

use crate::error::TransformError;
use crate::model::ParsedRecord;

/// A value produced by expression evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value
    Str(String),
    /// Integer value
    Int(i64),
    /// Boolean value
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
        }
    }

    /// Coerce to a boolean, as required at the top of a filter expression.
    pub fn into_bool(self) -> Result<bool, TransformError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(TransformError::Eval(format!(
                "expected boolean result, got {}",
                other.type_name()
            ))),
        }
    }

    /// Coerce to the string form used for topics and partition keys.
    pub fn into_topic_string(self) -> Result<String, TransformError> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Int(i) => Ok(i.to_string()),
            Value::Bool(_) => Err(TransformError::Eval(
                "boolean cannot be used as a topic or partition key".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Dot,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, what: &'static str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            what,
        }
    }

    fn error(&self, message: impl Into<String>) -> TransformError {
        TransformError::Parse {
            what: self.what,
            offset: self.pos,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, TransformError> {
        let mut tokens = Vec::new();
        while self.pos < self.src.len() {
            let start = self.pos;
            let c = self.src[self.pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                    continue;
                }
                b'(' => {
                    self.pos += 1;
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((start, Token::RParen));
                }
                b'+' => {
                    self.pos += 1;
                    tokens.push((start, Token::Plus));
                }
                b'.' => {
                    self.pos += 1;
                    tokens.push((start, Token::Dot));
                }
                b'!' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Ne));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Not));
                    }
                }
                b'=' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Eq));
                    } else {
                        return Err(self.error("expected '=='"));
                    }
                }
                b'<' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Le));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Lt));
                    }
                }
                b'>' => {
                    if self.peek(1) == Some(b'=') {
                        self.pos += 2;
                        tokens.push((start, Token::Ge));
                    } else {
                        self.pos += 1;
                        tokens.push((start, Token::Gt));
                    }
                }
                b'&' => {
                    if self.peek(1) == Some(b'&') {
                        self.pos += 2;
                        tokens.push((start, Token::And));
                    } else {
                        return Err(self.error("expected '&&'"));
                    }
                }
                b'|' => {
                    if self.peek(1) == Some(b'|') {
                        self.pos += 2;
                        tokens.push((start, Token::Or));
                    } else {
                        return Err(self.error("expected '||'"));
                    }
                }
                b'"' => {
                    self.pos += 1;
                    let mut s = String::new();
                    loop {
                        match self.src.get(self.pos) {
                            None => return Err(self.error("unterminated string literal")),
                            Some(b'"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(b'\\') => {
                                match self.src.get(self.pos + 1) {
                                    Some(b'"') => s.push('"'),
                                    Some(b'\\') => s.push('\\'),
                                    Some(b'n') => s.push('\n'),
                                    Some(b't') => s.push('\t'),
                                    _ => return Err(self.error("invalid escape sequence")),
                                }
                                self.pos += 2;
                            }
                            Some(&b) => {
                                s.push(b as char);
                                self.pos += 1;
                            }
                        }
                    }
                    tokens.push((start, Token::Str(s)));
                }
                b'0'..=b'9' => {
                    let mut end = self.pos;
                    while end < self.src.len() && self.src[end].is_ascii_digit() {
                        end += 1;
                    }
                    let text = std::str::from_utf8(&self.src[self.pos..end]).unwrap();
                    let n: i64 = text
                        .parse()
                        .map_err(|_| self.error("integer literal out of range"))?;
                    self.pos = end;
                    tokens.push((start, Token::Int(n)));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    let mut end = self.pos;
                    while end < self.src.len()
                        && (self.src[end].is_ascii_alphanumeric() || self.src[end] == b'_')
                    {
                        end += 1;
                    }
                    let text = std::str::from_utf8(&self.src[self.pos..end]).unwrap();
                    self.pos = end;
                    let token = match text {
                        "true" => Token::True,
                        "false" => Token::False,
                        _ => Token::Ident(text.to_string()),
                    };
                    tokens.push((start, token));
                }
                other => {
                    return Err(self.error(format!("unexpected character '{}'", other as char)))
                }
            }
        }
        Ok(tokens)
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Field(Vec<String>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    what: &'static str,
    src_len: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> TransformError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.src_len);
        TransformError::Parse {
            what: self.what,
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Node, TransformError> {
        let mut node = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            node = Node::Binary(BinOp::Or, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, TransformError> {
        let mut node = self.parse_cmp()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_cmp()?;
            node = Node::Binary(BinOp::And, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_cmp(&mut self) -> Result<Node, TransformError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_add()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Node, TransformError> {
        let mut node = self.parse_unary()?;
        while self.eat(&Token::Plus) {
            let rhs = self.parse_unary()?;
            node = Node::Binary(BinOp::Add, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, TransformError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, TransformError> {
        match self.bump() {
            Some(Token::LParen) => {
                let node = self.parse_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(node)
            }
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::Int(n)) => Ok(Node::Literal(Value::Int(n))),
            Some(Token::True) => Ok(Node::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Literal(Value::Bool(false))),
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while self.eat(&Token::Dot) {
                    match self.bump() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => return Err(self.error("expected identifier after '.'")),
                    }
                }
                Ok(Node::Field(path))
            }
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// A compiled, reusable expression.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Node,
}

impl CompiledExpr {
    /// Parse and compile an expression. `what` names the expression in
    /// diagnostics ("filter", "topic", "partition").
    pub fn compile(src: &str, what: &'static str) -> Result<Self, TransformError> {
        if src.trim().is_empty() {
            return Err(TransformError::Parse {
                what,
                offset: 0,
                message: "empty expression".to_string(),
            });
        }
        let tokens = Lexer::new(src, what).tokenize()?;
        let src_len = src.len();
        let mut parser = Parser {
            tokens,
            pos: 0,
            what,
            src_len,
        };
        let root = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input after expression"));
        }
        Ok(Self { root })
    }

    /// Evaluate against a record.
    pub fn eval(&self, record: &ParsedRecord) -> Result<Value, TransformError> {
        eval_node(&self.root, record)
    }
}

fn eval_node(node: &Node, record: &ParsedRecord) -> Result<Value, TransformError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(path) => resolve_field(path, record),
        Node::Not(inner) => {
            let v = eval_node(inner, record)?.into_bool()?;
            Ok(Value::Bool(!v))
        }
        Node::Binary(op, lhs, rhs) => match op {
            BinOp::And => {
                if !eval_node(lhs, record)?.into_bool()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(eval_node(rhs, record)?.into_bool()?))
            }
            BinOp::Or => {
                if eval_node(lhs, record)?.into_bool()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(eval_node(rhs, record)?.into_bool()?))
            }
            BinOp::Eq | BinOp::Ne => {
                let l = eval_node(lhs, record)?;
                let r = eval_node(rhs, record)?;
                let equal = compare_eq(&l, &r)?;
                Ok(Value::Bool(if *op == BinOp::Eq { equal } else { !equal }))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let l = eval_node(lhs, record)?;
                let r = eval_node(rhs, record)?;
                let ordering = compare_ord(&l, &r)?;
                let holds = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(holds))
            }
            BinOp::Add => {
                let l = eval_node(lhs, record)?;
                let r = eval_node(rhs, record)?;
                match (l, r) {
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
                    (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
                    (Value::Str(a), Value::Int(b)) => Ok(Value::Str(format!("{}{}", a, b))),
                    (Value::Int(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
                    (l, r) => Err(TransformError::Eval(format!(
                        "cannot add {} and {}",
                        l.type_name(),
                        r.type_name()
                    ))),
                }
            }
        },
    }
}

fn compare_eq(l: &Value, r: &Value) -> Result<bool, TransformError> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        _ => Err(TransformError::Eval(format!(
            "cannot compare {} with {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn compare_ord(l: &Value, r: &Value) -> Result<std::cmp::Ordering, TransformError> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        _ => Err(TransformError::Eval(format!(
            "cannot order {} against {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

/// Resolve a dotted field path against a record.
pub(crate) fn resolve_field(
    path: &[String],
    record: &ParsedRecord,
) -> Result<Value, TransformError> {
    let head = path[0].as_str();
    match (head, path.len()) {
        ("facility", 1) => Ok(Value::Int(record.facility as i64)),
        ("severity", 1) => Ok(Value::Int(record.severity as i64)),
        ("priority", 1) => Ok(Value::Int(record.priority as i64)),
        ("hostname", 1) => Ok(Value::Str(record.hostname.clone())),
        ("appname", 1) => Ok(Value::Str(record.appname.clone())),
        ("procid", 1) => Ok(Value::Str(record.procid.clone())),
        ("msgid", 1) => Ok(Value::Str(record.msgid.clone())),
        ("message", 1) => Ok(Value::Str(record.message.clone())),
        ("timestamp_reported", 1) => Ok(Value::Str(record.timestamp_reported.to_rfc3339())),
        ("timestamp_generated", 1) => Ok(Value::Str(record.timestamp_generated.to_rfc3339())),
        ("sd", 3) => record
            .structured_data
            .get(&path[1])
            .and_then(|section| section.get(&path[2]))
            .map(|v| Value::Str(v.clone()))
            .ok_or_else(|| {
                TransformError::Eval(format!(
                    "structured data element sd.{}.{} not present",
                    path[1], path[2]
                ))
            }),
        ("props", 2) => match record.properties.get(&path[1]) {
            Some(serde_json::Value::String(s)) => Ok(Value::Str(s.clone())),
            Some(serde_json::Value::Number(n)) if n.is_i64() => {
                Ok(Value::Int(n.as_i64().unwrap_or_default()))
            }
            Some(serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            Some(_) => Err(TransformError::Eval(format!(
                "property {} is not a scalar",
                path[1]
            ))),
            None => Err(TransformError::Eval(format!(
                "property {} not present",
                path[1]
            ))),
        },
        _ => Err(TransformError::Eval(format!(
            "unknown field {}",
            path.join(".")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::record;

    fn eval(src: &str, rec: &ParsedRecord) -> Result<Value, TransformError> {
        CompiledExpr::compile(src, "filter")?.eval(rec)
    }

    #[test]
    fn test_comparisons() {
        let rec = record("web-01", 3);
        assert_eq!(
            eval(r#"hostname == "web-01""#, &rec).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval("severity <= 4", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval("severity > 3", &rec).unwrap(), Value::Bool(false));
        assert_eq!(eval("priority == 131", &rec).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_boolean_connectives() {
        let rec = record("web-01", 3);
        assert_eq!(
            eval(r#"hostname == "web-01" && severity < 5"#, &rec).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(r#"hostname == "other" || severity == 3"#, &rec).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(r#"!(hostname == "web-01")"#, &rec).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_short_circuit_skips_rhs_errors() {
        let rec = record("web-01", 3);
        // rhs references a missing property but the lhs decides the result
        assert_eq!(
            eval(r#"hostname == "web-01" || props.missing == "x""#, &rec).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_string_concat_for_topics() {
        let rec = record("web-01", 3);
        assert_eq!(
            eval(r#""logs-" + appname"#, &rec).unwrap(),
            Value::Str("logs-testapp".to_string())
        );
        assert_eq!(
            eval(r#""sev" + severity"#, &rec).unwrap(),
            Value::Str("sev3".to_string())
        );
    }

    #[test]
    fn test_structured_data_lookup() {
        let mut rec = record("web-01", 3);
        rec.structured_data.insert(
            "origin".to_string(),
            [("ip".to_string(), "198.51.100.7".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            eval(r#"sd.origin.ip == "198.51.100.7""#, &rec).unwrap(),
            Value::Bool(true)
        );
        assert!(eval(r#"sd.origin.missing == "x""#, &rec).is_err());
    }

    #[test]
    fn test_parse_errors_carry_offsets() {
        let err = CompiledExpr::compile(r#"hostname = "x""#, "filter").unwrap_err();
        match err {
            TransformError::Parse { what, offset, .. } => {
                assert_eq!(what, "filter");
                assert_eq!(offset, 9);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(CompiledExpr::compile("", "filter").is_err());
        assert!(CompiledExpr::compile("severity <", "filter").is_err());
        assert!(CompiledExpr::compile(r#""unterminated"#, "filter").is_err());
        assert!(CompiledExpr::compile("severity == 1 extra", "filter").is_err());
    }

    #[test]
    fn test_type_mismatch_is_an_eval_error() {
        let rec = record("web-01", 3);
        assert!(eval(r#"severity == "3""#, &rec).is_err());
        assert!(eval("hostname && true", &rec).is_err());
        assert!(eval("unknownfield == 1", &rec).is_err());
    }
}
