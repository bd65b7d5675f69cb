//! Guard, transformer and policy expressions.
//!
//! The engine only depends on the [`Expression`] contract. [`SimpleExpression`]
//! is the built-in implementation: literals, dotted variable paths,
//! comparisons, `contains`, `matches` and boolean connectives.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::types::ValueMap;

/// A compiled expression, opaque to everything but the engine that built it.
#[derive(Clone)]
pub struct CompiledExpression {
    source: String,
    program: Arc<dyn Any + Send + Sync>,
}

impl CompiledExpression {
    pub fn new(source: impl Into<String>, program: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            source: source.into(),
            program,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn program<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.program.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("source", &self.source)
            .finish()
    }
}

/// Pluggable expression engine.
pub trait Expression: Send + Sync + 'static {
    fn compile(&self, source: &str) -> Result<CompiledExpression>;

    fn evaluate(&self, compiled: &CompiledExpression, variables: &ValueMap) -> Result<Value>;
}

/// JSON truthiness used for guards and policies.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Look up a dotted path (`order.items.0.sku`) in a variable map.
pub fn lookup_path(variables: &ValueMap, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

// ── Built-in engine ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug)]
enum Ast {
    Literal(Value),
    Path(String),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Compare(CmpOp, Box<Ast>, Box<Ast>),
    Matches(Box<Ast>, Regex),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(String),
    Str(String),
    Ident(String),
    Op(&'static str),
    Minus,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).copied();
        let two = |op: &'static str| Token::Op(op);
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(two("=="));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(two("!="));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Op("!"));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(two(">="));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(two("<="));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(">"));
                i += 1;
            }
            '<' => {
                tokens.push(Token::Op("<"));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(two("&&"));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(two("||"));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(WeftError::validation(format!(
                                "unterminated string in expression: {}",
                                src
                            )))
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            d if d.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            a if a.is_alphabetic() || a == '_' || a == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(WeftError::validation(format!(
                    "unexpected character '{}' in expression: {}",
                    other, src
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn error(&self, msg: &str) -> WeftError {
        WeftError::validation(format!("{} in expression: {}", msg, self.source))
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Op("||"))) || self.is_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::Op("&&"))) || self.is_keyword("and") {
            self.advance();
            let right = self.parse_unary()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if matches!(self.peek(), Some(Token::Op("!"))) || self.is_keyword("not") {
            self.advance();
            return Ok(Ast::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Ast> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => CmpOp::Eq,
            Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            Some(Token::Ident(w)) if w == "contains" => CmpOp::Contains,
            Some(Token::Ident(w)) if w == "matches" => {
                self.advance();
                return match self.advance() {
                    Some(Token::Str(pattern)) => {
                        let re = Regex::new(&pattern)
                            .map_err(|e| self.error(&format!("invalid regex '{}': {}", pattern, e)))?;
                        Ok(Ast::Matches(Box::new(left), re))
                    }
                    _ => Err(self.error("'matches' requires a string pattern")),
                };
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Ast::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(Token::Minus) => match self.advance() {
                Some(Token::Num(n)) => Ok(Ast::Literal(parse_number(&format!("-{}", n))
                    .ok_or_else(|| self.error("invalid number"))?)),
                _ => Err(self.error("'-' must precede a number")),
            },
            Some(Token::Num(n)) => Ok(Ast::Literal(
                parse_number(&n).ok_or_else(|| self.error("invalid number"))?,
            )),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Ast::Literal(Value::Bool(true)),
                "false" => Ast::Literal(Value::Bool(false)),
                "null" => Ast::Literal(Value::Null),
                _ => Ast::Path(word),
            }),
            Some(_) => Err(self.error("unexpected operator")),
            None => Err(self.error("unexpected end")),
        }
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Contains => match left {
            Value::String(s) => right.as_str().map(|r| s.contains(r)).unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
            Value::Object(map) => right.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
            _ => false,
        },
        _ => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (left.as_f64(), right.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            };
            let Some(ord) = ordering else { return false };
            match op {
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                _ => false,
            }
        }
    }
}

fn eval(ast: &Ast, vars: &ValueMap) -> Value {
    match ast {
        Ast::Literal(v) => v.clone(),
        Ast::Path(path) => lookup_path(vars, path).unwrap_or(Value::Null),
        Ast::Not(inner) => Value::Bool(!is_truthy(&eval(inner, vars))),
        Ast::And(a, b) => Value::Bool(is_truthy(&eval(a, vars)) && is_truthy(&eval(b, vars))),
        Ast::Or(a, b) => Value::Bool(is_truthy(&eval(a, vars)) || is_truthy(&eval(b, vars))),
        Ast::Compare(op, a, b) => Value::Bool(compare(*op, &eval(a, vars), &eval(b, vars))),
        Ast::Matches(inner, re) => {
            let v = eval(inner, vars);
            Value::Bool(v.as_str().map(|s| re.is_match(s)).unwrap_or(false))
        }
    }
}

/// Built-in expression engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleExpression;

impl Expression for SimpleExpression {
    fn compile(&self, source: &str) -> Result<CompiledExpression> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(WeftError::validation("empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("trailing tokens"));
        }
        Ok(CompiledExpression::new(source, Arc::new(ast)))
    }

    fn evaluate(&self, compiled: &CompiledExpression, variables: &ValueMap) -> Result<Value> {
        let ast = compiled.program::<Ast>().ok_or_else(|| {
            WeftError::validation(format!(
                "expression was not compiled by this engine: {}",
                compiled.source()
            ))
        })?;
        Ok(eval(ast, variables))
    }
}

/// Compiled expressions keyed by source string, shared by bindings,
/// edge guards and guardrail policies.
pub struct ExpressionCache {
    engine: Arc<dyn Expression>,
    compiled: RwLock<HashMap<String, CompiledExpression>>,
}

impl ExpressionCache {
    pub fn new(engine: Arc<dyn Expression>) -> Self {
        Self {
            engine,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn compile(&self, source: &str) -> Result<CompiledExpression> {
        {
            let cache = self.compiled.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cache.get(source) {
                return Ok(c.clone());
            }
        }
        let compiled = self.engine.compile(source)?;
        self.compiled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn evaluate(&self, source: &str, variables: &ValueMap) -> Result<Value> {
        let compiled = self.compile(source)?;
        self.engine.evaluate(&compiled, variables)
    }

    pub fn evaluate_bool(&self, source: &str, variables: &ValueMap) -> Result<bool> {
        self.evaluate(source, variables).map(|v| is_truthy(&v))
    }

    pub fn len(&self) -> usize {
        self.compiled.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new(Arc::new(SimpleExpression))
    }
}
