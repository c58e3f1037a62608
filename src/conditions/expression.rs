//! # Expression Conditions
//!
//! A small, sandboxed boolean expression language evaluated against a
//! [`RequestContext`]. Expressions can only read context fields, compare them and combine
//! the results; there is no way to call into host code.
//!
//! ```text
//! req.method == "POST" && req.headers.content-type != null
//! !(user.id == "banned") || vars.retries < 3
//! apiEndpoint.scopes["0"] == "admin"
//! ```
//!
//! Parsing happens once when a pipeline is compiled. Syntax errors, unknown roots and
//! limit violations are configuration errors; type errors found while evaluating are
//! reported as expression errors for that request.

use serde_json::Value;
use std::fmt;

use crate::core::context::{RequestContext, ScopeRoot};
use crate::core::error::{GatewayError, GatewayResult};

/// Maximum nesting of parentheses and negations
pub const MAX_EXPR_DEPTH: usize = 32;

/// Maximum length of expression source in bytes
pub const MAX_EXPR_LENGTH: usize = 1024;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Equal => write!(f, "=="),
            CompareOp::NotEqual => write!(f, "!="),
            CompareOp::LessThan => write!(f, "<"),
            CompareOp::LessThanOrEqual => write!(f, "<="),
            CompareOp::GreaterThan => write!(f, ">"),
            CompareOp::GreaterThanOrEqual => write!(f, ">="),
        }
    }
}

/// Reference to a context field, e.g. `req.headers.host`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPath {
    pub root: ScopeRoot,
    pub segments: Vec<String>,
}

impl FieldPath {
    /// Parse a bare field path such as `req.query.page`
    pub fn parse(source: &str) -> GatewayResult<Self> {
        let tokens = tokenize(source).map_err(|e| invalid(source, e))?;
        let mut parser = Parser::new(&tokens);
        let path = parser.parse_field().map_err(|e| invalid(source, e))?;
        if parser.current().is_some() {
            return Err(invalid(source, "unexpected input after field path".to_string()));
        }
        Ok(path)
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Value {
        ctx.lookup(self.root, &self.segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.as_str())?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Field(FieldPath),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
}

/// A compiled expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse and validate an expression
    pub fn compile(source: &str) -> GatewayResult<Self> {
        if source.len() > MAX_EXPR_LENGTH {
            return Err(invalid(
                source,
                format!("expression is {} bytes long, limit is {}", source.len(), MAX_EXPR_LENGTH),
            ));
        }

        let tokens = tokenize(source).map_err(|e| invalid(source, e))?;
        if tokens.is_empty() {
            return Err(invalid(source, "expression is empty".to_string()));
        }

        let mut parser = Parser::new(&tokens);
        let root = parser.parse_expr().map_err(|e| invalid(source, e))?;
        if let Some(token) = parser.current() {
            return Err(invalid(source, format!("unexpected token {}", token)));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a JSON value
    pub fn evaluate(&self, ctx: &RequestContext) -> GatewayResult<Value> {
        eval(&self.root, ctx)
    }

    /// Evaluate and apply truthiness
    pub fn matches(&self, ctx: &RequestContext) -> GatewayResult<bool> {
        self.evaluate(ctx).map(|value| is_truthy(&value))
    }
}

/// `null`, `false`, `0` and `""` are false; everything else, including empty arrays
/// and objects, is true
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn invalid(source: &str, message: String) -> GatewayError {
    GatewayError::config(format!("Invalid expression '{}': {}", source, message))
}

fn eval(expr: &Expr, ctx: &RequestContext) -> GatewayResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(path) => Ok(path.resolve(ctx)),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, ctx)?))),
        Expr::And(left, right) => {
            if !is_truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
        }
        Expr::Or(left, right) => {
            if is_truthy(&eval(left, ctx)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
        }
        Expr::Compare { left, op, right } => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            compare(&left, *op, &right).map(Value::Bool)
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> GatewayResult<bool> {
    match op {
        CompareOp::Equal => Ok(values_equal(left, right)),
        CompareOp::NotEqual => Ok(!values_equal(left, right)),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64(), b.as_f64());
                    a.zip(b).and_then(|(a, b)| a.partial_cmp(&b))
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };

            let ordering = ordering.ok_or_else(|| {
                GatewayError::expression(format!(
                    "cannot compare {} {} {}",
                    type_name(left),
                    op,
                    type_name(right)
                ))
            })?;

            Ok(match op {
                CompareOp::LessThan => ordering.is_lt(),
                CompareOp::LessThanOrEqual => ordering.is_le(),
                CompareOp::GreaterThan => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===== TOKENIZER =====

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Dot,
    And,
    Or,
    Not,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Identifier(String),
    StringLiteral(String),
    Number(f64),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LeftParen => write!(f, "'('"),
            Token::RightParen => write!(f, "')'"),
            Token::LeftBracket => write!(f, "'['"),
            Token::RightBracket => write!(f, "']'"),
            Token::Dot => write!(f, "'.'"),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Not => write!(f, "'!'"),
            Token::Equal => write!(f, "'=='"),
            Token::NotEqual => write!(f, "'!='"),
            Token::LessThan => write!(f, "'<'"),
            Token::LessThanOrEqual => write!(f, "'<='"),
            Token::GreaterThan => write!(f, "'>'"),
            Token::GreaterThanOrEqual => write!(f, "'>='"),
            Token::Identifier(name) => write!(f, "'{}'", name),
            Token::StringLiteral(value) => write!(f, "\"{}\"", value),
            Token::Number(n) => write!(f, "{}", n),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | '.' => {
                chars.next();
                tokens.push(match ch {
                    '(' => Token::LeftParen,
                    ')' => Token::RightParen,
                    '[' => Token::LeftBracket,
                    ']' => Token::RightBracket,
                    _ => Token::Dot,
                });
            }
            '&' | '|' => {
                chars.next();
                if chars.peek() != Some(&ch) {
                    return Err(format!("single '{}' not allowed, use '{}{}'", ch, ch, ch));
                }
                chars.next();
                tokens.push(if ch == '&' { Token::And } else { Token::Or });
            }
            '=' => {
                chars.next();
                if chars.peek() != Some(&'=') {
                    return Err("single '=' not allowed, use '=='".to_string());
                }
                chars.next();
                tokens.push(Token::Equal);
            }
            '!' | '<' | '>' => {
                chars.next();
                let with_eq = chars.peek() == Some(&'=');
                if with_eq {
                    chars.next();
                }
                tokens.push(match (ch, with_eq) {
                    ('!', true) => Token::NotEqual,
                    ('!', false) => Token::Not,
                    ('<', true) => Token::LessThanOrEqual,
                    ('<', false) => Token::LessThan,
                    ('>', true) => Token::GreaterThanOrEqual,
                    _ => Token::GreaterThan,
                });
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(c) => value.push(c),
                            None => return Err("unterminated string literal".to_string()),
                        },
                        Some(c) if c == ch => break,
                        Some(c) => value.push(c),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::StringLiteral(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_digit() || next == '.' {
                        literal.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", literal))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' || next == '$' || next == '-' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Identifier(ident));
            }
            _ => return Err(format!("unexpected character '{}'", ch)),
        }
    }

    Ok(tokens)
}

// ===== PARSER =====

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn current(&self) -> Option<&'a Token> {
        let tokens = self.tokens;
        tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tokens = self.tokens;
        self.pos += 1;
        tokens.get(self.pos - 1)
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(token) if *token == expected => Ok(()),
            Some(token) => Err(format!("expected {}, got {}", expected, token)),
            None => Err(format!("expected {}, got end of input", expected)),
        }
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(format!("expression nests deeper than {} levels", MAX_EXPR_DEPTH));
        }
        Ok(())
    }

    // expr ::= or
    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    // or ::= and ("||" and)*
    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while matches!(self.current(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and ::= unary ("&&" unary)*
    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while matches!(self.current(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // unary ::= "!" unary | compare
    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.current(), Some(Token::Not)) {
            self.advance();
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    // compare ::= primary (op primary)?
    fn parse_compare(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;

        let op = match self.current() {
            Some(Token::Equal) => CompareOp::Equal,
            Some(Token::NotEqual) => CompareOp::NotEqual,
            Some(Token::LessThan) => CompareOp::LessThan,
            Some(Token::LessThanOrEqual) => CompareOp::LessThanOrEqual,
            Some(Token::GreaterThan) => CompareOp::GreaterThan,
            Some(Token::GreaterThanOrEqual) => CompareOp::GreaterThanOrEqual,
            _ => return Ok(left),
        };
        self.advance();

        let right = self.parse_primary()?;
        Ok(Expr::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    // primary ::= STRING | NUMBER | true | false | null | path | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.current().cloned() {
            Some(Token::LeftParen) => {
                self.advance();
                self.enter()?;
                let inner = self.parse_expr()?;
                self.expect(Token::RightParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::StringLiteral(value)) => {
                self.advance();
                Ok(Expr::Literal(Value::String(value)))
            }
            Some(Token::Number(n)) => {
                self.advance();
                Ok(Expr::Literal(Value::from(n)))
            }
            Some(Token::Identifier(name)) => match name.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(true)))
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Bool(false)))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Literal(Value::Null))
                }
                _ => self.parse_field().map(Expr::Field),
            },
            Some(token) => Err(format!("unexpected token {}", token)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    // path ::= ROOT ("." IDENT | "[" STRING "]")*
    fn parse_field(&mut self) -> Result<FieldPath, String> {
        let root = match self.advance() {
            Some(Token::Identifier(name)) => ScopeRoot::parse(name).ok_or_else(|| {
                format!(
                    "unknown identifier '{}' (expected req, user, apiEndpoint or vars)",
                    name
                )
            })?,
            Some(token) => return Err(format!("expected field path, got {}", token)),
            None => return Err("expected field path, got end of input".to_string()),
        };

        let mut segments = Vec::new();
        loop {
            match self.current() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Identifier(name)) => segments.push(name.clone()),
                        Some(token) => return Err(format!("expected field name after '.', got {}", token)),
                        None => return Err("expected field name after '.'".to_string()),
                    }
                }
                Some(Token::LeftBracket) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::StringLiteral(key)) => segments.push(key.clone()),
                        Some(Token::Number(n)) if n.fract() == 0.0 && *n >= 0.0 => {
                            segments.push(format!("{}", *n as u64))
                        }
                        Some(token) => return Err(format!("expected string key inside '[]', got {}", token)),
                        None => return Err("expected string key inside '[]'".to_string()),
                    }
                    self.expect(Token::RightBracket)?;
                }
                _ => break,
            }
        }

        Ok(FieldPath { root, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AuthContext, IncomingRequest};
    use crate::routing::test_support::endpoint_rule;
    use axum::http::{HeaderMap, Method, Version};
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("host", "acme.com".parse().unwrap());
        headers.insert("x-tier", "gold".parse().unwrap());
        let request = IncomingRequest::new(
            Method::POST,
            "/orders?page=2".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        );
        let mut ctx = RequestContext::new(request, endpoint_rule("orders", &["write"]), HashMap::new());
        ctx.set_var("retries", json!(2));
        ctx
    }

    fn eval_str(source: &str, ctx: &RequestContext) -> GatewayResult<bool> {
        Expression::compile(source)?.matches(ctx)
    }

    #[test]
    fn test_comparisons() {
        let ctx = context();
        assert!(eval_str(r#"req.method == "POST""#, &ctx).unwrap());
        assert!(eval_str("req.headers.x-tier == 'gold'", &ctx).unwrap());
        assert!(eval_str("vars.retries < 3", &ctx).unwrap());
        assert!(eval_str("vars.retries >= 2.0", &ctx).unwrap());
        assert!(eval_str(r#"req.query["page"] == "2""#, &ctx).unwrap());
        assert!(eval_str(r#"apiEndpoint.scopes[0] == "write""#, &ctx).unwrap());
        assert!(!eval_str("req.path != \"/orders\"", &ctx).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let ctx = context();
        assert!(eval_str("true || false && false", &ctx).unwrap());
        assert!(!eval_str("(true || false) && false", &ctx).unwrap());
        assert!(eval_str("!(req.method == \"GET\")", &ctx).unwrap());
        assert!(eval_str("!!req.path", &ctx).unwrap());
    }

    #[test]
    fn test_missing_fields_are_null() {
        let mut ctx = context();
        assert!(eval_str("user.id == null", &ctx).unwrap());
        assert!(!eval_str("user.id", &ctx).unwrap());
        assert!(eval_str("req.headers.authorization == null", &ctx).unwrap());

        ctx.set_user(AuthContext::new("bob", "key-auth"));
        assert!(eval_str("user.id == \"bob\"", &ctx).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!([])));
    }

    #[test]
    fn test_short_circuit_skips_type_errors() {
        let ctx = context();
        assert!(!eval_str("false && req.path < 3", &ctx).unwrap());
        assert!(eval_str("true || req.path < 3", &ctx).unwrap());
    }

    #[test]
    fn test_ordering_type_mismatch_is_runtime_error() {
        let ctx = context();
        let err = eval_str("req.path < 3", &ctx).unwrap_err();
        assert!(matches!(err, GatewayError::Expression { .. }));
        assert!(err.to_string().contains("cannot compare string < number"));
    }

    #[test]
    fn test_compile_errors() {
        for source in [
            "",
            "req.method = \"GET\"",
            "process.env == 1",
            "req.method ==",
            "(req.method == \"GET\"",
            "req.path & true",
            "'unterminated",
            "req.method == \"GET\" extra",
        ] {
            let err = Expression::compile(source).unwrap_err();
            assert!(err.is_configuration(), "expected configuration error for {:?}", source);
        }
    }

    #[test]
    fn test_limits() {
        let long = format!("req.path == \"{}\"", "a".repeat(MAX_EXPR_LENGTH));
        assert!(Expression::compile(&long).unwrap_err().to_string().contains("limit"));

        let deep = format!("{}true{}", "(".repeat(MAX_EXPR_DEPTH + 1), ")".repeat(MAX_EXPR_DEPTH + 1));
        assert!(Expression::compile(&deep).unwrap_err().to_string().contains("deeper"));

        let ok = format!("{}true{}", "(".repeat(MAX_EXPR_DEPTH), ")".repeat(MAX_EXPR_DEPTH));
        assert!(Expression::compile(&ok).is_ok());
    }

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("req.headers.user-agent").unwrap();
        assert_eq!(path.root, ScopeRoot::Req);
        assert_eq!(path.segments, vec!["headers", "user-agent"]);
        assert_eq!(path.to_string(), "req.headers.user-agent");
        assert!(FieldPath::parse("req.path == 1").is_err());
        assert!(FieldPath::parse("env.HOME").is_err());
    }
}
