//! ABOUTME: Small boolean expression language for conditions and validations
//! ABOUTME: Dotted paths resolve into a JSON scope of inputs, results, and env

use serde_json::Value;
use wf_core::{Error, Result};

/// Evaluation scope: a JSON object whose top-level keys are the namespaces
/// an expression may reference (`inputs`, `results`, `env`, `value`, ...).
#[derive(Debug, Clone)]
pub struct Scope {
    root: Value,
}

impl Scope {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Resolve a dotted path; missing segments yield null
    fn lookup(&self, path: &[String]) -> Value {
        let mut current = &self.root;
        for segment in path {
            match current.get(segment) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(Vec<String>),
    Str(String),
    Num(f64),
    Bool(bool),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(Error::Validation("Expected '&&'".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(Error::Validation("Expected '||'".to_string()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(Error::Validation("Expected '=='".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(Error::Validation(
                                "Unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| Error::Validation(format!("Bad number '{}'", text)))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut path = Vec::new();
                loop {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                    {
                        i += 1;
                    }
                    if start == i {
                        return Err(Error::Validation("Empty path segment".to_string()));
                    }
                    path.push(chars[start..i].iter().collect::<String>());
                    if chars.get(i) == Some(&'.') {
                        i += 1;
                    } else {
                        break;
                    }
                }
                match (path.len(), path[0].as_str()) {
                    (1, "true") => tokens.push(Token::Bool(true)),
                    (1, "false") => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(path)),
                }
            }
            other => {
                return Err(Error::Validation(format!(
                    "Unexpected character '{}' in expression",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Scope,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Value::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Value> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.advance();
        let right = self.parse_unary()?;

        let result = match op {
            Token::Eq => loose_eq(&left, &right),
            Token::Ne => !loose_eq(&left, &right),
            other => {
                let ordering = compare(&left, &right)?;
                match other {
                    Token::Lt => ordering == std::cmp::Ordering::Less,
                    Token::Le => ordering != std::cmp::Ordering::Greater,
                    Token::Gt => ordering == std::cmp::Ordering::Greater,
                    Token::Ge => ordering != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Value::Bool(!as_bool(&operand)?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.advance().cloned() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Validation("Expected ')'".to_string())),
                }
            }
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(serde_json::json!(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Ident(path)) => Ok(self.scope.lookup(&path)),
            other => Err(Error::Validation(format!(
                "Unexpected token in expression: {:?}",
                other
            ))),
        }
    }
}

fn as_bool(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        other => Err(Error::Validation(format!(
            "Expected a boolean, got {}",
            other
        ))),
    }
}

/// Equality across JSON values; numbers compare numerically
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| Error::Validation("Numbers are not comparable".to_string()));
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(Error::Validation(format!(
        "Cannot order {} against {}",
        a, b
    )))
}

/// Evaluate an expression to its JSON value
pub fn eval_expr(expression: &str, scope: &Scope) -> Result<Value> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(Error::Validation("Empty expression".to_string()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };
    let value = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(Error::Validation(format!(
            "Trailing tokens in expression '{}'",
            expression
        )));
    }
    Ok(value)
}

/// Evaluate an expression that must produce a boolean
pub fn eval_bool(expression: &str, scope: &Scope) -> Result<bool> {
    match eval_expr(expression, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Validation(format!(
            "Expression '{}' evaluated to non-boolean {}",
            expression, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new(json!({
            "inputs": { "tag": "v1", "count": 3, "dry_run": false },
            "results": { "build": { "status": "ok", "artifacts": 2 } },
            "env": { "CI": "true" }
        }))
    }

    #[test]
    fn test_string_equality() {
        assert!(eval_bool("inputs.tag == \"v1\"", &scope()).unwrap());
        assert!(!eval_bool("inputs.tag == 'v2'", &scope()).unwrap());
        assert!(eval_bool("inputs.tag != 'v2'", &scope()).unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(eval_bool("inputs.count > 2", &scope()).unwrap());
        assert!(eval_bool("inputs.count <= 3", &scope()).unwrap());
        assert!(!eval_bool("results.build.artifacts >= 5", &scope()).unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval_bool(
            "inputs.tag == 'v1' && results.build.status == 'ok'",
            &scope()
        )
        .unwrap());
        assert!(eval_bool("inputs.tag == 'v2' || inputs.count == 3", &scope()).unwrap());
        assert!(eval_bool("!inputs.dry_run", &scope()).unwrap());
    }

    #[test]
    fn test_parentheses() {
        assert!(eval_bool(
            "(inputs.tag == 'v2' || inputs.count > 1) && !inputs.dry_run",
            &scope()
        )
        .unwrap());
    }

    #[test]
    fn test_missing_path_is_null() {
        assert!(!eval_bool("inputs.missing == 'x'", &scope()).unwrap());
        assert!(eval_bool("inputs.missing != 'x'", &scope()).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        assert!(eval_bool("inputs.tag", &scope()).is_err());
        assert!(eval_bool("inputs.count", &scope()).is_err());
    }

    #[test]
    fn test_bare_literals() {
        assert!(eval_bool("true", &scope()).unwrap());
        assert!(!eval_bool("false", &scope()).unwrap());
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        assert!(eval_bool("inputs.tag ==", &scope()).is_err());
        assert!(eval_bool("&& true", &scope()).is_err());
        assert!(eval_bool("(true", &scope()).is_err());
        assert!(eval_bool("inputs.tag = 'v1'", &scope()).is_err());
        assert!(eval_bool("", &scope()).is_err());
        assert!(eval_bool("'unterminated", &scope()).is_err());
    }

    #[test]
    fn test_ordering_null_is_error() {
        assert!(eval_bool("inputs.missing > 1", &scope()).is_err());
    }

    #[test]
    fn test_negative_numbers() {
        assert!(eval_bool("inputs.count > -1", &scope()).unwrap());
    }
}
