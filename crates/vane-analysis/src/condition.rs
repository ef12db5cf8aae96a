//! Success/failure condition expressions.
//!
//! A small expression language evaluated against the measured value, bound
//! to the identifier `result`:
//!
//! ```text
//! result >= 0.95
//! result[0] < 500 && len(result) > 0
//! asFloat(result.rate) * 100 > 99 || result.status == "ok"
//! !isNaN(result)
//! ```
//!
//! Numeric strings compare as numbers, since most providers report values
//! as text.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("evaluation error: {0}")]
    Eval(String),
}

type CondResult<T> = Result<T, ConditionError>;

/// A parsed condition, ready to be evaluated repeatedly.
#[derive(Debug, Clone)]
pub struct Condition {
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> CondResult<Self> {
        let tokens = tokenize(source)?;
        if tokens.len() > MAX_TOKENS {
            return Err(ConditionError::Parse {
                pos: 0,
                message: format!("expression longer than {MAX_TOKENS} tokens"),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: source.len(),
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some((tok, at)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::Parse {
                pos: *at,
                message: format!("unexpected {tok:?}"),
            });
        }
        Ok(Self { expr })
    }

    /// Evaluate against a measured value. The expression must yield a boolean.
    pub fn evaluate(&self, result: &serde_json::Value) -> CondResult<bool> {
        let result = Val::from(result);
        match eval(&self.expr, &result)? {
            Val::Bool(b) => Ok(b),
            other => Err(ConditionError::Eval(format!(
                "condition evaluated to {}, expected a boolean",
                other.type_name()
            ))),
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, result: &serde_json::Value) -> CondResult<bool> {
    Condition::parse(source)?.evaluate(result)
}

// ── Values ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Val>),
    Map(BTreeMap<String, Val>),
}

impl From<&serde_json::Value> for Val {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(*b),
            serde_json::Value::Number(n) => Val::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Val::Str(s.clone()),
            serde_json::Value::Array(items) => Val::List(items.iter().map(Val::from).collect()),
            serde_json::Value::Object(map) => {
                Val::Map(map.iter().map(|(k, v)| (k.clone(), Val::from(v))).collect())
            }
        }
    }
}

impl Val {
    fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Map(_) => "map",
        }
    }

    /// Numeric view, accepting numeric strings.
    fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            Val::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ── Tokens ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

const OPERATORS: [&str; 13] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/",
];

fn tokenize(source: &str) -> CondResult<Vec<(Token, usize)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &source[start..i];
            let n = text.parse().map_err(|_| ConditionError::Parse {
                pos: start,
                message: format!("bad number {text:?}"),
            })?;
            tokens.push((Token::Num(n), start));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((Token::Ident(source[start..i].to_string()), start));
            continue;
        }

        if c == '"' || c == '\'' {
            i += 1;
            let mut text = String::new();
            while i < bytes.len() {
                let ch = bytes[i] as char;
                if ch == c {
                    i += 1;
                    tokens.push((Token::Str(text), start));
                    continue 'outer;
                }
                if ch == '\\' && i + 1 < bytes.len() {
                    i += 1;
                }
                // Multi-byte characters are copied through unchanged.
                let len = utf8_len(bytes[i]);
                text.push_str(&source[i..i + len]);
                i += len;
            }
            return Err(ConditionError::Parse {
                pos: start,
                message: "unterminated string".to_string(),
            });
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push((tok, start));
            i += 1;
            continue;
        }

        for op in OPERATORS {
            if source[i..].starts_with(op) {
                tokens.push((Token::Op(op), start));
                i += op.len();
                continue 'outer;
            }
        }

        return Err(ConditionError::Parse {
            pos: start,
            message: format!("unexpected character {c:?}"),
        });
    }
    Ok(tokens)
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ── Parser ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
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
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Val),
    Var(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Call(String, Vec<Expr>),
}

/// Deepest nesting of parentheses, indexing, calls and unary operators.
const MAX_DEPTH: usize = 64;

/// Longest condition, in tokens. Bounds the depth of operator chains.
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    len: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, at)| *at).unwrap_or(self.len)
    }

    fn error<T>(&self, message: impl Into<String>) -> CondResult<T> {
        Err(ConditionError::Parse {
            pos: self.offset(),
            message: message.into(),
        })
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> CondResult<()> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {tok:?}"))
        }
    }

    fn nested(&mut self, rule: fn(&mut Self) -> CondResult<Expr>) -> CondResult<Expr> {
        if self.depth >= MAX_DEPTH {
            return self.error(format!("nested deeper than {MAX_DEPTH}"));
        }
        self.depth += 1;
        let expr = rule(self);
        self.depth -= 1;
        expr
    }

    fn expr(&mut self) -> CondResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat_op("||") {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> CondResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.eat_op("&&") {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> CondResult<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinOp::Eq,
            Some(Token::Op("!=")) => BinOp::Ne,
            Some(Token::Op("<")) => BinOp::Lt,
            Some(Token::Op("<=")) => BinOp::Le,
            Some(Token::Op(">")) => BinOp::Gt,
            Some(Token::Op(">=")) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> CondResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> CondResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> CondResult<Expr> {
        if self.eat_op("!") {
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> CondResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.nested(Self::expr)?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.peek().cloned() {
                        Some(Token::Ident(name)) => {
                            self.pos += 1;
                            expr = Expr::Field(Box::new(expr), name);
                        }
                        _ => return self.error("expected field name after '.'"),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> CondResult<Expr> {
        let Some(tok) = self.peek().cloned() else {
            return self.error("unexpected end of expression");
        };
        self.pos += 1;
        match tok {
            Token::Num(n) => Ok(Expr::Lit(Val::Num(n))),
            Token::Str(s) => Ok(Expr::Lit(Val::Str(s))),
            Token::LParen => {
                let inner = self.nested(Self::expr)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Lit(Val::Bool(true))),
                "false" => Ok(Expr::Lit(Val::Bool(false))),
                "null" | "nil" => Ok(Expr::Lit(Val::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.nested(Self::expr)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Var(name)),
            },
            other => {
                self.pos -= 1;
                self.error(format!("unexpected {other:?}"))
            }
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────────

fn eval_err<T>(message: impl Into<String>) -> CondResult<T> {
    Err(ConditionError::Eval(message.into()))
}

fn eval(expr: &Expr, result: &Val) -> CondResult<Val> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Var(name) if name == "result" => Ok(result.clone()),
        Expr::Var(name) => eval_err(format!("unknown identifier {name:?}")),
        Expr::Not(inner) => match eval(inner, result)? {
            Val::Bool(b) => Ok(Val::Bool(!b)),
            other => eval_err(format!("cannot negate {}", other.type_name())),
        },
        Expr::Neg(inner) => {
            let v = eval(inner, result)?;
            match v.as_num() {
                Some(n) => Ok(Val::Num(-n)),
                None => eval_err(format!("cannot negate {}", v.type_name())),
            }
        }
        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !truth(eval(lhs, result)?)? {
                return Ok(Val::Bool(false));
            }
            Ok(Val::Bool(truth(eval(rhs, result)?)?))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if truth(eval(lhs, result)?)? {
                return Ok(Val::Bool(true));
            }
            Ok(Val::Bool(truth(eval(rhs, result)?)?))
        }
        Expr::Binary(op, lhs, rhs) => binary(*op, eval(lhs, result)?, eval(rhs, result)?),
        Expr::Index(target, index) => {
            let target = eval(target, result)?;
            let index = eval(index, result)?;
            match (&target, &index) {
                (Val::List(items), idx) => {
                    let Some(n) = idx.as_num() else {
                        return eval_err(format!("list index must be a number, got {}", idx.type_name()));
                    };
                    if n < 0.0 || n.fract() != 0.0 || n as usize >= items.len() {
                        return eval_err(format!("index {n} out of range (len {})", items.len()));
                    }
                    Ok(items[n as usize].clone())
                }
                (Val::Map(_), Val::Str(key)) => field(target.clone(), key),
                _ => eval_err(format!(
                    "cannot index {} with {}",
                    target.type_name(),
                    index.type_name()
                )),
            }
        }
        Expr::Field(target, name) => field(eval(target, result)?, name),
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, result))
                .collect::<CondResult<Vec<_>>>()?;
            call(name, args)
        }
    }
}

fn truth(v: Val) -> CondResult<bool> {
    match v {
        Val::Bool(b) => Ok(b),
        other => eval_err(format!("expected bool operand, got {}", other.type_name())),
    }
}

fn field(target: Val, name: &str) -> CondResult<Val> {
    match target {
        Val::Map(mut map) => match map.remove(name) {
            Some(v) => Ok(v),
            None => eval_err(format!("no field {name:?}")),
        },
        other => eval_err(format!("cannot access field {name:?} on {}", other.type_name())),
    }
}

fn binary(op: BinOp, lhs: Val, rhs: Val) -> CondResult<Val> {
    match op {
        BinOp::Eq => Ok(Val::Bool(loose_eq(&lhs, &rhs))),
        BinOp::Ne => Ok(Val::Bool(!loose_eq(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (lhs.as_num(), rhs.as_num()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (&lhs, &rhs) {
                    (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                    _ => {
                        return eval_err(format!(
                            "cannot compare {} with {}",
                            lhs.type_name(),
                            rhs.type_name()
                        ));
                    }
                },
            };
            // NaN compares false against everything.
            let Some(ord) = ord else {
                return Ok(Val::Bool(false));
            };
            Ok(Val::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::Add => {
            if let (Val::Str(a), Val::Str(b)) = (&lhs, &rhs) {
                return Ok(Val::Str(format!("{a}{b}")));
            }
            arith(lhs, rhs, |a, b| a + b)
        }
        BinOp::Sub => arith(lhs, rhs, |a, b| a - b),
        BinOp::Mul => arith(lhs, rhs, |a, b| a * b),
        BinOp::Div => arith(lhs, rhs, |a, b| a / b),
        BinOp::And | BinOp::Or => unreachable!("short-circuit operators are evaluated in eval"),
    }
}

fn arith(lhs: Val, rhs: Val, f: impl Fn(f64, f64) -> f64) -> CondResult<Val> {
    match (lhs.as_num(), rhs.as_num()) {
        (Some(a), Some(b)) => Ok(Val::Num(f(a, b))),
        _ => eval_err(format!(
            "arithmetic on {} and {}",
            lhs.type_name(),
            rhs.type_name()
        )),
    }
}

fn loose_eq(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Num(_), _) | (_, Val::Num(_)) => match (a.as_num(), b.as_num()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

fn call(name: &str, mut args: Vec<Val>) -> CondResult<Val> {
    if args.len() != 1 {
        return eval_err(format!("{name}() takes exactly one argument"));
    }
    let arg = args.remove(0);
    match name {
        "len" => match &arg {
            Val::List(items) => Ok(Val::Num(items.len() as f64)),
            Val::Map(map) => Ok(Val::Num(map.len() as f64)),
            Val::Str(s) => Ok(Val::Num(s.chars().count() as f64)),
            other => eval_err(format!("len() of {}", other.type_name())),
        },
        "asFloat" => match arg.as_num() {
            Some(n) => Ok(Val::Num(n)),
            None => eval_err(format!("asFloat() of {}", arg.type_name())),
        },
        "asInt" => match arg.as_num() {
            Some(n) => Ok(Val::Num(n.trunc())),
            None => eval_err(format!("asInt() of {}", arg.type_name())),
        },
        "isNaN" => Ok(Val::Bool(arg.as_num().is_some_and(f64::is_nan))),
        _ => eval_err(format!("unknown function {name}()")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(src: &str, result: serde_json::Value) -> bool {
        evaluate(src, &result).unwrap()
    }

    #[test]
    fn numeric_comparisons() {
        assert!(check("result >= 0.95", json!(0.97)));
        assert!(!check("result >= 0.95", json!(0.9)));
        assert!(check("result == 1", json!(1.0)));
        assert!(check("result != 2", json!(1)));
        assert!(check("result < -1", json!(-3)));
    }

    #[test]
    fn numeric_strings_compare_as_numbers() {
        assert!(check("result > 10", json!("12.5")));
        assert!(check("result == 200", json!("200")));
    }

    #[test]
    fn boolean_logic_and_precedence() {
        assert!(check("result > 1 && result < 5 || false", json!(3)));
        assert!(check("!(result > 5)", json!(3)));
        assert!(check("result * 100 >= 95 && true", json!(0.96)));
        assert!(check("1 + 2 * 3 == 7", json!(null)));
    }

    #[test]
    fn indexing_fields_and_len() {
        let value = json!({"data": {"series": [0.99, 0.5]}, "status": "ok"});
        assert!(check("result.data.series[0] > 0.9", value.clone()));
        assert!(check("len(result.data.series) == 2", value.clone()));
        assert!(check("result.status == 'ok'", value.clone()));
        assert!(check(r#"result["status"] == "ok""#, value));
    }

    #[test]
    fn conversion_functions() {
        assert!(check("asFloat(result) > 0.5", json!("0.75")));
        assert!(check("asInt(result) == 3", json!(3.9)));
        assert!(check("isNaN(result)", json!("NaN")));
        assert!(!check("result > 0", json!("NaN")));
    }

    #[test]
    fn parse_errors_report_offset() {
        let err = Condition::parse("result >= ").unwrap_err();
        assert!(matches!(err, ConditionError::Parse { pos: 10, .. }));
        assert!(Condition::parse("result >= 1)").is_err());
        assert!(Condition::parse("'open").is_err());
        assert!(Condition::parse("result # 1").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let shallow = format!("{}result{} > 1", "(".repeat(10), ")".repeat(10));
        assert!(check(&shallow, json!(2)));

        let deep = format!("{}result{} > 1", "(".repeat(200_000), ")".repeat(200_000));
        assert!(matches!(Condition::parse(&deep), Err(ConditionError::Parse { .. })));

        let nots = format!("{}true", "!".repeat(MAX_DEPTH + 1));
        assert!(Condition::parse(&nots).is_err());

        let chain = vec!["result"; 5000].join(" + ");
        assert!(Condition::parse(&chain).is_err());
    }

    #[test]
    fn eval_errors() {
        assert!(matches!(
            evaluate("result", &json!(1)),
            Err(ConditionError::Eval(_))
        ));
        assert!(evaluate("result.missing > 1", &json!({"a": 1})).is_err());
        assert!(evaluate("result[5] > 1", &json!([1])).is_err());
        assert!(evaluate("other > 1", &json!(1)).is_err());
        assert!(evaluate("frob(result)", &json!(1)).is_err());
    }

    #[test]
    fn short_circuit_skips_bad_operand() {
        assert!(!check("false && result.missing", json!({})));
        assert!(check("true || result.missing", json!({})));
    }
}
