//! The `calc(…)` timing expression language.
//!
//! Literals carry a unit suffix (`s` seconds, `ms` milliseconds); the
//! canonical unit is milliseconds, so `2s` compiles to `2000`. References of
//! the form `url(#fragment.time.start)` navigate into the per-compile
//! [`ExpressionContext`], which the timeline compiler fills monotonically as
//! fragments resolve — forward references stay pending until a later pass.

use std::collections::HashMap;

use crate::error::{ReelError, ReelResult};

/// Resolved timing for one fragment, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeData {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FragmentData {
    pub time: TimeData,
}

/// Fragment id → resolved fields, built up during one output compile.
#[derive(Clone, Debug, Default)]
pub struct ExpressionContext {
    fragments: HashMap<String, FragmentData>,
}

impl ExpressionContext {
    pub fn insert(&mut self, fragment_id: impl Into<String>, time: TimeData) {
        self.fragments
            .insert(fragment_id.into(), FragmentData { time });
    }

    pub fn contains(&self, fragment_id: &str) -> bool {
        self.fragments.contains_key(fragment_id)
    }

    pub fn get(&self, fragment_id: &str) -> Option<&FragmentData> {
        self.fragments.get(fragment_id)
    }
}

/// A reference to one field of another fragment, e.g. `#ending.time.start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub fragment_id: String,
    pub path: Vec<String>,
}

#[derive(Clone, Debug)]
enum Expr {
    Num(f64),
    Ref(usize),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug)]
pub struct CompiledExpression {
    source: String,
    ast: Expr,
    refs: Vec<FieldRef>,
}

impl CompiledExpression {
    /// Compile a property value. Accepts the full `calc(…)` form or a bare
    /// arithmetic expression.
    pub fn parse(text: &str) -> ReelResult<CompiledExpression> {
        let trimmed = text.trim();
        let body = match trimmed.strip_prefix("calc(") {
            Some(rest) => rest
                .strip_suffix(')')
                .ok_or_else(|| ReelError::expression_parse(text, "unterminated calc("))?,
            None => trimmed,
        };

        let mut p = ExprParser {
            source: text,
            tokens: tokenize(text, body)?,
            pos: 0,
            refs: Vec::new(),
        };
        let ast = p.parse_sum()?;
        if p.pos != p.tokens.len() {
            return Err(ReelError::expression_parse(
                text,
                format!("unexpected trailing token '{}'", p.tokens[p.pos].describe()),
            ));
        }
        Ok(CompiledExpression {
            source: text.to_string(),
            ast,
            refs: p.refs,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All fragment references in the expression, for the resolution passes.
    pub fn refs(&self) -> &[FieldRef] {
        &self.refs
    }

    /// True when every referenced fragment is already present in `ctx`.
    pub fn ready(&self, ctx: &ExpressionContext) -> bool {
        self.refs.iter().all(|r| ctx.contains(&r.fragment_id))
    }

    /// Evaluate to milliseconds against the context.
    pub fn evaluate(&self, ctx: &ExpressionContext) -> ReelResult<f64> {
        let mut bound = Vec::with_capacity(self.refs.len());
        for r in &self.refs {
            bound.push(self.resolve_ref(r, ctx)?);
        }
        self.eval_node(&self.ast, &bound)
    }

    fn resolve_ref(&self, r: &FieldRef, ctx: &ExpressionContext) -> ReelResult<f64> {
        let data = ctx.get(&r.fragment_id).ok_or_else(|| {
            ReelError::expression_eval(
                &self.source,
                format!("unknown fragment id '{}'", r.fragment_id),
            )
        })?;
        match r.path.iter().map(String::as_str).collect::<Vec<_>>()[..] {
            ["time", "start"] => Ok(data.time.start),
            ["time", "end"] => Ok(data.time.end),
            ["time", "duration"] => Ok(data.time.duration),
            _ => Err(ReelError::expression_eval(
                &self.source,
                format!(
                    "unknown property path '{}' on fragment '{}'",
                    r.path.join("."),
                    r.fragment_id
                ),
            )),
        }
    }

    fn eval_node(&self, e: &Expr, bound: &[f64]) -> ReelResult<f64> {
        Ok(match e {
            Expr::Num(v) => *v,
            Expr::Ref(i) => bound[*i],
            Expr::Neg(a) => -self.eval_node(a, bound)?,
            Expr::Add(a, b) => self.eval_node(a, bound)? + self.eval_node(b, bound)?,
            Expr::Sub(a, b) => self.eval_node(a, bound)? - self.eval_node(b, bound)?,
            Expr::Mul(a, b) => self.eval_node(a, bound)? * self.eval_node(b, bound)?,
            Expr::Div(a, b) => {
                let rhs = self.eval_node(b, bound)?;
                if rhs == 0.0 {
                    return Err(ReelError::expression_eval(&self.source, "division by zero"));
                }
                self.eval_node(a, bound)? / rhs
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ref(FieldRef),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(v) => format!("{v}"),
            Token::Ref(r) => format!("url(#{})", r.fragment_id),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Open => "(".to_string(),
            Token::Close => ")".to_string(),
        }
    }
}

fn tokenize(source: &str, body: &str) -> ReelResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            b'-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            b'/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            b'(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'0'..=b'9' | b'.' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let raw: f64 = body[start..i].parse().map_err(|_| {
                    ReelError::expression_parse(
                        source,
                        format!("bad number '{}'", &body[start..i]),
                    )
                })?;
                // unit suffix: canonical unit is ms
                if body[i..].starts_with("ms") {
                    i += 2;
                    tokens.push(Token::Num(raw));
                } else if body[i..].starts_with('s') {
                    i += 1;
                    tokens.push(Token::Num(raw * 1000.0));
                } else {
                    tokens.push(Token::Num(raw));
                }
            }
            b'u' if body[i..].starts_with("url(#") => {
                let after = i + "url(#".len();
                let rel = body[after..].find(')').ok_or_else(|| {
                    ReelError::expression_parse(source, "unterminated url() reference")
                })?;
                let inner = &body[after..after + rel];
                let mut parts = inner.split('.');
                let fragment_id = parts.next().unwrap_or("").to_string();
                let path: Vec<String> = parts.map(str::to_string).collect();
                if fragment_id.is_empty() || path.is_empty() {
                    return Err(ReelError::expression_parse(
                        source,
                        format!("malformed reference 'url(#{inner})'"),
                    ));
                }
                tokens.push(Token::Ref(FieldRef { fragment_id, path }));
                i = after + rel + 1;
            }
            other => {
                return Err(ReelError::expression_parse(
                    source,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        }
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    refs: Vec<FieldRef>,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_sum(&mut self) -> ReelResult<Expr> {
        let mut lhs = self.parse_product()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.bump();
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.parse_product()?));
                }
                Some(Token::Minus) => {
                    self.bump();
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.parse_product()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_product(&mut self) -> ReelResult<Expr> {
        let mut lhs = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    lhs = Expr::Mul(Box::new(lhs), Box::new(self.parse_factor()?));
                }
                Some(Token::Slash) => {
                    self.bump();
                    lhs = Expr::Div(Box::new(lhs), Box::new(self.parse_factor()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_factor(&mut self) -> ReelResult<Expr> {
        match self.bump() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Ref(r)) => {
                let idx = self
                    .refs
                    .iter()
                    .position(|existing| *existing == r)
                    .unwrap_or_else(|| {
                        self.refs.push(r);
                        self.refs.len() - 1
                    });
                Ok(Expr::Ref(idx))
            }
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.parse_factor()?))),
            Some(Token::Open) => {
                let inner = self.parse_sum()?;
                match self.bump() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(ReelError::expression_parse(
                        self.source,
                        "expected ')'",
                    )),
                }
            }
            Some(t) => Err(ReelError::expression_parse(
                self.source,
                format!("unexpected token '{}'", t.describe()),
            )),
            None => Err(ReelError::expression_parse(
                self.source,
                "unexpected end of expression",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(id: &str, start: f64, end: f64) -> ExpressionContext {
        let mut ctx = ExpressionContext::default();
        ctx.insert(
            id,
            TimeData {
                start,
                end,
                duration: end - start,
            },
        );
        ctx
    }

    #[test]
    fn units_normalize_to_milliseconds() {
        let ctx = ExpressionContext::default();
        for (text, want) in [
            ("calc(2s)", 2000.0),
            ("calc(2.5s)", 2500.0),
            ("calc(300ms)", 300.0),
            ("calc(300)", 300.0),
            ("calc(1s + 500ms)", 1500.0),
        ] {
            let got = CompiledExpression::parse(text).unwrap().evaluate(&ctx).unwrap();
            assert_eq!(got, want, "{text}");
        }
    }

    #[test]
    fn precedence_and_unary_minus() {
        let ctx = ExpressionContext::default();
        let e = CompiledExpression::parse("calc(1s + 2s * 3)").unwrap();
        assert_eq!(e.evaluate(&ctx).unwrap(), 7000.0);

        let e = CompiledExpression::parse("calc((1s + 2s) * 3)").unwrap();
        assert_eq!(e.evaluate(&ctx).unwrap(), 9000.0);

        let e = CompiledExpression::parse("calc(-500ms + 1s)").unwrap();
        assert_eq!(e.evaluate(&ctx).unwrap(), 500.0);
    }

    #[test]
    fn references_navigate_time_fields() {
        let ctx = ctx_with("ending", 8000.0, 11000.0);
        let e = CompiledExpression::parse("calc(url(#ending.time.start))").unwrap();
        assert_eq!(e.evaluate(&ctx).unwrap(), 8000.0);

        let e = CompiledExpression::parse("calc(url(#ending.time.duration) / 2)").unwrap();
        assert_eq!(e.evaluate(&ctx).unwrap(), 1500.0);

        assert_eq!(
            e.refs(),
            &[FieldRef {
                fragment_id: "ending".to_string(),
                path: vec!["time".to_string(), "duration".to_string()],
            }]
        );
    }

    #[test]
    fn expression_round_trip_is_linear() {
        // evaluate(parse("calc((x + y) * 2)")) == 2 * (x + y)
        let mut ctx = ExpressionContext::default();
        ctx.insert(
            "x",
            TimeData {
                start: 1200.0,
                end: 1700.0,
                duration: 500.0,
            },
        );
        ctx.insert(
            "y",
            TimeData {
                start: 300.0,
                end: 900.0,
                duration: 600.0,
            },
        );

        let combined =
            CompiledExpression::parse("calc((url(#x.time.start) + url(#y.time.start)) * 2)")
                .unwrap()
                .evaluate(&ctx)
                .unwrap();
        let x = CompiledExpression::parse("calc(url(#x.time.start))")
            .unwrap()
            .evaluate(&ctx)
            .unwrap();
        let y = CompiledExpression::parse("calc(url(#y.time.start))")
            .unwrap()
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(combined, 2.0 * (x + y));
    }

    #[test]
    fn unknown_fragment_and_path_are_distinct_eval_errors() {
        let ctx = ctx_with("a", 0.0, 1000.0);

        let e = CompiledExpression::parse("calc(url(#missing.time.start))").unwrap();
        assert!(!e.ready(&ctx));
        let err = e.evaluate(&ctx).unwrap_err();
        assert!(err.to_string().contains("unknown fragment id 'missing'"));

        let e = CompiledExpression::parse("calc(url(#a.time.middle))").unwrap();
        assert!(e.ready(&ctx));
        let err = e.evaluate(&ctx).unwrap_err();
        assert!(err.to_string().contains("unknown property path"));
    }

    #[test]
    fn division_by_zero_carries_source_text() {
        let ctx = ExpressionContext::default();
        let err = CompiledExpression::parse("calc(1s / 0)")
            .unwrap()
            .evaluate(&ctx)
            .unwrap_err();
        assert!(err.to_string().contains("calc(1s / 0)"));
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn parse_errors_name_the_offender() {
        assert!(CompiledExpression::parse("calc(1s +)").is_err());
        assert!(CompiledExpression::parse("calc(url(#x))").is_err());
        assert!(CompiledExpression::parse("calc(1s ^ 2)").is_err());
        assert!(CompiledExpression::parse("calc(1s").is_err());
    }
}
