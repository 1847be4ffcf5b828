//! Model formulas.
//!
//! Formulas use the familiar mgcv right-hand-side notation, e.g.
//!
//! ```text
//! year + s(lon, lat, bs = "ts", k = k) + s(ship, bs = "re", by = dum)
//!      + s(depth, bs = "ts", k = 6) + offset(log(haul_dur))
//! ```
//!
//! Supported terms:
//!
//! - `name`: parametric term (factor → treatment contrasts, numeric → linear)
//! - `s(x, ...)`: penalised 1-D smooth; `s(x1, x2, ...)` / `te(x1, x2, ...)`: tensor smooth
//! - `s(f, bs = "re")`: random effect of a factor
//! - `offset(x)` / `offset(log(x))`
//!
//! Integer arguments (`k`) may be literals or names. Names are resolved only
//! through the bindings passed to [`Formula::parse`]; there is no implicit
//! lookup of anything else.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SurveyIndexError};

/// Default basis dimension of 1-D smooths.
pub const DEFAULT_K_1D: usize = 10;
/// Default basis dimension of 2-D smooths.
pub const DEFAULT_K_2D: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothBasis {
    /// P-spline with a difference penalty.
    PSpline,
    /// P-spline whose penalty also shrinks the unpenalised null space.
    Shrinkage,
    /// Identity-penalised factor coefficients.
    RandomEffect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Parametric {
        name: String,
    },
    Smooth {
        vars: Vec<String>,
        k: usize,
        basis: SmoothBasis,
        by: Option<String>,
    },
    Offset {
        name: String,
        log: bool,
    },
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Parametric { name } => write!(f, "{name}"),
            Term::Smooth { vars, by, .. } => {
                write!(f, "s({})", vars.join(","))?;
                if let Some(by) = by {
                    write!(f, ":{by}")?;
                }
                Ok(())
            }
            Term::Offset { name, log: true } => write!(f, "offset(log({name}))"),
            Term::Offset { name, log: false } => write!(f, "offset({name})"),
        }
    }
}

/// A parsed right-hand side. An intercept is always included.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub terms: Vec<Term>,
}

impl Formula {
    pub fn parse(text: &str, bindings: &BTreeMap<String, usize>) -> Result<Formula> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            bindings,
        };
        let formula = parser.formula()?;
        if parser.pos != parser.tokens.len() {
            return Err(err(format!(
                "unexpected `{}` in formula `{text}`",
                parser.tokens[parser.pos]
            )));
        }
        Ok(formula)
    }

    /// Every covariate name the formula reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for term in &self.terms {
            match term {
                Term::Parametric { name } | Term::Offset { name, .. } => out.push(name.as_str()),
                Term::Smooth { vars, by, .. } => {
                    out.extend(vars.iter().map(String::as_str));
                    if let Some(by) = by {
                        out.push(by.as_str());
                    }
                }
            }
        }
        out
    }
}

fn err(message: String) -> SurveyIndexError {
    SurveyIndexError::Formula(message)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(usize),
    Str(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Eq,
    Tilde,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Plus => write!(f, "+"),
            Token::Eq => write!(f, "="),
            Token::Tilde => write!(f, "~"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(err(format!("unterminated string in formula `{text}`")));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let value = digits
                    .parse::<usize>()
                    .map_err(|e| err(format!("invalid integer `{digits}`: {e}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(err(format!("unexpected character `{other}` in formula `{text}`")));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    bindings: &'a BTreeMap<String, usize>,
}

/// Argument value inside a call.
enum Value {
    Ident(String),
    Int(usize),
    Str(String),
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(err(format!("expected `{want}`, found `{t}`"))),
            None => Err(err(format!("expected `{want}`, found end of formula"))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            Some(t) => Err(err(format!("expected a name, found `{t}`"))),
            None => Err(err("expected a name, found end of formula".to_string())),
        }
    }

    fn formula(&mut self) -> Result<Formula> {
        if self.peek() == Some(&Token::Tilde) {
            self.pos += 1;
        }
        if self.peek().is_none() {
            return Err(err("empty formula".to_string()));
        }

        let mut terms = Vec::new();
        loop {
            if let Some(term) = self.term()? {
                terms.push(term);
            }
            match self.peek() {
                Some(Token::Plus) => self.pos += 1,
                _ => break,
            }
        }
        Ok(Formula { terms })
    }

    /// `None` for an explicit intercept (`1`).
    fn term(&mut self) -> Result<Option<Term>> {
        match self.next() {
            Some(Token::Int(1)) => Ok(None),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&name).map(Some)
                } else {
                    Ok(Some(Term::Parametric { name }))
                }
            }
            Some(t) => Err(err(format!("unexpected `{t}` at start of term"))),
            None => Err(err("formula ends with `+`".to_string())),
        }
    }

    fn call(&mut self, function: &str) -> Result<Term> {
        match function {
            "offset" => self.offset(),
            "s" | "te" => self.smooth(function == "te"),
            other => Err(err(format!("unsupported term function `{other}(...)`"))),
        }
    }

    fn offset(&mut self) -> Result<Term> {
        let first = self.ident()?;
        let term = if first == "log" && self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let name = self.ident()?;
            self.expect(Token::RParen)?;
            Term::Offset { name, log: true }
        } else {
            Term::Offset {
                name: first,
                log: false,
            }
        };
        self.expect(Token::RParen)?;
        Ok(term)
    }

    fn smooth(&mut self, tensor: bool) -> Result<Term> {
        let mut vars = Vec::new();
        let mut named: BTreeMap<String, Value> = BTreeMap::new();

        loop {
            let name = self.ident()?;
            if self.peek() == Some(&Token::Eq) {
                self.pos += 1;
                let value = self.value()?;
                named.insert(name, value);
            } else if named.is_empty() {
                vars.push(name);
            } else {
                return Err(err(format!(
                    "smooth variable `{name}` must come before named arguments"
                )));
            }

            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(t) => return Err(err(format!("expected `,` or `)`, found `{t}`"))),
                None => return Err(err("unclosed smooth term".to_string())),
            }
        }

        if vars.is_empty() || vars.len() > 2 {
            return Err(err(format!(
                "smooths take one or two variables, got {}",
                vars.len()
            )));
        }
        if tensor && vars.len() != 2 {
            return Err(err("te() needs exactly two variables".to_string()));
        }

        let mut basis = SmoothBasis::PSpline;
        let mut k = if vars.len() == 1 { DEFAULT_K_1D } else { DEFAULT_K_2D };
        let mut by = None;

        for (key, value) in named {
            match key.as_str() {
                "k" => k = self.resolve_int(value)?,
                "bs" => basis = parse_basis(value)?,
                "by" => match value {
                    Value::Ident(name) => by = Some(name),
                    _ => return Err(err("`by` must name a covariate".to_string())),
                },
                other => return Err(err(format!("unsupported smooth argument `{other}`"))),
            }
        }

        if basis == SmoothBasis::RandomEffect && vars.len() != 1 {
            return Err(err("random effects take exactly one factor".to_string()));
        }

        Ok(Term::Smooth {
            vars,
            k,
            basis,
            by,
        })
    }

    fn value(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Value::Int(v)),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            // `c("ts", "ts")`: per-margin settings; one shared basis is used.
            Some(Token::Ident(name)) if name == "c" && self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let first = self.value()?;
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    self.value()?;
                }
                self.expect(Token::RParen)?;
                Ok(first)
            }
            Some(Token::Ident(name)) => Ok(Value::Ident(name)),
            Some(t) => Err(err(format!("unexpected `{t}` as argument value"))),
            None => Err(err("missing argument value".to_string())),
        }
    }

    fn resolve_int(&self, value: Value) -> Result<usize> {
        match value {
            Value::Int(v) => Ok(v),
            Value::Ident(name) => self
                .bindings
                .get(&name)
                .copied()
                .ok_or_else(|| err(format!("`{name}` is not bound to a value"))),
            Value::Str(s) => Err(err(format!("expected an integer, found \"{s}\""))),
        }
    }
}

fn parse_basis(value: Value) -> Result<SmoothBasis> {
    let name = match value {
        Value::Str(s) | Value::Ident(s) => s,
        Value::Int(v) => return Err(err(format!("invalid basis `{v}`"))),
    };
    match name.as_str() {
        "tp" | "cr" | "ps" | "bs" => Ok(SmoothBasis::PSpline),
        "ts" | "cs" => Ok(SmoothBasis::Shrinkage),
        "re" => Ok(SmoothBasis::RandomEffect),
        other => Err(err(format!("unsupported basis `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> BTreeMap<String, usize> {
        BTreeMap::from([("k".to_string(), 40)])
    }

    #[test]
    fn parses_typical_survey_formula() {
        let f = Formula::parse(
            "year + s(lon, lat, bs = c('ts'), k = k) + s(ship, bs = 're', by = dum) \
             + s(depth, bs = 'ts', k = 6) + offset(log(haul_dur))",
            &bindings(),
        )
        .unwrap();

        assert_eq!(f.terms.len(), 5);
        assert_eq!(f.terms[0], Term::Parametric { name: "year".to_string() });
        assert_eq!(
            f.terms[1],
            Term::Smooth {
                vars: vec!["lon".to_string(), "lat".to_string()],
                k: 40,
                basis: SmoothBasis::Shrinkage,
                by: None,
            }
        );
        assert!(matches!(
            &f.terms[2],
            Term::Smooth { basis: SmoothBasis::RandomEffect, by: Some(by), .. } if by == "dum"
        ));
        assert!(matches!(&f.terms[3], Term::Smooth { k: 6, .. }));
        assert_eq!(
            f.terms[4],
            Term::Offset { name: "haul_dur".to_string(), log: true }
        );
        assert_eq!(
            f.variables(),
            vec!["year", "lon", "lat", "ship", "dum", "depth", "haul_dur"]
        );
    }

    #[test]
    fn leading_tilde_and_intercept_are_accepted() {
        let f = Formula::parse("~ 1 + year", &bindings()).unwrap();
        assert_eq!(f.terms, vec![Term::Parametric { name: "year".to_string() }]);
    }

    #[test]
    fn default_basis_dimensions() {
        let f = Formula::parse("s(depth) + te(lon, lat)", &bindings()).unwrap();
        assert!(matches!(&f.terms[0], Term::Smooth { k: DEFAULT_K_1D, .. }));
        assert!(matches!(&f.terms[1], Term::Smooth { k: DEFAULT_K_2D, .. }));
    }

    #[test]
    fn rejects_malformed_formulas() {
        let b = bindings();
        for bad in [
            "",
            "year +",
            "s(lon, lat, depth)",
            "te(lon)",
            "s(lon, k = kz)",
            "s(lon, bs = 'zz')",
            "s(k = 4, lon)",
            "poly(depth)",
            "year * gear",
            "s(lon",
            "offset(log(haul_dur)",
        ] {
            assert!(
                matches!(Formula::parse(bad, &b), Err(SurveyIndexError::Formula(_))),
                "accepted `{bad}`"
            );
        }
    }
}
