//! Expression matcher for targeting systems.
//!
//! Matcher expressions combine simple terms with `and`, `or`, `not`, and
//! parentheses (`and` binds tighter than `or`). The terms are:
//!
//! * a bare pattern: a shell glob matched against the system ID
//!   (`*.example.com`); `glob <pattern>` is the explicit form,
//! * `re <pattern>`: a regular expression that must match the whole system
//!   ID,
//! * `id <literal>`: an exact comparison against the system ID,
//! * `@<key> <op> <literal>` with `op` one of `==`, `!=`, `~=`: a
//!   comparison against the value stored in the system data under the
//!   compound key.
//!
//! Matching is case-insensitive by default. Appending `/s` to the keyword or
//! operator (`glob/s`, `re/s`, `id/s`, `==/s`, `!=/s`, `~=/s`) makes that
//! single term case sensitive.
//!
//! When the literal of an `==` or `!=` term is an IP network in `addr/len`
//! form and the referenced data value is an IP address, the comparison is a
//! subnet membership test instead of a string comparison.
//!
//! Literals containing whitespace, parentheses, or `@` must be wrapped in
//! single or double quotes; the wrapping quote and the backslash are escaped
//! with a backslash.
//!
//! An absent data key never satisfies `==` or `~=`; it does satisfy `!=`.

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

use std::net::IpAddr;

use glob::{MatchOptions, Pattern};
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::data::Value;

/// Error raised when a matcher expression cannot be parsed.
#[derive(Debug, Error)]
#[error("Error at index {position} in matcher expression: {message}")]
pub struct MatcherError {
    /// Byte position in the expression at which parsing failed.
    pub position: usize,
    /// Description of the problem.
    pub message: String,
}

impl MatcherError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// A compiled matcher expression.
///
/// Compiling is comparatively expensive; matchers are meant to be built once
/// and reused. Matchers are thread safe.
pub struct Matcher {
    expression: Expr,
    source: String,
}

impl Matcher {
    /// Compiles a matcher expression.
    ///
    /// # Errors
    ///
    /// Returns [`MatcherError`] if the expression is not well-formed.
    pub fn parse(expression: &str) -> Result<Self, MatcherError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(MatcherError::new(
                token.position,
                format!("expected 'and', 'or', or end of expression, found \"{}\"", token.text),
            ));
        }
        Ok(Self {
            expression: expr,
            source: expression.to_string(),
        })
    }

    /// Tells whether this matcher matches the given system ID and data.
    #[must_use]
    pub fn matches(&self, system_id: &str, data: &Value) -> bool {
        self.expression.evaluate(system_id, data)
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Matcher").field(&self.source).finish()
    }
}

enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IdGlob(Pattern, MatchOptions),
    IdRegex(Regex),
    IdLiteral { literal: String, case_sensitive: bool },
    Data { key: String, op: DataOp },
}

enum DataOp {
    Equals { literal: String, case_sensitive: bool, negated: bool },
    Subnet { net: IpNet, negated: bool },
    Regex(Regex),
}

impl Expr {
    fn evaluate(&self, system_id: &str, data: &Value) -> bool {
        match self {
            Self::And(left, right) => {
                left.evaluate(system_id, data) && right.evaluate(system_id, data)
            }
            Self::Or(left, right) => {
                left.evaluate(system_id, data) || right.evaluate(system_id, data)
            }
            Self::Not(inner) => !inner.evaluate(system_id, data),
            Self::IdGlob(pattern, options) => pattern.matches_with(system_id, *options),
            Self::IdRegex(regex) => regex.is_match(system_id),
            Self::IdLiteral {
                literal,
                case_sensitive,
            } => {
                if *case_sensitive {
                    system_id == literal
                } else {
                    system_id.eq_ignore_ascii_case(literal)
                }
            }
            Self::Data { key, op } => op.evaluate(data.lookup(key)),
        }
    }
}

impl DataOp {
    fn evaluate(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Equals {
                literal,
                case_sensitive,
                negated,
            } => {
                let equal = value.is_some_and(|value| {
                    let actual = value.to_plain_string();
                    if *case_sensitive {
                        actual == *literal
                    } else {
                        actual.eq_ignore_ascii_case(literal)
                    }
                });
                equal != *negated
            }
            Self::Subnet { net, negated } => {
                let contained = value
                    .and_then(|value| value.as_str()?.split('/').next()?.parse::<IpAddr>().ok())
                    .is_some_and(|addr| net.contains(&addr));
                contained != *negated
            }
            Self::Regex(regex) => {
                value.is_some_and(|value| regex.is_match(&value.to_plain_string()))
            }
        }
    }
}

struct Token {
    text: String,
    position: usize,
    quoted: bool,
}

fn tokenize(input: &str) -> Result<Vec<Token>, MatcherError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(position, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '(' || ch == ')' {
            chars.next();
            tokens.push(Token {
                text: ch.to_string(),
                position,
                quoted: false,
            });
        } else if ch == '"' || ch == '\'' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((escape_pos, c)) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some((_, escaped)) => text.push(escaped),
                        None => {
                            return Err(MatcherError::new(
                                escape_pos,
                                "dangling backslash in quoted literal",
                            ))
                        }
                    }
                } else if c == ch {
                    closed = true;
                    break;
                } else {
                    text.push(c);
                }
            }
            if !closed {
                return Err(MatcherError::new(position, "unterminated quoted literal"));
            }
            tokens.push(Token {
                text,
                position,
                quoted: true,
            });
        } else {
            let mut text = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() || c == '(' || c == ')' {
                    break;
                }
                text.push(c);
                chars.next();
            }
            tokens.push(Token {
                text,
                position,
                quoted: false,
            });
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn end_position(&self) -> usize {
        self.tokens
            .last()
            .map_or(0, |token| token.position + token.text.len())
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        self.peek()
            .is_some_and(|token| !token.quoted && token.text == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr, MatcherError> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, MatcherError> {
        let mut left = self.parse_unary()?;
        while self.is_keyword("and") {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, MatcherError> {
        if self.is_keyword("not") {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.is_keyword("(") {
            self.next();
            let inner = self.parse_or()?;
            if !self.is_keyword(")") {
                let position = self
                    .peek()
                    .map_or_else(|| self.end_position(), |token| token.position);
                return Err(MatcherError::new(position, "expected \")\""));
            }
            self.next();
            return Ok(inner);
        }
        self.parse_term()
    }

    fn parse_term(&mut self) -> Result<Expr, MatcherError> {
        let end = self.end_position();
        let Some(token) = self.next() else {
            return Err(MatcherError::new(end, "expected an expression"));
        };
        let position = token.position;
        let quoted = token.quoted;
        let text = token.text.clone();

        if !quoted {
            if let Some(case_sensitive) = keyword_flag(&text, "glob") {
                let literal = self.expect_literal(position)?;
                return glob_term(&literal, case_sensitive, position);
            }
            if let Some(case_sensitive) = keyword_flag(&text, "re") {
                let literal = self.expect_literal(position)?;
                let regex = build_regex(&literal, case_sensitive, position)?;
                return Ok(Expr::IdRegex(regex));
            }
            if let Some(case_sensitive) = keyword_flag(&text, "id") {
                let literal = self.expect_literal(position)?;
                return Ok(Expr::IdLiteral {
                    literal,
                    case_sensitive,
                });
            }
            if let Some(key) = text.strip_prefix('@') {
                if key.is_empty() {
                    return Err(MatcherError::new(position, "expected a key after \"@\""));
                }
                return self.parse_data_term(key.to_string(), position);
            }
            if matches!(text.as_str(), "and" | "or" | "not") {
                return Err(MatcherError::new(
                    position,
                    format!("found keyword \"{text}\" where a term was expected"),
                ));
            }
        }
        glob_term(&text, false, position)
    }

    fn parse_data_term(&mut self, key: String, position: usize) -> Result<Expr, MatcherError> {
        let end = self.end_position();
        let Some(op_token) = self.next() else {
            return Err(MatcherError::new(end, "expected an operator after the key"));
        };
        let op_position = op_token.position;
        let op_text = op_token.text.clone();
        let (op, case_sensitive) = match op_text.as_str() {
            "==" => ("==", false),
            "==/s" => ("==", true),
            "!=" => ("!=", false),
            "!=/s" => ("!=", true),
            "~=" => ("~=", false),
            "~=/s" => ("~=", true),
            other => {
                return Err(MatcherError::new(
                    op_position,
                    format!("expected \"==\", \"!=\", or \"~=\", found \"{other}\""),
                ))
            }
        };
        let literal = self.expect_literal(op_position)?;
        let op = match op {
            "~=" => DataOp::Regex(build_regex(&literal, case_sensitive, op_position)?),
            op => {
                let negated = op == "!=";
                // An IP network literal turns the comparison into a subnet
                // membership test.
                match literal.parse::<IpNet>() {
                    Ok(net) if literal.contains('/') => DataOp::Subnet { net, negated },
                    _ => DataOp::Equals {
                        literal,
                        case_sensitive,
                        negated,
                    },
                }
            }
        };
        Ok(Expr::Data { key, op })
    }

    fn expect_literal(&mut self, after: usize) -> Result<String, MatcherError> {
        let end = self.end_position();
        match self.next() {
            Some(token) if token.quoted || !matches!(token.text.as_str(), "(" | ")") => {
                Ok(token.text.clone())
            }
            Some(token) => Err(MatcherError::new(
                token.position,
                "expected a literal, found a parenthesis",
            )),
            None => Err(MatcherError::new(
                end.max(after),
                "expected a literal, found end of expression",
            )),
        }
    }
}

/// Recognizes a term keyword with an optional `/s` case-sensitivity flag.
fn keyword_flag(text: &str, keyword: &str) -> Option<bool> {
    if text == keyword {
        Some(false)
    } else if text.len() == keyword.len() + 2
        && text.starts_with(keyword)
        && text.ends_with("/s")
    {
        Some(true)
    } else {
        None
    }
}

fn glob_term(
    pattern: &str,
    case_sensitive: bool,
    position: usize,
) -> Result<Expr, MatcherError> {
    let compiled = Pattern::new(pattern)
        .map_err(|err| MatcherError::new(position, format!("invalid glob pattern: {err}")))?;
    let options = MatchOptions {
        case_sensitive,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    Ok(Expr::IdGlob(compiled, options))
}

fn build_regex(
    pattern: &str,
    case_sensitive: bool,
    position: usize,
) -> Result<Regex, MatcherError> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|err| MatcherError::new(position, format!("invalid regular expression: {err}")))
}
