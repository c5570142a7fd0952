//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= Conjunction ( '||' Conjunction )*
//! Conjunction    ::= Clause ( '&&' Clause )*
//! Clause         ::= 'true' | 'false' | '!'? Key | Key Operator Literal
//! Key            ::= ('steps' | 'vars') ( '.' identifier )+
//! Operator       ::= '=' | '!='
//! Literal        ::= QuotedString | BareWord | Integer | Boolean
//! ```
//!
//! A key that does not resolve makes its clause false, whatever the operator.

use cairn_types::{CairnError, Result};

/// A parsed condition: a disjunction of conjunctions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub any_of: Vec<Vec<Clause>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Literal(bool),
    Truthy {
        key: String,
        negated: bool,
    },
    Compare {
        key: String,
        operator: Operator,
        value: String,
    },
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// An empty or whitespace-only input produces an expression with no
/// alternatives, which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { any_of: Vec::new() });
    }

    let mut any_of = Vec::new();
    for alternative in split_outside_quotes(trimmed, "||") {
        let mut clauses = Vec::new();
        for part in split_outside_quotes(alternative, "&&") {
            clauses.push(parse_clause(part)?);
        }
        any_of.push(clauses);
    }
    Ok(ConditionExpr { any_of })
}

fn parse_clause(input: &str) -> Result<Clause> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }
    match input {
        "true" => return Ok(Clause::Literal(true)),
        "false" => return Ok(Clause::Literal(false)),
        _ => {}
    }

    let Some((key_end, operator, op_len)) = find_operator(input) else {
        let (negated, key) = match input.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, input),
        };
        validate_key(key)?;
        return Ok(Clause::Truthy {
            key: key.to_string(),
            negated,
        });
    };

    let key = input[..key_end].trim();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    validate_key(key)?;

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause::Compare {
        key: key.to_string(),
        operator,
        value: strip_quotes(raw_value),
    })
}

fn validate_key(key: &str) -> Result<()> {
    let mut segments = key.split('.');
    match segments.next() {
        Some("steps") | Some("vars") => {}
        _ => {
            return Err(make_error(&format!(
                "key '{key}' must start with 'steps.' or 'vars.'"
            )))
        }
    }
    let mut rest = 0;
    for seg in segments {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
        rest += 1;
    }
    if rest == 0 {
        return Err(make_error(&format!("key '{key}' names no step or variable")));
    }
    Ok(())
}

/// Scan for `!=` or `=`, skipping quoted regions.
fn find_operator(input: &str) -> Option<(usize, Operator, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Some((i, Operator::NotEq, 2));
            }
            b'=' => return Some((i, Operator::Eq, 1)),
            _ => i += 1,
        }
    }
    None
}

fn split_outside_quotes<'a>(input: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = input.as_bytes();
    let sep = separator.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        match quote {
            Some(q) if bytes[i] == q => quote = None,
            Some(_) => {}
            None if bytes[i] == b'"' || bytes[i] == b'\'' => quote = Some(bytes[i]),
            None if bytes[i..].starts_with(sep) => {
                parts.push(&input[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> CairnError {
    CairnError::ConditionParse(msg.to_string())
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Compare a resolved value with a literal from the expression text.
fn literal_matches(actual: &serde_json::Value, literal: &str) -> bool {
    match actual {
        serde_json::Value::String(s) => s == literal,
        other => match serde_json::from_str::<serde_json::Value>(literal) {
            Ok(parsed) => *other == parsed || other.to_string() == literal,
            Err(_) => other.to_string() == literal,
        },
    }
}

impl Clause {
    fn evaluate(&self, resolve: &dyn Fn(&str) -> Option<serde_json::Value>) -> bool {
        match self {
            Clause::Literal(b) => *b,
            Clause::Truthy { key, negated } => match resolve(key) {
                Some(value) => is_truthy(&value) != *negated,
                None => false,
            },
            Clause::Compare {
                key,
                operator,
                value,
            } => match resolve(key) {
                Some(actual) => {
                    let equal = literal_matches(&actual, value);
                    match operator {
                        Operator::Eq => equal,
                        Operator::NotEq => !equal,
                    }
                }
                None => false,
            },
        }
    }
}

/// Evaluate a condition expression against values provided by a resolver function.
///
/// `resolve` returns `None` for keys that are not defined; such clauses are false.
/// An expression with no alternatives (from an empty input) evaluates to `true`.
pub fn evaluate_condition(
    expr: &ConditionExpr,
    resolve: &dyn Fn(&str) -> Option<serde_json::Value>,
) -> bool {
    if expr.any_of.is_empty() {
        return true;
    }
    expr.any_of
        .iter()
        .any(|clauses| clauses.iter().all(|clause| clause.evaluate(resolve)))
}
