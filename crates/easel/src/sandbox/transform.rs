//! Pure row transforms: `filter`, `pick`, `sort`, `map`, `unique`, `group`.
//!
//! Rows are JSON values, normally objects. Field names may be dotted paths
//! into nested objects (`"address.city"`).

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::{Map, Value};

use super::CapabilityError;

/// Look up a dotted path in a row. Missing fields read as `null`.
fn field<'a>(row: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(row, |value, key| value.get(key))
        .unwrap_or(&Value::Null)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering used by comparisons and `sort`: numeric when both sides are
/// numeric, otherwise by string form. `None` for incomparable values.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(text(left).cmp(&text(right))),
        },
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ==================== filter ====================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(f64),
    Op(&'static str),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CapabilityError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' || c == '\'' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            while let Some((_, ch)) = chars.next() {
                match ch {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            s.push(escaped);
                        }
                    }
                    ch if ch == c => {
                        closed = true;
                        break;
                    }
                    ch => s.push(ch),
                }
            }
            if !closed {
                return Err(invalid_filter(expr, "unterminated string"));
            }
            tokens.push(Token::Str(s));
            continue;
        }

        let rest = &expr[i..];
        if let Some(op) = ["==", "!=", ">=", "<=", "&&", "||", ">", "<"]
            .into_iter()
            .find(|op| rest.starts_with(op))
        {
            for _ in 0..op.len() {
                chars.next();
            }
            tokens.push(Token::Op(op));
            continue;
        }

        if is_word_char(c) {
            let mut word = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if !is_word_char(ch) {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            let numeric = word.starts_with(|ch: char| ch.is_ascii_digit() || ch == '-' || ch == '.');
            tokens.push(match word.parse::<f64>() {
                Ok(n) if numeric && n.is_finite() => Token::Num(n),
                _ => Token::Word(word),
            });
            continue;
        }

        return Err(invalid_filter(expr, &format!("unexpected character {c:?}")));
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '$' | ':')
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
struct Comparison {
    field: String,
    op: CmpOp,
    literal: Value,
}

impl Comparison {
    fn matches(&self, row: &Value) -> bool {
        let value = field(row, &self.field);
        match self.op {
            CmpOp::Eq => compare(value, &self.literal) == Some(Ordering::Equal),
            CmpOp::Ne => compare(value, &self.literal) != Some(Ordering::Equal),
            CmpOp::Gt => compare(value, &self.literal) == Some(Ordering::Greater),
            CmpOp::Ge => matches!(
                compare(value, &self.literal),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CmpOp::Lt => compare(value, &self.literal) == Some(Ordering::Less),
            CmpOp::Le => matches!(
                compare(value, &self.literal),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CmpOp::Contains => match value {
                Value::Array(items) => items
                    .iter()
                    .any(|item| compare(item, &self.literal) == Some(Ordering::Equal)),
                Value::Null => false,
                other => text(other).contains(&text(&self.literal)),
            },
            CmpOp::StartsWith => {
                !value.is_null() && text(value).starts_with(&text(&self.literal))
            }
            CmpOp::EndsWith => !value.is_null() && text(value).ends_with(&text(&self.literal)),
        }
    }
}

/// Disjunction of conjunctions; `&&` binds tighter than `||`.
#[derive(Debug, Clone)]
struct FilterExpr {
    any_of: Vec<Vec<Comparison>>,
}

impl FilterExpr {
    fn parse(expr: &str) -> Result<Self, CapabilityError> {
        let tokens = tokenize(expr)?;
        let mut tokens = tokens.into_iter();
        let mut any_of = vec![Vec::new()];

        loop {
            let comparison = parse_comparison(expr, &mut tokens)?;
            if let Some(group) = any_of.last_mut() {
                group.push(comparison);
            }

            match tokens.next() {
                None => break,
                Some(Token::Op("&&")) => {}
                Some(Token::Op("||")) => any_of.push(Vec::new()),
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("and") => {}
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("or") => any_of.push(Vec::new()),
                Some(other) => {
                    return Err(invalid_filter(
                        expr,
                        &format!("expected && or || but found {other:?}"),
                    ));
                }
            }
        }

        Ok(Self { any_of })
    }

    fn matches(&self, row: &Value) -> bool {
        self.any_of
            .iter()
            .any(|all| all.iter().all(|c| c.matches(row)))
    }
}

fn parse_comparison(
    expr: &str,
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<Comparison, CapabilityError> {
    let field = match tokens.next() {
        Some(Token::Word(w)) => w,
        Some(Token::Str(s)) => s,
        other => {
            return Err(invalid_filter(
                expr,
                &format!("expected a field name, found {other:?}"),
            ));
        }
    };

    let op = match tokens.next() {
        Some(Token::Op("==")) => CmpOp::Eq,
        Some(Token::Op("!=")) => CmpOp::Ne,
        Some(Token::Op(">")) => CmpOp::Gt,
        Some(Token::Op(">=")) => CmpOp::Ge,
        Some(Token::Op("<")) => CmpOp::Lt,
        Some(Token::Op("<=")) => CmpOp::Le,
        Some(Token::Word(w)) if w == "contains" => CmpOp::Contains,
        Some(Token::Word(w)) if w == "startsWith" => CmpOp::StartsWith,
        Some(Token::Word(w)) if w == "endsWith" => CmpOp::EndsWith,
        other => {
            return Err(invalid_filter(
                expr,
                &format!("expected an operator after {field:?}, found {other:?}"),
            ));
        }
    };

    let literal = match tokens.next() {
        Some(Token::Str(s)) => Value::String(s),
        Some(Token::Num(n)) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Token::Word(w)) => match w.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => Value::String(w),
        },
        other => {
            return Err(invalid_filter(
                expr,
                &format!("expected a value after the operator, found {other:?}"),
            ));
        }
    };

    Ok(Comparison { field, op, literal })
}

fn invalid_filter(expr: &str, reason: &str) -> CapabilityError {
    CapabilityError::InvalidArgument(format!("invalid filter {expr:?}: {reason}"))
}

/// Rows for which `expr` holds.
pub fn filter(rows: &[Value], expr: &str) -> Result<Vec<Value>, CapabilityError> {
    let expr = FilterExpr::parse(expr)?;
    Ok(rows.iter().filter(|row| expr.matches(row)).cloned().collect())
}

// ==================== reshaping ====================

/// Keep only `fields` in each row.
pub fn pick(rows: &[Value], fields: &[String]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let picked: Map<String, Value> = fields
                .iter()
                .filter_map(|f| {
                    let value = field(row, f);
                    (!value.is_null() || row.get(f).is_some()).then(|| (f.clone(), value.clone()))
                })
                .collect();
            Value::Object(picked)
        })
        .collect()
}

/// Stable sort by `field`; `null`s sort last in either direction.
pub fn sort(rows: &[Value], field_name: &str, direction: &str) -> Result<Vec<Value>, CapabilityError> {
    let descending = match direction.to_ascii_lowercase().as_str() {
        "asc" | "" => false,
        "desc" => true,
        other => {
            return Err(CapabilityError::InvalidArgument(format!(
                "sort direction must be \"asc\" or \"desc\", got {other:?}"
            )));
        }
    };

    let mut sorted = rows.to_vec();
    sorted.sort_by(|a, b| {
        let (a, b) = (field(a, field_name), field(b, field_name));
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = compare(a, b).unwrap_or(Ordering::Equal);
                if descending { ord.reverse() } else { ord }
            }
        }
    });
    Ok(sorted)
}

/// Build new rows from `{newName: "old.path"}`.
pub fn map(rows: &[Value], mapping: &Map<String, Value>) -> Result<Vec<Value>, CapabilityError> {
    let mapping = mapping
        .iter()
        .map(|(to, from)| match from {
            Value::String(from) => Ok((to.clone(), from.clone())),
            other => Err(CapabilityError::InvalidArgument(format!(
                "map source for {to:?} must be a field name, got {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .iter()
        .map(|row| {
            Value::Object(
                mapping
                    .iter()
                    .map(|(to, from)| (to.clone(), field(row, from).clone()))
                    .collect(),
            )
        })
        .collect())
}

/// Drop repeated rows, comparing `field` when given or the whole row.
pub fn unique(rows: &[Value], field_name: Option<&str>) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|row| {
            let key = match field_name {
                Some(f) => field(row, f).to_string(),
                None => row.to_string(),
            };
            seen.insert(key)
        })
        .cloned()
        .collect()
}

/// Bucket rows by the string form of `field`.
pub fn group(rows: &[Value], field_name: &str) -> Value {
    let mut groups: Map<String, Value> = Map::new();
    for row in rows {
        let key = match field(row, field_name) {
            Value::Null => "null".to_string(),
            other => text(other),
        };
        if let Value::Array(bucket) = groups
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            bucket.push(row.clone());
        }
    }
    Value::Object(groups)
}
