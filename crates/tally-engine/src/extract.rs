//! Value extraction
//!
//! Resolves a path expression against an event's data payload and coerces
//! the selected value to the scalar type an aggregation needs.
//!
//! Accepted path forms:
//! - `$.usage.bytes`, `$.items[0].qty`, `$['odd key'].v`
//! - bare `usage.bytes` (an implicit leading `$.`)

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tally_common::ExtractionError;

/// One step of a value path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl ValuePath {
    pub fn parse(raw: &str) -> Result<Self, ExtractionError> {
        let invalid = |reason: String| ExtractionError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        let (bare, body) = match trimmed.strip_prefix('$') {
            Some(rest) => (false, rest),
            None => (true, trimmed),
        };
        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        if bare {
            let name = read_name(&chars, &mut i);
            if name.is_empty() {
                return Err(invalid("expected a field name".into()));
            }
            segments.push(PathSegment::Field(name));
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let name = read_name(&chars, &mut i);
                    if name.is_empty() {
                        return Err(invalid(format!("expected a field name at offset {}", i)));
                    }
                    segments.push(PathSegment::Field(name));
                }
                '[' => {
                    i += 1;
                    match chars.get(i).copied() {
                        Some(quote @ ('\'' | '"')) => {
                            i += 1;
                            let start = i;
                            while i < chars.len() && chars[i] != quote {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(invalid("unterminated quoted field".into()));
                            }
                            segments.push(PathSegment::Field(chars[start..i].iter().collect()));
                            i += 1;
                        }
                        _ => {
                            let start = i;
                            while i < chars.len() && chars[i] != ']' {
                                i += 1;
                            }
                            let digits: String = chars[start..i].iter().collect();
                            let index = digits.trim().parse::<usize>().map_err(|_| {
                                invalid(format!("'{}' is not a valid array index", digits))
                            })?;
                            segments.push(PathSegment::Index(index));
                        }
                    }
                    if chars.get(i) != Some(&']') {
                        return Err(invalid("expected ']'".into()));
                    }
                    i += 1;
                }
                other => {
                    return Err(invalid(format!("unexpected character '{}'", other)));
                }
            }
        }

        if segments.is_empty() {
            return Err(invalid("path selects no field".into()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Walk the payload and return the selected value
    pub fn resolve<'a>(&self, data: &'a Map<String, Value>) -> Result<&'a Value, ExtractionError> {
        let not_found = || ExtractionError::PathNotFound(self.raw.clone());

        let mut segments = self.segments.iter();
        let mut current = match segments.next() {
            Some(PathSegment::Field(name)) => data.get(name).ok_or_else(not_found)?,
            _ => return Err(not_found()),
        };

        for segment in segments {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => map.get(name),
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
                _ => None,
            }
            .ok_or_else(not_found)?;
        }

        Ok(current)
    }

    /// Resolve and coerce to a number; numeric strings are accepted
    pub fn number(&self, data: &Map<String, Value>) -> Result<f64, ExtractionError> {
        let value = self.resolve(data)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        };
        parsed.ok_or_else(|| self.mismatch("number", value))
    }

    /// Resolve and coerce to text; numbers and booleans are rendered
    pub fn text(&self, data: &Map<String, Value>) -> Result<String, ExtractionError> {
        match self.resolve(data)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(self.mismatch("string", other)),
        }
    }

    fn mismatch(&self, expected: &'static str, found: &Value) -> ExtractionError {
        ExtractionError::TypeMismatch {
            path: self.raw.clone(),
            expected,
            found: kind_of(found).to_string(),
        }
    }
}

impl FromStr for ValuePath {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn read_name(chars: &[char], i: &mut usize) -> String {
    let mut name = String::new();
    while *i < chars.len() && !matches!(chars[*i], '.' | '[' | ']') {
        name.push(chars[*i]);
        *i += 1;
    }
    name
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse `path` and extract a number from `data`
pub fn extract_number(data: &Map<String, Value>, path: &str) -> Result<f64, ExtractionError> {
    ValuePath::parse(path)?.number(data)
}

/// Parse `path` and extract text from `data`
pub fn extract_text(data: &Map<String, Value>, path: &str) -> Result<String, ExtractionError> {
    ValuePath::parse(path)?.text(data)
}
