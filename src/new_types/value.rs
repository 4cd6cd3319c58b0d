// (c) Roel Kluin, 2023, GPL v3

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Text written for an unassigned slot in a dense shard. Escaping keeps any
/// text value from ever rendering as this line.
pub const EMPTY_SLOT: &str = "\\N";

/// How values of a schema are decoded from their text form.
#[derive(Display, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Float,
    Text,
    Flag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Flag(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::Flag(_) => ValueType::Flag,
        }
    }
    /// Canonical single-line text form as stored in a shard.
    pub fn to_line(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Flag(b) => b.to_string(),
            Value::Text(s) => escape(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            v => write!(f, "{}", v.to_line()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Flag(b)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl ValueType {
    /// Decodes one stored line. Errors are plain messages; the caller knows
    /// which shard they came from.
    pub fn decode(&self, line: &str) -> Result<Value, String> {
        match self {
            ValueType::Int => i64::from_str(line)
                .map(Value::Int)
                .map_err(|e| format!("{:?} is not an Int: {}", line, e)),
            ValueType::Float => f64::from_str(line)
                .map(Value::Float)
                .map_err(|e| format!("{:?} is not a Float: {}", line, e)),
            ValueType::Flag => bool::from_str(line)
                .map(Value::Flag)
                .map_err(|e| format!("{:?} is not a Flag: {}", line, e)),
            ValueType::Text => unescape(line).map(Value::Text),
        }
    }
    /// Like `decode`, but the empty-slot sentinel decodes to `None`.
    pub fn decode_slot(&self, line: &str) -> Result<Option<Value>, String> {
        if line == EMPTY_SLOT {
            Ok(None)
        } else {
            self.decode(line).map(Some)
        }
    }
    /// Parses a command line argument into a value of this type. Unlike
    /// `decode`, text is taken literally.
    pub fn parse_arg(&self, arg: &str) -> Result<Value, String> {
        match self {
            ValueType::Text => Ok(Value::Text(arg.to_string())),
            t => t.decode(arg),
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" => Ok(ValueType::Int),
            "float" => Ok(ValueType::Float),
            "text" | "str" => Ok(ValueType::Text),
            "flag" | "bool" => Ok(ValueType::Flag),
            _ => Err(format!("unknown value type {:?}", s)),
        }
    }
}

pub(crate) fn slot_line(slot: &Option<Value>) -> String {
    slot.as_ref()
        .map(Value::to_line)
        .unwrap_or_else(|| EMPTY_SLOT.to_string())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            other => return Err(format!("bad escape \\{:?} in {:?}", other, s)),
        }
    }
    Ok(out)
}
