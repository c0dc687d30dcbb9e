use std::fmt::{self, Write as _};

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Lua number. Integers and floats are kept apart so large integers survive a
/// round trip unchanged.
#[derive(Clone, Copy, Debug)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Returns the value as an integer when it has an exact integer
    /// representation (`3.0` qualifies, `3.5` does not).
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Number::Integer(v) => Some(v),
            Number::Float(v) => float_to_integer(v),
        }
    }

    pub(crate) fn negate(self) -> Self {
        match self {
            Number::Integer(v) => Number::Integer(v.wrapping_neg()),
            Number::Float(v) => Number::Float(-v),
        }
    }
}

fn float_to_integer(v: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything in [-2^63, 2^63) fits in i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if v.fract() == 0.0 && v >= -LIMIT && v < LIMIT {
        Some(v as i64)
    } else {
        None
    }
}

/// Lua compares integers and floats by mathematical value: `2 == 2.0`.
impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            (Number::Integer(i), Number::Float(f)) | (Number::Float(f), Number::Integer(i)) => {
                float_to_integer(f) == Some(i)
            }
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Number::Integer(v) => write!(f, "{v}"),
            Number::Float(v) if v.is_nan() => f.write_str("0/0"),
            Number::Float(v) if v == f64::INFINITY => f.write_str("math.huge"),
            Number::Float(v) if v == f64::NEG_INFINITY => f.write_str("-math.huge"),
            // `Debug` always keeps a fraction or exponent, so the text re-parses as a float.
            Number::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Integer(v)
    }
}

impl From<i32> for Number {
    fn from(v: i32) -> Self {
        Number::Integer(v.into())
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

/// A table key.
///
/// Floats with an integral value never appear here; they are normalised to
/// [`Key::Integer`] the same way Lua does (`t[1.0]` is `t[1]`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Integer(i64),
    String(String),
    Boolean(bool),
    /// Non-integral float key, stored as raw bits.
    Float(u64),
}

impl Key {
    /// Converts a reconstructed value into a key. Returns `None` for values Lua
    /// cannot (or this decoder will not) use as keys: `nil`, NaN, tables and
    /// placeholders.
    pub fn from_value(value: Value) -> Option<Key> {
        match value {
            Value::Boolean(b) => Some(Key::Boolean(b)),
            Value::String(s) => Some(Key::String(s)),
            Value::Number(Number::Integer(i)) => Some(Key::Integer(i)),
            Value::Number(Number::Float(f)) if f.is_nan() => None,
            Value::Number(Number::Float(f)) => Some(match float_to_integer(f) {
                Some(i) => Key::Integer(i),
                None => Key::Float(f.to_bits()),
            }),
            Value::Nil | Value::Table(_) | Value::Reference(_) | Value::Function => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Integer(i) => Value::Number(Number::Integer(*i)),
            Key::String(s) => Value::String(s.clone()),
            Key::Boolean(b) => Value::Boolean(*b),
            Key::Float(bits) => Value::Number(Number::Float(f64::from_bits(*bits))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    /// Plain (unbracketed, unquoted) rendering, used for JSON object keys and
    /// variable names.
    pub fn label(&self) -> String {
        match self {
            Key::Integer(i) => i.to_string(),
            Key::String(s) => s.clone(),
            Key::Boolean(b) => b.to_string(),
            Key::Float(bits) => Number::Float(f64::from_bits(*bits)).to_string(),
        }
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            Key::String(s) if is_plain_name(s) => out.push_str(s),
            Key::String(s) => {
                out.push('[');
                write_quoted(out, s);
                out.push(']');
            }
            other => {
                let _ = write!(out, "[{}]", other.to_value());
            }
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Integer(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

/// A Lua table as reconstructed from a constructor.
///
/// Iteration follows the order keys first appeared in the source text;
/// re-assigning a key replaces its value but keeps its original position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    entries: IndexMap<Key, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_int(&self, index: i64) -> Option<&Value> {
        self.entries.get(&Key::Integer(index))
    }

    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.entries.get(&Key::String(name.to_string()))
    }

    /// Assigns `value` to `key` with Lua semantics: assigning `nil` removes
    /// the entry. Returns the previous value, if any.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        if value.is_nil() {
            self.entries.shift_remove(&key)
        } else {
            self.entries.insert(key, value)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    /// Number of consecutive integer keys starting at 1 (the table's "array
    /// part" as a debugger would display it).
    pub fn sequence_len(&self) -> usize {
        let mut n = 0usize;
        while self.entries.contains_key(&Key::Integer(n as i64 + 1)) {
            n += 1;
        }
        n
    }

    /// Values stored under `1..=sequence_len()`, in index order.
    pub fn sequence(&self) -> impl Iterator<Item = &Value> {
        (1..=self.sequence_len() as i64).filter_map(move |i| self.get_int(i))
    }

    fn is_sequence(&self) -> bool {
        self.entries
            .keys()
            .enumerate()
            .all(|(idx, key)| *key == Key::Integer(idx as i64 + 1))
    }

    fn write_literal(&self, out: &mut String) {
        if self.entries.is_empty() {
            out.push_str("{}");
            return;
        }

        out.push('{');
        let mut next_position = 1i64;
        for (idx, (key, value)) in self.entries.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            if *key == Key::Integer(next_position) {
                next_position += 1;
            } else {
                key.write_literal(out);
                out.push_str(" = ");
            }
            value.write_literal(out);
        }
        out.push('}');
    }
}

impl FromIterator<(Key, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (key, value) in iter {
            table.insert(key, value);
        }
        table
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_literal(&mut out);
        f.write_str(&out)
    }
}

/// A reconstructed runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(Number),
    /// Lua strings are byte strings. Bytes that are not valid UTF-8 are
    /// replaced with U+FFFD, so such strings do not round-trip exactly.
    String(String),
    Table(Table),
    /// A table the serializer had already emitted elsewhere (a cycle or a
    /// shared reference), carried as the label of its `--[[ref ...]]` marker.
    Reference(String),
    /// Placeholder for a function value whose body was not serialized.
    Function,
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.as_number().and_then(Number::as_integer)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Reference(_) => "reference",
            Value::Function => "function",
        }
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            Value::Nil => out.push_str("nil"),
            Value::Boolean(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Number(n) => {
                let _ = write!(out, "{n}");
            }
            Value::String(s) => write_quoted(out, s),
            Value::Table(t) => t.write_literal(out),
            Value::Reference(label) if label.is_empty() => out.push_str("nil --[[ref]]"),
            Value::Reference(label) => {
                let _ = write!(out, "nil --[[ref {label}]]");
            }
            Value::Function => out.push_str("function() --[[..skipped..]] end"),
        }
    }
}

/// Renders the value back to literal text that [`crate::parse`] accepts.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_literal(&mut out);
        f.write_str(&out)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Integer(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(Number::Integer(v.into()))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<Number> for Value {
    fn from(v: Number) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Value::Table(v)
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Number::Integer(v) => serializer.serialize_i64(v),
            Number::Float(v) => serializer.serialize_f64(v),
        }
    }
}

/// Sequences serialize as arrays, every other table as a map keyed by
/// [`Key::label`].
impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.entries.is_empty() && self.is_sequence() {
            let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
            for value in self.entries.values() {
                seq.serialize_element(value)?;
            }
            return seq.end();
        }

        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(&key.label(), value)?;
        }
        map.end()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Table(t) => t.serialize(serializer),
            Value::Reference(label) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$ref", label)?;
                map.end()
            }
            Value::Function => serializer.serialize_str("function"),
        }
    }
}

pub(crate) const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

fn is_plain_name(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !KEYWORDS.contains(&s)
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Three digits so a following digit is never absorbed into the escape.
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\{:03}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
