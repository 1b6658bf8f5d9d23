//! In-memory representation of a validated tabular extract.

use std::borrow::Cow;
use std::fmt;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;

/// Date layouts accepted when a date arrives as text.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"];

/// Untyped scalar cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

static NULL: Value = Value::Null;

impl Value {
    /// Null, or text that is blank after trimming.
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Text rendering of a non-null scalar. Whole floats render without decimals
    /// so `42.0` and `"42"` produce the same key.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        if self.is_null() {
            return None;
        }
        match self {
            Self::Text(s) => Some(Cow::Borrowed(s.trim())),
            Self::Int(i) => Some(Cow::Owned(i.to_string())),
            Self::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => {
                Some(Cow::Owned(format!("{}", *f as i64)))
            }
            Self::Float(f) => Some(Cow::Owned(f.to_string())),
            Self::Bool(b) => Some(Cow::Owned(b.to_string())),
            Self::Date(d) => Some(Cow::Owned(d.format("%Y-%m-%d").to_string())),
            Self::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => {
                let t = s.trim();
                t.parse::<i64>().ok().or_else(|| {
                    t.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) if !f.is_nan() => Some(*f),
            Self::Text(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(1) => Some(true),
            Self::Int(0) => Some(false),
            Self::Text(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "t" | "si" | "sí" | "s" | "yes" | "y" => Some(true),
                "0" | "false" | "f" | "no" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Text(s) => parse_date(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Self::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Parse a date cell; accepts ISO dates, day-first dates and a trailing time part.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let date_part = trimmed
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(trimmed);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

/// One record of the input batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    cells: IndexMap<String, Value>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell value; a missing column reads as null.
    pub fn get(&self, column: &str) -> &Value {
        self.cells.get(column).unwrap_or(&NULL)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.cells.insert(column.into(), value.into());
    }

    /// Builder-style `set`.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Non-null text for a column.
    pub fn text(&self, column: &str) -> Option<Cow<'_, str>> {
        self.get(column).as_text()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            cells: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Natural key of a row read from `column`: trimmed, non-empty text.
pub fn natural_key(row: &RawRow, column: &str) -> Option<String> {
    row.text(column).map(|k| k.into_owned())
}

/// A validated batch, in source order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    rows: Vec<RawRow>,
}

impl Batch {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }

    /// Build from a header plus text records; empty cells become null.
    pub fn from_records<H, R, C>(headers: &[H], records: R) -> Self
    where
        H: AsRef<str>,
        R: IntoIterator<Item = Vec<C>>,
        C: AsRef<str>,
    {
        let rows = records
            .into_iter()
            .map(|record| {
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, cell)| {
                        let cell = cell.as_ref().trim();
                        let value = if cell.is_empty() {
                            Value::Null
                        } else {
                            Value::Text(cell.to_string())
                        };
                        (h.as_ref().to_string(), value)
                    })
                    .collect::<RawRow>()
            })
            .collect();
        Self { rows }
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<RawRow>> for Batch {
    fn from(rows: Vec<RawRow>) -> Self {
        Self::new(rows)
    }
}
