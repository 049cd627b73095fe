//! Table schema model
//!
//! Canonical, backend-independent description of a bucket: an ordered list
//! of typed fields, an optional primary key and the strings that stand for a
//! missing value. Also holds the canonical cell type and the per-field
//! casting rules used when rows are read back from the DataStore.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::storage::{StorageError, StorageResult};

/// Canonical field types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Time,
    Datetime,
    Duration,
    Object,
    Array,
    Year,
    Geojson,
}

impl FieldType {
    /// Every canonical type, in declaration order
    pub const ALL: [FieldType; 12] = [
        FieldType::String,
        FieldType::Integer,
        FieldType::Number,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Time,
        FieldType::Datetime,
        FieldType::Duration,
        FieldType::Object,
        FieldType::Array,
        FieldType::Year,
        FieldType::Geojson,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Datetime => "datetime",
            FieldType::Duration => "duration",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Year => "year",
            FieldType::Geojson => "geojson",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single column of a schema descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Primary key: one field name or an ordered list of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// Field names making up the key, in order
    pub fn names(&self) -> Vec<&str> {
        match self {
            PrimaryKey::Single(name) => vec![name.as_str()],
            PrimaryKey::Composite(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Schema descriptor for a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKey>,
    #[serde(
        default = "default_missing_values",
        skip_serializing_if = "is_default_missing_values"
    )]
    pub missing_values: Vec<String>,
}

fn default_missing_values() -> Vec<String> {
    vec![String::new()]
}

fn is_default_missing_values(values: &[String]) -> bool {
    values.len() == 1 && values[0].is_empty()
}

impl Descriptor {
    /// Create a descriptor from fields, with no primary key
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            primary_key: None,
            missing_values: default_missing_values(),
        }
    }

    /// Set the primary key
    pub fn with_primary_key(mut self, key: PrimaryKey) -> Self {
        self.primary_key = Some(key);
        self
    }

    /// Parse and validate a descriptor from arbitrary JSON
    pub fn from_json(value: Json) -> StorageResult<Self> {
        let descriptor: Descriptor = serde_json::from_value(value)
            .map_err(|e| StorageError::invalid_schema(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the descriptor against the canonical schema rules
    pub fn validate(&self) -> StorageResult<()> {
        if self.fields.is_empty() {
            return Err(StorageError::invalid_schema("descriptor has no fields"));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(StorageError::invalid_schema("field with an empty name"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(StorageError::invalid_schema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }

        if let Some(ref key) = self.primary_key {
            for name in key.names() {
                if !seen.contains(name) {
                    return Err(StorageError::invalid_schema(format!(
                        "primary key refers to unknown field '{}'",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up a field by name
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// A canonical, typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    String(String),
    Integer(i64),
    /// Exact decimal, as DataStore `numeric` columns hold
    Number(Decimal),
    Boolean(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    /// ISO 8601 duration, kept verbatim
    Duration(String),
    Object(Map<String, Json>),
    Array(Vec<Json>),
    Year(i32),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Render the cell back to wire-compatible JSON
    pub fn to_json(&self) -> Json {
        match self {
            Cell::Null => Json::Null,
            Cell::String(s) | Cell::Duration(s) => Json::String(s.clone()),
            Cell::Integer(i) => Json::from(*i),
            Cell::Number(d) => decimal_to_json(d),
            Cell::Boolean(b) => Json::Bool(*b),
            Cell::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Cell::Time(t) => Json::String(t.format("%H:%M:%S%.f").to_string()),
            Cell::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Cell::Object(map) => Json::Object(map.clone()),
            Cell::Array(items) => Json::Array(items.clone()),
            Cell::Year(y) => Json::from(*y),
        }
    }
}

/// Integers stay integers; fractions become JSON numbers only when that
/// keeps every digit, otherwise the decimal text is sent as a string
fn decimal_to_json(d: &Decimal) -> Json {
    let d = d.normalize();
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return Json::from(i);
        }
    }

    let text = d.to_string();
    match d.to_f64().and_then(serde_json::Number::from_f64) {
        Some(n) if n.to_string() == text => Json::Number(n),
        _ => Json::String(text),
    }
}

fn parse_decimal(s: &str) -> Result<Decimal, String> {
    s.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| "not a number".to_string())
}

/// A canonical row, keyed by field name
pub type Row = BTreeMap<String, Cell>;

const TRUE_VALUES: &[&str] = &["true", "True", "TRUE", "1"];
const FALSE_VALUES: &[&str] = &["false", "False", "FALSE", "0"];

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d %B %Y", "%B %d, %Y"];
const TIME_LAYOUTS: &[&str] = &["%H:%M:%S%.f", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];
const DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// How a temporal `format` should be interpreted
enum Pattern<'a> {
    Default,
    Any,
    Custom(&'a str),
}

impl<'a> Pattern<'a> {
    fn of(format: Option<&'a str>) -> Self {
        match format {
            None | Some("default") => Pattern::Default,
            Some("any") => Pattern::Any,
            Some(f) => Pattern::Custom(f.strip_prefix("fmt:").unwrap_or(f)),
        }
    }
}

/// Parse a datetime in any of the layouts the DataStore or users produce
///
/// Offsets are normalized to UTC; date-only input lands on midnight.
pub fn parse_datetime_any(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl Field {
    /// Create a field without a format
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            format: None,
        }
    }

    /// Set the field format
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Cast a wire value into the field's canonical type
    ///
    /// Strings listed in `missing_values` read as null for every type.
    pub fn cast_value(&self, value: &Json, missing_values: &[String]) -> StorageResult<Cell> {
        match value {
            Json::Null => return Ok(Cell::Null),
            Json::String(s) if missing_values.iter().any(|m| m == s) => return Ok(Cell::Null),
            _ => {}
        }

        self.cast_present(value)
            .map_err(|reason| StorageError::cast(&self.name, value, reason))
    }

    fn cast_present(&self, value: &Json) -> Result<Cell, String> {
        let pattern = Pattern::of(self.format.as_deref());
        match self.field_type {
            FieldType::String => {
                let s = expect_str(value)?;
                if self.format.as_deref() == Some("uuid") {
                    Uuid::parse_str(s).map_err(|e| format!("not a uuid: {}", e))?;
                }
                Ok(Cell::String(s.to_string()))
            }
            FieldType::Integer => cast_integer(value).map(Cell::Integer),
            FieldType::Number => match value {
                Json::Number(n) => parse_decimal(&n.to_string()).map(Cell::Number),
                Json::String(s) => parse_decimal(s.trim()).map(Cell::Number),
                _ => Err("not a number".to_string()),
            },
            FieldType::Boolean => match value {
                Json::Bool(b) => Ok(Cell::Boolean(*b)),
                Json::String(s) if TRUE_VALUES.contains(&s.as_str()) => Ok(Cell::Boolean(true)),
                Json::String(s) if FALSE_VALUES.contains(&s.as_str()) => Ok(Cell::Boolean(false)),
                _ => Err("not a boolean".to_string()),
            },
            FieldType::Date => {
                let s = expect_str(value)?;
                let parsed = match pattern {
                    Pattern::Default => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
                    Pattern::Any => DATE_LAYOUTS
                        .iter()
                        .find_map(|layout| NaiveDate::parse_from_str(s, layout).ok())
                        .or_else(|| parse_datetime_any(s).map(|dt| dt.date())),
                    Pattern::Custom(layout) => NaiveDate::parse_from_str(s, layout).ok(),
                };
                parsed
                    .map(Cell::Date)
                    .ok_or_else(|| "not a date".to_string())
            }
            FieldType::Time => {
                let s = expect_str(value)?;
                let parsed = match pattern {
                    Pattern::Default => NaiveTime::parse_from_str(s, "%H:%M:%S").ok(),
                    Pattern::Any => TIME_LAYOUTS
                        .iter()
                        .find_map(|layout| NaiveTime::parse_from_str(s, layout).ok())
                        .or_else(|| parse_datetime_any(s).map(|dt| dt.time())),
                    Pattern::Custom(layout) => NaiveTime::parse_from_str(s, layout).ok(),
                };
                parsed
                    .map(Cell::Time)
                    .ok_or_else(|| "not a time".to_string())
            }
            FieldType::Datetime => {
                let s = expect_str(value)?;
                let parsed = match pattern {
                    Pattern::Default => DateTime::parse_from_rfc3339(s)
                        .map(|dt| dt.naive_utc())
                        .ok()
                        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok()),
                    Pattern::Any => parse_datetime_any(s),
                    Pattern::Custom(layout) => NaiveDateTime::parse_from_str(s, layout).ok(),
                };
                parsed
                    .map(Cell::DateTime)
                    .ok_or_else(|| "not a datetime".to_string())
            }
            FieldType::Duration => {
                let s = expect_str(value)?;
                if s.len() > 1 && s.starts_with('P') {
                    Ok(Cell::Duration(s.to_string()))
                } else {
                    Err("not an ISO 8601 duration".to_string())
                }
            }
            FieldType::Object => cast_object(value).map(Cell::Object),
            FieldType::Geojson => {
                let map = cast_object(value)?;
                match map.get("type") {
                    Some(Json::String(_)) => Ok(Cell::Object(map)),
                    _ => Err("geojson object lacks a 'type' member".to_string()),
                }
            }
            FieldType::Array => match structured(value)? {
                Json::Array(items) => Ok(Cell::Array(items)),
                _ => Err("not an array".to_string()),
            },
            FieldType::Year => {
                let year = cast_integer(value)?;
                i32::try_from(year)
                    .map(Cell::Year)
                    .map_err(|_| "year out of range".to_string())
            }
        }
    }
}

fn expect_str(value: &Json) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", value))
}

fn cast_integer(value: &Json) -> Result<i64, String> {
    match value {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                _ => Err("not an integer".to_string()),
            }
        }
        Json::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| "not an integer".to_string()),
        _ => Err("not an integer".to_string()),
    }
}

/// Structured JSON from either a nested value or a string holding one
fn structured(value: &Json) -> Result<Json, String> {
    match value {
        Json::String(s) => serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e)),
        other => Ok(other.clone()),
    }
}

fn cast_object(value: &Json) -> Result<Map<String, Json>, String> {
    match structured(value)? {
        Json::Object(map) => Ok(map),
        _ => Err("not an object".to_string()),
    }
}
