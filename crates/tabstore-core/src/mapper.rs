//! DataStore type mapping
//!
//! Pure conversions between the canonical schema vocabulary and the
//! DataStore's PostgreSQL-flavoured column types, and between canonical
//! rows and DataStore records. Nothing here performs I/O.
//!
//! Remote type tokens follow a string convention rather than a type system:
//! a trailing width (`int4`, `float8`) names a sized variant of the base
//! type, and a leading `_` (or a trailing `[]`) marks an array column.
//! [`RemoteType::parse`] turns a token into a `(base, is_array)` pair before
//! any table lookup.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::warn;

use crate::schema::{parse_datetime_any, Cell, Descriptor, Field, FieldType, PrimaryKey, Row};
use crate::storage::StorageResult;

/// Field id the DataStore uses for its internal row identity
pub const INTERNAL_ID_FIELD: &str = "_id";

/// Leading marker PostgreSQL uses for array types
const ARRAY_MARKER: char = '_';

/// A DataStore record, keyed by field id
pub type Record = Map<String, Json>;

/// A field as reported by `datastore_search`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteField {
    pub id: String,
    #[serde(rename = "type")]
    pub remote_type: String,
}

impl RemoteField {
    pub fn new(id: impl Into<String>, remote_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_type: remote_type.into(),
        }
    }
}

/// A normalized remote type token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteType {
    /// Base token with width suffix and array marker removed
    pub base: String,
    pub is_array: bool,
}

impl RemoteType {
    /// Normalize a raw token: strip the width suffix, then detect the array marker
    pub fn parse(token: &str) -> Self {
        let lowered = token.trim().to_ascii_lowercase();
        let (base, is_array) = detect_array_marker(strip_numeric_suffix(&lowered));
        Self {
            base: base.to_string(),
            is_array,
        }
    }
}

/// Remove trailing decimal digits (`int4` -> `int`)
pub fn strip_numeric_suffix(token: &str) -> &str {
    token.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Split off an array marker (`_text` or `text[]`)
pub fn detect_array_marker(token: &str) -> (&str, bool) {
    if let Some(base) = token.strip_prefix(ARRAY_MARKER) {
        (base, true)
    } else if let Some(base) = token.strip_suffix("[]") {
        (base, true)
    } else {
        (token, false)
    }
}

/// Map a canonical type to the DataStore column type used on create
///
/// `None` means the DataStore should pick its own default.
pub fn canonical_to_remote(field_type: FieldType) -> Option<&'static str> {
    match field_type {
        FieldType::Number => Some("float"),
        FieldType::String => Some("text"),
        FieldType::Integer => Some("int"),
        FieldType::Boolean => Some("bool"),
        FieldType::Object => Some("json"),
        FieldType::Array => Some("text[]"),
        FieldType::Geojson => Some("json"),
        FieldType::Date => Some("date"),
        FieldType::Time => Some("time"),
        FieldType::Year => Some("int"),
        FieldType::Datetime => Some("timestamp"),
        FieldType::Duration => None,
    }
}

/// Map a DataStore column type to a canonical type and format
///
/// Unknown tokens fall back to `string` with a warning.
pub fn remote_to_canonical(token: &str) -> (FieldType, Option<&'static str>) {
    let remote = RemoteType::parse(token);
    if remote.is_array {
        return (FieldType::Array, None);
    }

    match remote.base.as_str() {
        "int" | "smallint" | "bigint" | "integer" | "serial" | "bigserial" => {
            (FieldType::Integer, None)
        }
        "numeric" | "decimal" | "money" | "float" | "real" | "double precision" => {
            (FieldType::Number, None)
        }
        "timestamp" | "timestamptz" => (FieldType::Datetime, Some("any")),
        "date" => (FieldType::Date, Some("any")),
        "time" | "timetz" => (FieldType::Time, Some("any")),
        "interval" => (FieldType::Duration, None),
        "text" | "varchar" | "char" | "bpchar" | "character varying" => (FieldType::String, None),
        "uuid" => (FieldType::String, Some("uuid")),
        "bool" | "boolean" => (FieldType::Boolean, None),
        "json" | "jsonb" => (FieldType::Object, None),
        "array" => (FieldType::Array, None),
        _ => {
            warn!("Unsupported DataStore type '{}'. Using 'string'.", token);
            (FieldType::String, None)
        }
    }
}

/// Build the `datastore_create` body for a descriptor
pub fn descriptor_to_create_spec(descriptor: &Descriptor, bucket: &str) -> Json {
    let fields: Vec<Json> = descriptor
        .fields
        .iter()
        .map(|field| {
            let mut entry = Map::new();
            entry.insert("id".to_string(), Json::String(field.name.clone()));
            match canonical_to_remote(field.field_type) {
                Some(remote_type) => {
                    entry.insert("type".to_string(), Json::String(remote_type.to_string()));
                }
                None => warn!(
                    "No DataStore type for '{}' field '{}'; leaving it to the DataStore default",
                    field.field_type, field.name
                ),
            }
            Json::Object(entry)
        })
        .collect();

    let mut spec = json!({
        "fields": fields,
        "resource_id": bucket,
        "force": true,
    });

    if let Some(ref key) = descriptor.primary_key {
        spec["primary_key"] = match key {
            PrimaryKey::Single(name) => Json::String(name.clone()),
            PrimaryKey::Composite(names) => {
                Json::Array(names.iter().cloned().map(Json::String).collect())
            }
        };
    }

    spec
}

/// Derive a descriptor from the fields of a `datastore_search` result
pub fn remote_fields_to_descriptor(fields: &[RemoteField]) -> Descriptor {
    let fields = fields
        .iter()
        .filter(|f| f.id != INTERNAL_ID_FIELD)
        .map(|f| {
            let (field_type, format) = remote_to_canonical(&f.remote_type);
            Field {
                name: f.id.clone(),
                field_type,
                format: format.map(str::to_string),
            }
        })
        .collect();

    Descriptor::new(fields)
}

/// Restore a canonical row from a DataStore record
pub fn cast_record(record: &Record, descriptor: &Descriptor) -> StorageResult<Row> {
    let mut row = Row::new();
    for field in &descriptor.fields {
        let raw = record.get(&field.name).unwrap_or(&Json::Null);
        let cell = match raw {
            // Timestamps usually arrive as ISO strings whatever the declared
            // format; anything else goes through the field's own format
            Json::String(s)
                if field.field_type == FieldType::Datetime
                    && !descriptor.missing_values.iter().any(|m| m == s) =>
            {
                match parse_datetime_any(s) {
                    Some(dt) => Cell::DateTime(dt),
                    None => field.cast_value(raw, &descriptor.missing_values)?,
                }
            }
            _ => field.cast_value(raw, &descriptor.missing_values)?,
        };
        row.insert(field.name.clone(), cell);
    }
    Ok(row)
}

/// Convert one input cell into the value sent to the DataStore
///
/// Never fails: blank temporal and numeric cells become null, JSON-typed
/// cells are parsed when given as text, anything else passes through.
pub fn uncast_value(value: &Json, field: &Field) -> Json {
    match field.field_type {
        FieldType::Integer
        | FieldType::Number
        | FieldType::Year
        | FieldType::Date
        | FieldType::Datetime
        | FieldType::Time => match value {
            Json::String(s) if s.is_empty() => Json::Null,
            other => other.clone(),
        },
        FieldType::Array | FieldType::Object | FieldType::Geojson => match value {
            Json::String(s) if !s.is_empty() => serde_json::from_str(s).unwrap_or_else(|e| {
                warn!(
                    "Field '{}' holds text that is not JSON ({}); sending it as is",
                    field.name, e
                );
                value.clone()
            }),
            v if is_falsy(v) => Json::Null,
            other => other.clone(),
        },
        _ => value.clone(),
    }
}

fn is_falsy(value: &Json) -> bool {
    match value {
        Json::Null => true,
        Json::Bool(b) => !b,
        Json::Number(n) => n.as_f64() == Some(0.0),
        Json::String(s) => s.is_empty(),
        Json::Array(items) => items.is_empty(),
        Json::Object(map) => map.is_empty(),
    }
}

/// Convert a positional input row into a DataStore record
///
/// Cells pair with fields by position; missing trailing cells become null.
pub fn uncast_row(cells: &[Json], descriptor: &Descriptor) -> Record {
    if cells.len() > descriptor.fields.len() {
        warn!(
            "Row has {} cells but the schema has {} fields; extra cells dropped",
            cells.len(),
            descriptor.fields.len()
        );
    }

    descriptor
        .fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let value = cells.get(i).unwrap_or(&Json::Null);
            (field.name.clone(), uncast_value(value, field))
        })
        .collect()
}

/// Reorder a keyed row into schema field order
pub fn keyed_to_positional(row: &Map<String, Json>, descriptor: &Descriptor) -> Vec<Json> {
    descriptor
        .fields
        .iter()
        .map(|field| row.get(&field.name).cloned().unwrap_or(Json::Null))
        .collect()
}
