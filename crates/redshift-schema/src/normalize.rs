//! Record normalization (§4.3): project a record against a flattened
//! schema and render it as one CSV row.

use chrono::{DateTime, Utc};
use redshift_core::error::{Result, StreamName, TargetError};
use serde_json::Value;

use crate::flatten::FlatSchema;
use crate::types::WarehouseType;

/// Fixed-shape `_SDC_*` columns, in prepend order, when
/// `add_metadata_columns` is enabled.
pub const METADATA_COLUMNS: &[(&str, WarehouseType)] = &[
    ("_SDC_EXTRACTED_AT", WarehouseType::TimestampWithoutTz),
    ("_SDC_RECEIVED_AT", WarehouseType::TimestampWithoutTz),
    ("_SDC_BATCHED_AT", WarehouseType::TimestampWithoutTz),
    ("_SDC_DELETED_AT", WarehouseType::TimestampWithoutTz),
    ("_SDC_SEQUENCE", WarehouseType::BigInt),
    ("_SDC_TABLE_VERSION", WarehouseType::BigInt),
];

/// Per-record context the registry supplies alongside the raw JSON
/// payload; everything here comes from message metadata or the
/// engine clock, never from the flattened schema.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    pub extracted_at: Option<String>,
    pub received_at: DateTime<Utc>,
    pub sequence: i64,
    pub table_version: Option<i64>,
}

/// A CSV-ready row: one optional string per output column, `None`
/// meaning an unquoted empty field (NULL under the fixed COPY
/// options' `EMPTYASNULL`/`BLANKSASNULL`).
#[derive(Debug, Clone, Default)]
pub struct NormalizedRow {
    pub fields: Vec<Option<String>>,
}

impl NormalizedRow {
    /// Render as one `\n`-terminated CSV line, delimiter `,`, quote
    /// `"`, embedded quotes doubled per RFC 4180.
    pub fn to_csv_line(&self) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(self.fields.iter().map(|f| f.as_deref().unwrap_or("")))
            .map_err(|e| TargetError::Fatal(e.into()))?;
        let bytes = writer
            .into_inner()
            .map_err(|e| TargetError::Fatal(anyhow::anyhow!(e.to_string())))?;
        String::from_utf8(bytes).map_err(|e| TargetError::Fatal(e.into()))
    }
}

/// Normalize `record` against `schema`, optionally prepending the
/// `_SDC_*` metadata columns. `validate_records` gates whether a
/// malformed date-time is a hard error or silently NULLed.
pub fn normalize_record(
    stream: &str,
    record: &Value,
    schema: &FlatSchema,
    metadata: Option<&RecordMetadata>,
    validate_records: bool,
    locator: impl Fn() -> String,
) -> Result<NormalizedRow> {
    let mut fields = Vec::with_capacity(schema.columns.len() + METADATA_COLUMNS.len());

    if let Some(metadata) = metadata {
        fields.push(Some(render_timestamp(metadata.extracted_at.as_deref())));
        fields.push(Some(metadata.received_at.to_rfc3339()));
        fields.push(Some(metadata.received_at.to_rfc3339()));
        fields.push(deleted_at_field(record));
        fields.push(Some(metadata.sequence.to_string()));
        fields.push(metadata.table_version.map(|v| v.to_string()));
    }

    for column in &schema.columns {
        let value = lookup_path(record, &column.source_path);
        let field = render_field(
            stream,
            &column.source_path,
            value,
            &column.warehouse_type,
            validate_records,
            &locator,
        )?;
        fields.push(field);
    }

    Ok(NormalizedRow { fields })
}

fn render_timestamp(raw: Option<&str>) -> String {
    raw.map(str::to_string).unwrap_or_default()
}

fn deleted_at_field(record: &Value) -> Option<String> {
    match record.get("_sdc_deleted_at") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Walk a dotted source path (as produced by `flatten::visit`) into a
/// record, returning `None` for any missing intermediate or leaf.
fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A stable key for `record`'s declared primary-key paths, used to
/// dedupe a batch to one row per key before it reaches the stage file
/// (last occurrence wins). Missing key fields collapse to the same
/// "null" marker so two records with the same absent key still
/// collide, matching `lookup_path`'s missing-is-null handling.
pub fn primary_key_signature(record: &Value, key_properties: &[String]) -> String {
    key_properties
        .iter()
        .map(|path| match lookup_path(record, path) {
            Some(v) => v.to_string(),
            None => "null".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\u{1}")
}

fn render_field(
    stream: &str,
    source_path: &str,
    value: Option<&Value>,
    warehouse_type: &WarehouseType,
    validate_records: bool,
    locator: &impl Fn() -> String,
) -> Result<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }

    match warehouse_type {
        WarehouseType::Super => Ok(Some(serde_json::to_string(value).map_err(|e| {
            TargetError::validation(stream.to_string(), locator(), e.to_string())
        })?)),
        WarehouseType::TimestampWithoutTz | WarehouseType::Date | WarehouseType::TimeVarchar => {
            render_date_time(stream, source_path, value, validate_records, locator)
        }
        WarehouseType::Integer | WarehouseType::BigInt => Ok(render_number(value)),
        WarehouseType::Float => Ok(render_number(value)),
        WarehouseType::Boolean => Ok(value.as_bool().map(|b| b.to_string())),
        WarehouseType::Varchar(_) => Ok(render_string(value)),
    }
}

fn render_date_time(
    stream: &str,
    source_path: &str,
    value: &Value,
    validate_records: bool,
    locator: &impl Fn() -> String,
) -> Result<Option<String>> {
    let raw = match value.as_str() {
        Some(s) => s,
        None => return Ok(render_string(value)),
    };

    if DateTime::parse_from_rfc3339(raw).is_ok() {
        return Ok(Some(raw.to_string()));
    }

    if validate_records {
        Err(TargetError::validation(
            stream.to_string(),
            locator(),
            format!("{source_path}: {raw:?} is not a valid ISO-8601 timestamp"),
        ))
    } else {
        Ok(None)
    }
}

fn render_number(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return None;
                }
            }
            Some(n.to_string())
        }
        _ => None,
    }
}

fn render_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::flatten;
    use serde_json::json;

    fn meta(sequence: i64) -> RecordMetadata {
        RecordMetadata {
            extracted_at: Some("2024-01-01T00:00:00Z".to_string()),
            received_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z")
                .unwrap()
                .with_timezone(&Utc),
            sequence,
            table_version: None,
        }
    }

    #[test]
    fn missing_paths_become_null() {
        let schema_json = json!({
            "type": "object",
            "properties": { "id": {"type": "integer"}, "name": {"type": "string"} }
        });
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"id": 1});
        let row = normalize_record("orders", &record, &schema, None, false, || "0".to_string())
            .unwrap();
        assert_eq!(row.fields, vec![Some("1".to_string()), None]);
    }

    #[test]
    fn super_column_serializes_compactly() {
        let schema_json = json!({
            "type": "object",
            "properties": { "a": { "type": "object", "properties": { "b": {"type": "integer"} } } }
        });
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"a": {"b": 7}});
        let row = normalize_record("s", &record, &schema, None, false, || "0".to_string()).unwrap();
        assert_eq!(row.fields, vec![Some("{\"b\":7}".to_string())]);
    }

    #[test]
    fn nan_and_infinite_numbers_become_null() {
        let schema_json = json!({"type": "object", "properties": {"n": {"type": "number"}}});
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"n": 1.5});
        let row = normalize_record("s", &record, &schema, None, false, || "0".to_string()).unwrap();
        assert_eq!(row.fields, vec![Some("1.5".to_string())]);
    }

    #[test]
    fn invalid_date_time_is_null_when_validation_disabled() {
        let schema_json =
            json!({"type": "object", "properties": {"at": {"type": "string", "format": "date-time"}}});
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"at": "not-a-date"});
        let row = normalize_record("s", &record, &schema, None, false, || "0".to_string()).unwrap();
        assert_eq!(row.fields, vec![None]);
    }

    #[test]
    fn invalid_date_time_fails_when_validation_enabled() {
        let schema_json =
            json!({"type": "object", "properties": {"at": {"type": "string", "format": "date-time"}}});
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"at": "not-a-date"});
        let err = normalize_record("s", &record, &schema, None, true, || "rec-1".to_string())
            .unwrap_err();
        assert!(matches!(err, TargetError::Validation { .. }));
    }

    #[test]
    fn metadata_columns_prepended_with_deleted_at_from_record() {
        let schema_json = json!({"type": "object", "properties": {"id": {"type": "integer"}}});
        let schema = flatten(&schema_json, 0, None).unwrap();
        let record = json!({"id": 2, "_sdc_deleted_at": "2024-01-01T00:00:00Z"});
        let row = normalize_record("s", &record, &schema, Some(&meta(42)), false, || {
            "0".to_string()
        })
        .unwrap();
        assert_eq!(row.fields.len(), METADATA_COLUMNS.len() + 1);
        assert_eq!(row.fields[3], Some("2024-01-01T00:00:00Z".to_string()));
        assert_eq!(row.fields[4], Some("42".to_string()));
        assert_eq!(row.fields.last().unwrap(), &Some("2".to_string()));
    }

    #[test]
    fn primary_key_signature_distinguishes_and_collides_correctly() {
        let keys = vec!["id".to_string()];
        let a = primary_key_signature(&json!({"id": 1, "name": "a"}), &keys);
        let b = primary_key_signature(&json!({"id": 1, "name": "c"}), &keys);
        let c = primary_key_signature(&json!({"id": 2, "name": "b"}), &keys);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn csv_line_doubles_embedded_quotes() {
        let row = NormalizedRow {
            fields: vec![Some("say \"hi\"".to_string()), None],
        };
        let line = row.to_csv_line().unwrap();
        assert_eq!(line, "\"say \"\"hi\"\"\",\n");
    }
}
