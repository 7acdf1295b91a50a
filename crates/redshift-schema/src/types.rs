//! JSON-Schema node to warehouse column type (§3's "column type
//! lattice", §4.1). `column_type` never fails: an unrecognized shape
//! falls through to the default `CHARACTER VARYING` rather than
//! raising, matching the mapper's stated contract.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseType {
    TimestampWithoutTz,
    /// `CHARACTER VARYING(16)`, used for `format: time`.
    TimeVarchar,
    Date,
    Varchar(usize),
    /// `NUMERIC(38,0)`.
    Integer,
    Float,
    Boolean,
    /// Native semi-structured column, used for nested objects/arrays
    /// at or beyond the flattening depth.
    Super,
    /// Used only by the fixed-shape `_SDC_*` metadata columns.
    BigInt,
}

impl WarehouseType {
    pub fn ddl(&self) -> String {
        match self {
            WarehouseType::TimestampWithoutTz => "TIMESTAMP WITHOUT TIME ZONE".to_string(),
            WarehouseType::TimeVarchar => "CHARACTER VARYING(16)".to_string(),
            WarehouseType::Date => "DATE".to_string(),
            WarehouseType::Varchar(len) => format!("CHARACTER VARYING({})", len),
            WarehouseType::Integer => "NUMERIC(38,0)".to_string(),
            WarehouseType::Float => "FLOAT".to_string(),
            WarehouseType::Boolean => "BOOLEAN".to_string(),
            WarehouseType::Super => "SUPER".to_string(),
            WarehouseType::BigInt => "BIGINT".to_string(),
        }
    }

    /// Whether widening from `self` to `other` is a safe, in-place
    /// `ALTER TABLE ... ALTER COLUMN` (only `maxLength` growth on an
    /// existing varchar, per §4.5).
    pub fn widens_to(&self, other: &WarehouseType) -> bool {
        matches!(
            (self, other),
            (WarehouseType::Varchar(old), WarehouseType::Varchar(new)) if new > old
        )
    }
}

/// Default length used for strings with no `maxLength` and no
/// caller override (§3).
pub const DEFAULT_VARCHAR_LENGTH: usize = 10_000;

const MAX_VARCHAR_LENGTH: usize = 65_535;

/// Map a single (already-union-resolved) JSON-Schema leaf node to its
/// warehouse column type. `varchar_override` replaces the default
/// length used when a string has no `maxLength` of its own.
pub fn column_type(node: &Value, varchar_override: Option<usize>) -> WarehouseType {
    let json_type = node.get("type").and_then(Value::as_str);

    match json_type {
        Some("string") => string_type(node, varchar_override),
        Some("integer") => WarehouseType::Integer,
        Some("number") => WarehouseType::Float,
        Some("boolean") => WarehouseType::Boolean,
        Some("object") | Some("array") => WarehouseType::Super,
        _ => WarehouseType::Varchar(varchar_override.unwrap_or(DEFAULT_VARCHAR_LENGTH)),
    }
}

fn string_type(node: &Value, varchar_override: Option<usize>) -> WarehouseType {
    match node.get("format").and_then(Value::as_str) {
        Some("date-time") => return WarehouseType::TimestampWithoutTz,
        Some("time") => return WarehouseType::TimeVarchar,
        Some("date") => return WarehouseType::Date,
        _ => {}
    }

    if let Some(max_length) = node.get("maxLength").and_then(Value::as_u64) {
        let len = ((max_length as usize) * 3).min(MAX_VARCHAR_LENGTH);
        return WarehouseType::Varchar(len);
    }

    WarehouseType::Varchar(varchar_override.unwrap_or(DEFAULT_VARCHAR_LENGTH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_time_format_maps_to_timestamp() {
        let node = json!({"type": "string", "format": "date-time"});
        assert_eq!(column_type(&node, None), WarehouseType::TimestampWithoutTz);
    }

    #[test]
    fn time_format_maps_to_varchar_16() {
        let node = json!({"type": "string", "format": "time"});
        assert_eq!(column_type(&node, None), WarehouseType::TimeVarchar);
    }

    #[test]
    fn date_format_maps_to_date() {
        let node = json!({"type": "string", "format": "date"});
        assert_eq!(column_type(&node, None), WarehouseType::Date);
    }

    #[test]
    fn max_length_scales_by_three_and_caps() {
        let node = json!({"type": "string", "maxLength": 100});
        assert_eq!(column_type(&node, None), WarehouseType::Varchar(300));

        let node = json!({"type": "string", "maxLength": 100_000});
        assert_eq!(column_type(&node, None), WarehouseType::Varchar(65_535));
    }

    #[test]
    fn plain_string_uses_default_or_override() {
        let node = json!({"type": "string"});
        assert_eq!(column_type(&node, None), WarehouseType::Varchar(10_000));
        assert_eq!(column_type(&node, Some(500)), WarehouseType::Varchar(500));
    }

    #[test]
    fn scalars_map_directly() {
        assert_eq!(column_type(&json!({"type": "integer"}), None), WarehouseType::Integer);
        assert_eq!(column_type(&json!({"type": "number"}), None), WarehouseType::Float);
        assert_eq!(column_type(&json!({"type": "boolean"}), None), WarehouseType::Boolean);
    }

    #[test]
    fn object_and_array_map_to_super() {
        assert_eq!(column_type(&json!({"type": "object"}), None), WarehouseType::Super);
        assert_eq!(column_type(&json!({"type": "array"}), None), WarehouseType::Super);
    }

    #[test]
    fn unknown_shape_falls_through_to_default_varchar() {
        assert_eq!(column_type(&json!({}), None), WarehouseType::Varchar(10_000));
        assert_eq!(column_type(&json!({"type": "null"}), None), WarehouseType::Varchar(10_000));
    }

    #[test]
    fn widening_only_allowed_for_varchar_growth() {
        assert!(WarehouseType::Varchar(100).widens_to(&WarehouseType::Varchar(200)));
        assert!(!WarehouseType::Varchar(200).widens_to(&WarehouseType::Varchar(100)));
        assert!(!WarehouseType::Integer.widens_to(&WarehouseType::Float));
    }
}
