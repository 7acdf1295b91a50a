//! Schema flattening (§4.2): lower a nested JSON-Schema object into a
//! flat, ordered column list, bounded by `data_flattening_max_level`.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::identifier::safe_column_name;
use crate::types::{column_type, WarehouseType};

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("column {name:?} is produced by both {first_path:?} and {second_path:?} after flattening")]
    DuplicateColumn {
        name: String,
        first_path: String,
        second_path: String,
    },
    #[error("$ref is not supported in declared schemas (path {path:?}); cyclic/recursive schemas are rejected rather than resolved")]
    UnsupportedRef { path: String },
}

/// A single flattened column: its safe warehouse name, the original
/// dotted source path (for error locators and the record-walk in
/// `normalize.rs`), and the resolved leaf schema node used to derive
/// its warehouse type.
#[derive(Debug, Clone)]
pub struct FlatColumn {
    pub name: String,
    pub source_path: String,
    pub warehouse_type: WarehouseType,
    pub nullable: bool,
}

/// An ordered, deterministic flattened schema (§3 invariant a: stable
/// key order for a given input schema + depth).
#[derive(Debug, Clone, Default)]
pub struct FlatSchema {
    pub columns: Vec<FlatColumn>,
}

impl FlatSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Flatten `schema`'s top-level `properties` down to `max_level`
/// levels of object nesting. `varchar_override` replaces the default
/// VARCHAR length for strings with no `maxLength` of their own.
pub fn flatten(
    schema: &Value,
    max_level: usize,
    varchar_override: Option<usize>,
) -> Result<FlatSchema, FlattenError> {
    let mut seen: HashMap<String, String> = HashMap::new(); // safe name -> source path
    let mut columns = Vec::new();

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, subschema) in properties {
            visit(
                key,
                key,
                subschema,
                0,
                max_level,
                varchar_override,
                &mut columns,
                &mut seen,
            )?;
        }
    }

    Ok(FlatSchema { columns })
}

#[allow(clippy::too_many_arguments)]
fn visit(
    column_prefix: &str,
    source_path: &str,
    node: &Value,
    depth: usize,
    max_level: usize,
    varchar_override: Option<usize>,
    out: &mut Vec<FlatColumn>,
    seen: &mut HashMap<String, String>,
) -> Result<(), FlattenError> {
    if node.get("$ref").is_some() {
        return Err(FlattenError::UnsupportedRef {
            path: source_path.to_string(),
        });
    }

    let (resolved, nullable) = resolve_node(node)?;

    let shape = classify(&resolved);
    match shape {
        NodeShape::ObjectWithProperties(properties) if depth < max_level => {
            for (key, subschema) in properties {
                let child_prefix = format!("{}__{}", column_prefix, key);
                let child_path = format!("{}.{}", source_path, key);
                visit(
                    &child_prefix,
                    &child_path,
                    subschema,
                    depth + 1,
                    max_level,
                    varchar_override,
                    out,
                    seen,
                )?;
            }
            Ok(())
        }
        NodeShape::ObjectWithProperties(_) | NodeShape::ObjectOpaque | NodeShape::Array => {
            emit(
                column_prefix,
                source_path,
                WarehouseType::Super,
                nullable,
                out,
                seen,
            )
        }
        NodeShape::Scalar => {
            let warehouse_type = column_type(&resolved, varchar_override);
            emit(column_prefix, source_path, warehouse_type, nullable, out, seen)
        }
    }
}

fn emit(
    column_prefix: &str,
    source_path: &str,
    warehouse_type: WarehouseType,
    nullable: bool,
    out: &mut Vec<FlatColumn>,
    seen: &mut HashMap<String, String>,
) -> Result<(), FlattenError> {
    let name = safe_column_name(column_prefix);
    if let Some(first_path) = seen.get(&name) {
        if first_path != source_path {
            return Err(FlattenError::DuplicateColumn {
                name,
                first_path: first_path.clone(),
                second_path: source_path.to_string(),
            });
        }
    }
    seen.insert(name.clone(), source_path.to_string());
    out.push(FlatColumn {
        name,
        source_path: source_path.to_string(),
        warehouse_type,
        nullable,
    });
    Ok(())
}

/// Merge a newly flattened schema into a stream's existing one,
/// additively (§3 lifecycle: "mutated on SCHEMA-with-changes
/// (additive ALTER TABLE)"). Columns already present (by name) keep
/// their existing position and definition; new columns are appended
/// in `incoming`'s order. A name reused for a different source path
/// is the same hard error `flatten` itself raises for a single
/// schema.
pub fn merge(base: &FlatSchema, incoming: &FlatSchema) -> Result<FlatSchema, FlattenError> {
    let mut seen: HashMap<String, String> = base
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.source_path.clone()))
        .collect();
    let mut columns = base.columns.clone();

    for column in &incoming.columns {
        match seen.get(&column.name) {
            Some(existing_path) if existing_path == &column.source_path => {
                // Same column re-declared; keep the original definition.
            }
            Some(existing_path) => {
                return Err(FlattenError::DuplicateColumn {
                    name: column.name.clone(),
                    first_path: existing_path.clone(),
                    second_path: column.source_path.clone(),
                });
            }
            None => {
                seen.insert(column.name.clone(), column.source_path.clone());
                columns.push(column.clone());
            }
        }
    }

    Ok(FlatSchema { columns })
}

enum NodeShape<'a> {
    ObjectWithProperties(&'a serde_json::Map<String, Value>),
    ObjectOpaque,
    Array,
    Scalar,
}

fn classify(node: &Value) -> NodeShape<'_> {
    match node.get("type").and_then(Value::as_str) {
        Some("object") => match node.get("properties").and_then(Value::as_object) {
            Some(properties) => NodeShape::ObjectWithProperties(properties),
            None => NodeShape::ObjectOpaque,
        },
        Some("array") => NodeShape::Array,
        _ => NodeShape::Scalar,
    }
}

/// Collapse `anyOf`/`oneOf` to their first non-null branch, and a
/// union `type: [T, "null"]` to `type: T` plus a nullable flag.
fn resolve_node(node: &Value) -> Result<(Value, bool), FlattenError> {
    for key in ["anyOf", "oneOf"] {
        if let Some(branches) = node.get(key).and_then(Value::as_array) {
            let chosen = branches.iter().find(|b| !is_null_schema(b));
            if let Some(branch) = chosen {
                return resolve_node(branch);
            }
            // Every branch was null; treat as an always-null scalar.
            return Ok((serde_json::json!({"type": "null"}), true));
        }
    }

    if let Some(types) = node.get("type").and_then(Value::as_array) {
        let mut nullable = false;
        let mut chosen: Option<Value> = None;
        for t in types {
            if t.as_str() == Some("null") {
                nullable = true;
            } else if chosen.is_none() {
                chosen = Some(t.clone());
            }
        }
        let mut resolved = node.clone();
        if let Some(t) = chosen {
            if let Some(obj) = resolved.as_object_mut() {
                obj.insert("type".to_string(), t);
            }
        }
        return Ok((resolved, nullable));
    }

    Ok((node.clone(), false))
}

fn is_null_schema(branch: &Value) -> bool {
    branch.get("type").and_then(Value::as_str) == Some("null")
}
