//! Warehouse sync (§4.5): DDL, staging upload, `COPY`, merge/delete,
//! grants, and the catalog cache. Generic over the `Warehouse` and
//! `StagingStore` traits rather than tied to `PgWarehouse`/
//! `S3StagingStore` directly, so tests can swap in in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use redshift_core::config::Config;
use redshift_core::error::{Result, TargetError};
use redshift_core::traits::{ColumnInfo, StagingStore, Warehouse};
use redshift_schema::flatten::FlatSchema;
use redshift_schema::identifier::{key_column_name, quote_always};
use redshift_schema::normalize::METADATA_COLUMNS;
use redshift_schema::types::WarehouseType;

use crate::retry::retry_transient;
use crate::slicing;
use crate::stage::SealedBatch;

/// One column as the sync layer sees it: safe name plus resolved
/// warehouse type, in emission order. Includes the `_SDC_*` metadata
/// columns (if enabled) prepended ahead of the flattened schema.
#[derive(Debug, Clone)]
pub struct DeclaredColumn {
    pub name: String,
    pub warehouse_type: WarehouseType,
}

pub fn declared_columns(flat_schema: &FlatSchema, add_metadata_columns: bool) -> Vec<DeclaredColumn> {
    let mut columns = Vec::with_capacity(flat_schema.columns.len() + METADATA_COLUMNS.len());
    if add_metadata_columns {
        for (name, warehouse_type) in METADATA_COLUMNS {
            columns.push(DeclaredColumn {
                name: name.to_string(),
                warehouse_type: warehouse_type.clone(),
            });
        }
    }
    for column in &flat_schema.columns {
        columns.push(DeclaredColumn {
            name: column.name.clone(),
            warehouse_type: column.warehouse_type.clone(),
        });
    }
    columns
}

/// Everything a single flush needs from the stream's current state.
/// Built by the orchestrator from the registry immediately before
/// submitting the flush, so the worker never has to reach back into
/// registry locks.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub stream_name: String,
    pub target_schema: String,
    pub table_name: String,
    pub declared_columns: Vec<DeclaredColumn>,
    pub primary_key: Vec<String>,
    pub skip_updates: bool,
    pub hard_delete: bool,
    pub select_grants: Vec<String>,
    pub ensure_table: bool,
    /// `Some(v)` when this flush should also apply a pending
    /// `ACTIVATE_VERSION` switch to version `v` (§3, §6).
    pub version_switch: Option<i64>,
}

pub struct LoadOutcome {
    pub stream: String,
    pub rows: usize,
}

pub struct WarehouseSync {
    warehouse: Arc<dyn Warehouse>,
    staging: Arc<dyn StagingStore>,
    config: Arc<Config>,
    catalog: DashMap<(String, String), Vec<ColumnInfo>>,
}

impl WarehouseSync {
    pub fn new(warehouse: Arc<dyn Warehouse>, staging: Arc<dyn StagingStore>, config: Arc<Config>) -> Self {
        Self {
            warehouse,
            staging,
            config,
            catalog: DashMap::new(),
        }
    }

    /// Prime the catalog cache at startup by listing every table in
    /// every schema the config references (§4.5). A no-op when
    /// `disable_table_cache` is set; `ensure_table` then falls back to
    /// an `information_schema` lookup per call.
    pub async fn prime_catalog_cache(&self, schemas: &[String]) -> Result<()> {
        if self.config.disable_table_cache {
            return Ok(());
        }
        for schema in schemas {
            let tables = self.warehouse.tables(schema).await?;
            for table in tables {
                let columns = self.warehouse.columns(schema, &table).await?;
                self.catalog.insert((schema.clone(), table), columns);
            }
        }
        Ok(())
    }

    async fn catalog_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let key = (schema.to_string(), table.to_string());
        if !self.config.disable_table_cache {
            if let Some(columns) = self.catalog.get(&key) {
                return Ok(columns.clone());
            }
        }
        let columns = self.warehouse.columns(schema, table).await?;
        if !self.config.disable_table_cache {
            self.catalog.insert(key, columns.clone());
        }
        Ok(columns)
    }

    fn invalidate(&self, schema: &str, table: &str) {
        self.catalog.remove(&(schema.to_string(), table.to_string()));
    }

    /// Create the target table if absent, or additively `ALTER TABLE
    /// ADD COLUMN` / widen existing `VARCHAR` columns if present
    /// (§4.5). Never drops or retypes a column beyond varchar growth.
    pub async fn ensure_table(&self, ctx: &LoadContext) -> Result<()> {
        let existing = self.catalog_columns(&ctx.target_schema, &ctx.table_name).await?;

        if existing.is_empty() {
            let sql = create_table_sql(&ctx.target_schema, &ctx.table_name, &ctx.declared_columns, &ctx.primary_key);
            self.warehouse.execute(&sql).await?;
            info!(stream = %ctx.stream_name, table = %ctx.table_name, "created target table");
            let columns = self.warehouse.columns(&ctx.target_schema, &ctx.table_name).await?;
            self.catalog.insert((ctx.target_schema.clone(), ctx.table_name.clone()), columns);
            self.grant(ctx).await;
            return Ok(());
        }

        let existing_by_name: HashMap<&str, &ColumnInfo> =
            existing.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut alters = Vec::new();
        for column in &ctx.declared_columns {
            match existing_by_name.get(column.name.as_str()) {
                None => alters.push(format!(
                    "ADD COLUMN {} {}",
                    quote_always(&column.name),
                    column.warehouse_type.ddl()
                )),
                Some(existing_col) => {
                    if let Some(new_len) = widening_varchar_len(existing_col, column) {
                        alters.push(format!(
                            "ALTER COLUMN {} TYPE CHARACTER VARYING({})",
                            quote_always(&column.name),
                            new_len
                        ));
                    } else if type_conflicts(existing_col, column) {
                        warn!(
                            stream = %ctx.stream_name,
                            column = %column.name,
                            existing = %existing_col.data_type,
                            declared = %column.warehouse_type.ddl(),
                            "ignoring incompatible column type change"
                        );
                    }
                }
            }
        }

        if !alters.is_empty() {
            let sql = format!(
                "ALTER TABLE {}.{} {}",
                quote_always(&ctx.target_schema),
                quote_always(&ctx.table_name),
                alters.join(", ")
            );
            self.warehouse.execute(&sql).await?;
            self.invalidate(&ctx.target_schema, &ctx.table_name);
            let columns = self.warehouse.columns(&ctx.target_schema, &ctx.table_name).await?;
            self.catalog.insert((ctx.target_schema.clone(), ctx.table_name.clone()), columns);
        }

        Ok(())
    }

    async fn grant(&self, ctx: &LoadContext) {
        if ctx.select_grants.is_empty() {
            return;
        }
        let usage_sql = format!(
            "GRANT USAGE ON SCHEMA {} TO",
            quote_always(&ctx.target_schema)
        );
        let select_sql = format!(
            "GRANT SELECT ON {}.{} TO",
            quote_always(&ctx.target_schema),
            quote_always(&ctx.table_name)
        );
        for principal in &ctx.select_grants {
            let principal_ident = quote_always(principal);
            if let Err(e) = self.warehouse.execute(&format!("{usage_sql} {principal_ident}")).await {
                warn!(principal, error = %e, "GRANT USAGE failed; principal may not exist");
            }
            if let Err(e) = self.warehouse.execute(&format!("{select_sql} {principal_ident}")).await {
                warn!(principal, error = %e, "GRANT SELECT failed; principal may not exist");
            }
        }
    }

    /// Stage, `COPY`, and merge one sealed batch (§4.5). Either fully
    /// commits (temp table dropped, staged objects deleted, rows
    /// durable in the target) or leaves the target untouched: no
    /// partial merges.
    pub async fn load(&self, ctx: &LoadContext, batch: SealedBatch) -> Result<LoadOutcome> {
        if ctx.ensure_table {
            self.ensure_table(ctx).await?;
        }

        let upload = self.upload_batch(ctx, &batch).await?;
        let temp_table = format!("{}_temp_{}", ctx.table_name, Uuid::new_v4().simple());

        let create_temp_sql = create_table_sql(&ctx.target_schema, &temp_table, &ctx.declared_columns, &[]);
        if let Err(e) = self.warehouse.execute(&create_temp_sql).await {
            self.cleanup_staged(&upload.keys).await;
            return Err(e);
        }

        if let Err(e) = self.copy_into(&ctx.target_schema, &temp_table, &upload).await {
            self.drop_table(&ctx.target_schema, &temp_table).await;
            self.cleanup_staged(&upload.keys).await;
            return Err(e);
        }

        let merge_result = self.merge(ctx, &temp_table).await;
        self.drop_table(&ctx.target_schema, &temp_table).await;
        if let Err(e) = merge_result {
            self.cleanup_staged(&upload.keys).await;
            return Err(e);
        }

        if ctx.hard_delete {
            let sql = format!(
                "DELETE FROM {}.{} WHERE {} IS NOT NULL",
                quote_always(&ctx.target_schema),
                quote_always(&ctx.table_name),
                quote_always("_SDC_DELETED_AT"),
            );
            self.warehouse.execute(&sql).await?;
        }

        self.cleanup_staged(&upload.keys).await;

        info!(
            stream = %ctx.stream_name,
            rows = batch.row_count,
            table = %ctx.table_name,
            "flush committed"
        );

        Ok(LoadOutcome {
            stream: ctx.stream_name.clone(),
            rows: batch.row_count,
        })
    }

    async fn upload_batch(&self, ctx: &LoadContext, batch: &SealedBatch) -> Result<UploadResult> {
        let bytes = tokio::fs::read(&batch.path)
            .await
            .map_err(|e| TargetError::Fatal(e.into()))?;

        let base_prefix = format!(
            "{}{}/{}",
            self.config.s3_key_prefix_with_separator(),
            ctx.stream_name,
            Uuid::new_v4()
        );

        if self.config.slices <= 1 {
            let key = format!("{}.csv{}", base_prefix, self.config.compression.extension());
            let uri = self.staging.put(&key, bytes).await?;
            return Ok(UploadResult {
                source_uri: uri,
                keys: vec![key],
                manifest: false,
            });
        }

        let raw = slicing::decompress(&bytes, self.config.compression)?;
        let chunks = slicing::split_and_compress(&raw, self.config.slices, self.config.compression)?;

        let mut keys = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let key = format!(
                "{}/part-{:04}.csv{}",
                base_prefix, i, self.config.compression.extension()
            );
            self.staging.put(&key, chunk).await?;
            keys.push(key);
        }

        if keys.len() == 1 {
            let uri = format!("s3://{}/{}", self.config.s3_bucket, keys[0]);
            return Ok(UploadResult {
                source_uri: uri,
                keys,
                manifest: false,
            });
        }

        let manifest_body = build_manifest(&self.config.s3_bucket, &keys);
        let manifest_key = format!("{}/manifest.json", base_prefix);
        self.staging.put(&manifest_key, manifest_body.into_bytes()).await?;
        let uri = format!("s3://{}/{}", self.config.s3_bucket, manifest_key);
        keys.push(manifest_key);

        Ok(UploadResult {
            source_uri: uri,
            keys,
            manifest: true,
        })
    }

    async fn copy_into(&self, schema: &str, table: &str, upload: &UploadResult) -> Result<()> {
        let credentials = self.copy_credentials();
        let compression_keyword = self
            .config
            .compression
            .copy_keyword()
            .map(|k| format!(" {k}"))
            .unwrap_or_default();
        let manifest_keyword = if upload.manifest { " MANIFEST" } else { "" };

        let sql = format!(
            "COPY {}.{} FROM '{}' {} CSV{} DELIMITER ',' REMOVEQUOTES ESCAPE {}{}",
            quote_always(schema),
            quote_always(table),
            upload.source_uri,
            credentials,
            compression_keyword,
            self.config.copy_options,
            manifest_keyword,
        );

        retry_transient(table, "copy", || {
            let sql = sql.clone();
            async move { self.warehouse.copy(&sql).await.map_err(anyhow::Error::from) }
        })
        .await?;
        Ok(())
    }

    fn copy_credentials(&self) -> String {
        if let Some(arn) = &self.config.aws_redshift_copy_role_arn {
            format!("IAM_ROLE '{}'", arn)
        } else {
            let mut parts = Vec::new();
            if let Some(key) = &self.config.aws_access_key_id {
                parts.push(format!("aws_access_key_id={key}"));
            }
            if let Some(secret) = &self.config.aws_secret_access_key {
                parts.push(format!("aws_secret_access_key={secret}"));
            }
            if let Some(token) = &self.config.aws_session_token {
                parts.push(format!("token={token}"));
            }
            format!("CREDENTIALS '{}'", parts.join(";"))
        }
    }

    /// Assumes `temp_table` holds at most one row per declared
    /// primary key; the registry dedupes a batch to its last-written
    /// row per key before it ever reaches the stage file (§8 property
    /// 1), so a plain `INSERT ... SELECT * FROM temp` can't double up.
    async fn merge(&self, ctx: &LoadContext, temp_table: &str) -> Result<()> {
        let target = format!("{}.{}", quote_always(&ctx.target_schema), quote_always(&ctx.table_name));
        let temp = format!("{}.{}", quote_always(&ctx.target_schema), quote_always(temp_table));

        let mut statements = vec!["BEGIN".to_string()];

        if let Some(version) = ctx.version_switch {
            let _ = version;
            statements.push(format!("DELETE FROM {target}"));
        }

        if ctx.primary_key.is_empty() {
            statements.push(format!("INSERT INTO {target} SELECT * FROM {temp}"));
        } else {
            let cond = ctx
                .primary_key
                .iter()
                .map(|k| {
                    let col = quote_always(&key_column_name(k));
                    format!("{target}.{col} = {temp}.{col}")
                })
                .collect::<Vec<_>>()
                .join(" AND ");

            if ctx.skip_updates {
                statements.push(format!(
                    "INSERT INTO {target} SELECT * FROM {temp} t WHERE NOT EXISTS \
                     (SELECT 1 FROM {target} WHERE {cond})",
                ));
            } else {
                statements.push(format!("DELETE FROM {target} USING {temp} WHERE {cond}"));
                statements.push(format!("INSERT INTO {target} SELECT * FROM {temp}"));
            }
        }

        statements.push("COMMIT".to_string());
        self.warehouse.execute(&statements.join("; ")).await
    }

    async fn drop_table(&self, schema: &str, table: &str) {
        let sql = format!("DROP TABLE IF EXISTS {}.{}", quote_always(schema), quote_always(table));
        if let Err(e) = self.warehouse.execute(&sql).await {
            warn!(schema, table, error = %e, "failed to drop temp table");
        }
    }

    async fn cleanup_staged(&self, keys: &[String]) {
        for key in keys {
            let _ = self.staging.delete(key).await;
        }
    }
}

struct UploadResult {
    source_uri: String,
    keys: Vec<String>,
    manifest: bool,
}

fn create_table_sql(schema: &str, table: &str, columns: &[DeclaredColumn], primary_key: &[String]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_always(&c.name), c.warehouse_type.ddl()))
        .collect();

    if !primary_key.is_empty() {
        let pk_cols = primary_key
            .iter()
            .map(|k| quote_always(&key_column_name(k)))
            .collect::<Vec<_>>()
            .join(", ");
        defs.push(format!("PRIMARY KEY ({pk_cols})"));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_always(schema),
        quote_always(table),
        defs.join(", ")
    )
}

fn widening_varchar_len(existing: &ColumnInfo, declared: &DeclaredColumn) -> Option<usize> {
    if let WarehouseType::Varchar(new_len) = declared.warehouse_type {
        if let Some(old_len) = parse_varchar_len(&existing.data_type) {
            if new_len > old_len {
                return Some(new_len);
            }
        }
    }
    None
}

fn type_conflicts(existing: &ColumnInfo, declared: &DeclaredColumn) -> bool {
    let existing_lower = existing.data_type.to_ascii_lowercase();
    let declared_lower = declared.warehouse_type.ddl().to_ascii_lowercase();
    if existing_lower == declared_lower {
        return false;
    }
    // A same-family varchar (growth already handled, shrink/equal is
    // not a conflict worth warning about) is not a "conflict".
    if existing_lower.starts_with("character varying") && declared_lower.starts_with("character varying") {
        return false;
    }
    true
}

fn parse_varchar_len(data_type: &str) -> Option<usize> {
    let lower = data_type.to_ascii_lowercase();
    if !lower.starts_with("character varying") {
        return None;
    }
    let start = lower.find('(')?;
    let end = lower.find(')')?;
    lower[start + 1..end].trim().parse().ok()
}

fn build_manifest(bucket: &str, keys: &[String]) -> String {
    let entries: Vec<String> = keys
        .iter()
        .map(|k| format!(r#"{{"url": "s3://{bucket}/{k}", "mandatory": true}}"#))
        .collect();
    format!(r#"{{"entries": [{}]}}"#, entries.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redshift_schema::flatten::flatten;
    use serde_json::json;

    fn sample_columns() -> Vec<DeclaredColumn> {
        let schema = json!({
            "type": "object",
            "properties": { "id": {"type": "integer"}, "name": {"type": "string"} }
        });
        let flat = flatten(&schema, 0, None).unwrap();
        declared_columns(&flat, false)
    }

    #[test]
    fn create_table_sql_quotes_every_identifier_and_adds_primary_key() {
        let sql = create_table_sql("public", "orders", &sample_columns(), &["id".to_string()]);
        assert!(sql.contains(r#""public"."orders""#));
        assert!(sql.contains(r#""ID" NUMERIC(38,0)"#));
        assert!(sql.contains(r#"PRIMARY KEY ("ID")"#));
    }

    #[test]
    fn widening_only_fires_on_varchar_growth() {
        let existing = ColumnInfo { name: "NAME".into(), data_type: "character varying(50)".into() };
        let declared = DeclaredColumn { name: "NAME".into(), warehouse_type: WarehouseType::Varchar(100) };
        assert_eq!(widening_varchar_len(&existing, &declared), Some(100));

        let declared_smaller = DeclaredColumn { name: "NAME".into(), warehouse_type: WarehouseType::Varchar(10) };
        assert_eq!(widening_varchar_len(&existing, &declared_smaller), None);
    }

    #[test]
    fn incompatible_retype_is_flagged_as_conflict_not_widening() {
        let existing = ColumnInfo { name: "ID".into(), data_type: "numeric(38,0)".into() };
        let declared = DeclaredColumn { name: "ID".into(), warehouse_type: WarehouseType::Varchar(100) };
        assert!(widening_varchar_len(&existing, &declared).is_none());
        assert!(type_conflicts(&existing, &declared));
    }

    #[test]
    fn manifest_lists_every_key_as_mandatory() {
        let manifest = build_manifest("bucket", &["a.csv".to_string(), "b.csv".to_string()]);
        assert!(manifest.contains("s3://bucket/a.csv"));
        assert!(manifest.contains("s3://bucket/b.csv"));
        assert!(manifest.contains("\"mandatory\": true"));
    }
}
