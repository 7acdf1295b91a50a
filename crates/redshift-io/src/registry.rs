//! Stream registry (§4.6): a thread-safe mapping from stream name to
//! the `Stream` object described in §3 (declared schema, key
//! predicates, target table, active version, and the current open
//! batch). The registry map itself (`DashMap`, internally sharded) and
//! each stream's mutable state (a per-stream `tokio::sync::Mutex`)
//! use separate locks, so stage-writer/registry mutations for one
//! stream never block lookups or mutations of another.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use redshift_core::config::Config;
use redshift_core::error::{Result, TargetError};
use redshift_core::message::{ActivateVersionMessage, RecordMessage, SchemaMessage};
use redshift_schema::flatten::{flatten, merge, FlatSchema};
use redshift_schema::identifier::{key_column_name, safe_table_name};
use redshift_schema::normalize::{normalize_record, primary_key_signature, RecordMetadata};

use crate::stage::{Batch, StageFile};
use crate::sync::{declared_columns, LoadContext};

/// Separator between the catalog/schema and table components of a
/// compound stream name (§3, §8 scenario S5's `public-order`).
pub const STREAM_NAME_SEPARATOR: char = '-';

fn source_schema_component(stream: &str, separator: char) -> &str {
    match stream.rfind(separator) {
        Some(idx) => &stream[..idx],
        None => stream,
    }
}

/// A second `SCHEMA` for a stream whose declared type for an existing
/// column has changed is ignored rather than applied (§9's open
/// question): the original definition wins. Log it so a tap author
/// notices instead of silently losing a retype.
fn warn_on_retype(stream: &str, existing: &FlatSchema, incoming: &FlatSchema) {
    for column in &incoming.columns {
        if let Some(current) = existing.columns.iter().find(|c| c.name == column.name) {
            if current.source_path == column.source_path && current.warehouse_type != column.warehouse_type {
                warn!(
                    stream,
                    column = %column.name,
                    existing_type = ?current.warehouse_type,
                    declared_type = ?column.warehouse_type,
                    "ignoring column type change from a later SCHEMA message"
                );
            }
        }
    }
}

struct StreamState {
    name: String,
    target_schema: String,
    table_name: String,
    key_properties: Vec<String>,
    flat_schema: FlatSchema,
    active_version: Option<i64>,
    pending_version: Option<i64>,
    batch: Option<Batch>,
    ensure_table: bool,
    select_grants: Vec<String>,
    record_seq: i64,
    cumulative_rows: u64,
}

impl StreamState {
    fn new(name: String, target_schema: String, table_name: String, select_grants: Vec<String>) -> Self {
        Self {
            name,
            target_schema,
            table_name,
            key_properties: Vec::new(),
            flat_schema: FlatSchema::default(),
            active_version: None,
            pending_version: None,
            batch: None,
            ensure_table: false,
            select_grants,
            record_seq: 0,
            cumulative_rows: 0,
        }
    }
}

struct PendingState {
    /// The highest flush sequence submitted at the moment this
    /// checkpoint was received. It can only be emitted once every
    /// flush with sequence `<= gate` has committed.
    gate: u64,
    value: Value,
}

/// Thread-safe mapping from stream name to `Stream` object (§4.6).
pub struct StreamRegistry {
    config: Arc<Config>,
    streams: DashMap<String, Arc<AsyncMutex<StreamState>>>,
    pending_states: StdMutex<VecDeque<PendingState>>,
}

impl StreamRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            streams: DashMap::new(),
            pending_states: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Create the stream on first sight, or merge an updated schema
    /// into its existing one additively (§3 lifecycle, §4.2 `merge`).
    /// Defers any resulting DDL to the stream's next flush rather
    /// than issuing it here.
    pub async fn on_schema(&self, msg: &SchemaMessage) -> Result<()> {
        if self.config.primary_key_required && msg.key_properties.is_empty() {
            return Err(TargetError::schema(
                msg.stream.clone(),
                "key_properties is required (primary_key_required=true) but none were declared",
            ));
        }

        let flat = flatten(&msg.schema, self.config.data_flattening_max_level, Some(self.config.varchar_length))
            .map_err(|e| TargetError::schema(msg.stream.clone(), e.to_string()))?;

        let source_schema = source_schema_component(&msg.stream, STREAM_NAME_SEPARATOR).to_string();
        let target_schema = self.config.resolve_target_schema(&source_schema);
        let select_grants = self.config.resolve_select_grants(&source_schema);
        let table_name = safe_table_name(&msg.stream, STREAM_NAME_SEPARATOR);

        let stream_arc = self
            .streams
            .entry(msg.stream.clone())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(StreamState::new(
                    msg.stream.clone(),
                    target_schema,
                    table_name,
                    select_grants,
                )))
            })
            .clone();

        let mut state = stream_arc.lock().await;
        if !msg.key_properties.is_empty() {
            state.key_properties = msg.key_properties.clone();
        }

        if state.flat_schema.columns.is_empty() {
            state.flat_schema = flat;
            state.ensure_table = true;
        } else {
            warn_on_retype(&msg.stream, &state.flat_schema, &flat);
            let before = state.flat_schema.columns.len();
            let merged = merge(&state.flat_schema, &flat)
                .map_err(|e| TargetError::schema(msg.stream.clone(), e.to_string()))?;
            if merged.columns.len() != before {
                state.ensure_table = true;
            }
            state.flat_schema = merged;
        }

        info!(stream = %msg.stream, columns = state.flat_schema.columns.len(), "stream schema applied");
        Ok(())
    }

    /// Normalize and append `msg` to its stream's current batch
    /// (§4.3, §4.4), returning whether the batch has now reached
    /// `batch_size_rows` (§4.7 trigger 1).
    pub async fn on_record(&self, msg: &RecordMessage, scratch_dir: &Path) -> Result<bool> {
        let stream_arc = self
            .streams
            .get(&msg.stream)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                TargetError::protocol(format!(
                    "RECORD for stream {:?} seen before its SCHEMA",
                    msg.stream
                ))
            })?;

        let mut state = stream_arc.lock().await;
        state.record_seq += 1;
        let stream_name = state.name.clone();
        let locator_seq = state.record_seq;

        let metadata = self.config.add_metadata_columns().then(|| RecordMetadata {
            extracted_at: msg.time_extracted.clone(),
            received_at: Utc::now(),
            sequence: Utc::now().timestamp_millis(),
            table_version: msg.version.or(state.active_version),
        });

        let row = normalize_record(
            &stream_name,
            &msg.record,
            &state.flat_schema,
            metadata.as_ref(),
            self.config.validate_records,
            || format!("{stream_name}#{locator_seq}"),
        )?;
        let line = row.to_csv_line()?;

        let has_key = !state.key_properties.is_empty();
        let key = has_key.then(|| primary_key_signature(&msg.record, &state.key_properties));

        if state.batch.is_none() {
            state.batch = Some(if has_key {
                Batch::new_keyed(stream_name.clone())
            } else {
                Batch::new_streaming(StageFile::create(scratch_dir, &stream_name, self.config.compression)?)
            });
        }
        let batch = state.batch.as_mut().expect("just created above");
        batch.append_row(key.as_deref(), &line)?;
        state.cumulative_rows += 1;

        Ok(batch.received_count() >= self.config.batch_size_rows)
    }

    /// Record a pending table-version switch to be applied at the
    /// stream's next flush (§3, §6).
    pub async fn on_activate_version(&self, msg: &ActivateVersionMessage) -> Result<()> {
        let stream_arc = self
            .streams
            .get(&msg.stream)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                TargetError::protocol(format!(
                    "ACTIVATE_VERSION for unknown stream {:?}",
                    msg.stream
                ))
            })?;
        let mut state = stream_arc.lock().await;
        state.pending_version = Some(msg.version);
        Ok(())
    }

    /// Capture a checkpoint, keyed by the highest flush sequence
    /// submitted at the time it was received (§4.6, §5's ordering
    /// guarantee).
    pub fn on_state(&self, value: Value, gate: u64) {
        self.pending_states.lock().unwrap().push_back(PendingState { gate, value });
    }

    /// Pop every captured checkpoint whose gate has been cleared by
    /// `watermark`, in the order they were received.
    pub fn drain_emittable(&self, watermark: u64) -> Vec<Value> {
        let mut queue = self.pending_states.lock().unwrap();
        let mut out = Vec::new();
        while let Some(front) = queue.front() {
            if front.gate <= watermark {
                out.push(queue.pop_front().unwrap().value);
            } else {
                break;
            }
        }
        out
    }

    /// Seal `stream`'s current batch, if any, and build the
    /// `LoadContext` a flush worker needs, capturing and resetting the
    /// stream's pending-DDL and pending-version-switch flags so the
    /// next flush doesn't redo them. Returns `None` if the stream has
    /// no rows to flush.
    pub async fn seal_batch(
        &self,
        stream: &str,
        scratch_dir: &Path,
    ) -> Result<Option<(crate::stage::SealedBatch, LoadContext)>> {
        let Some(entry) = self.streams.get(stream) else {
            return Ok(None);
        };
        let stream_arc = entry.clone();
        drop(entry);

        let mut state = stream_arc.lock().await;
        let Some(batch) = state.batch.take() else {
            return Ok(None);
        };
        if batch.is_empty() {
            return Ok(None);
        }

        let sealed = batch.seal(scratch_dir, self.config.compression)?;

        let ensure_table = state.ensure_table;
        state.ensure_table = false;

        let version_switch = state.pending_version.take();
        if let Some(version) = version_switch {
            state.active_version = Some(version);
        }

        let primary_key: Vec<String> = state
            .key_properties
            .iter()
            .map(|k| key_column_name(k))
            .collect();

        let ctx = LoadContext {
            stream_name: state.name.clone(),
            target_schema: state.target_schema.clone(),
            table_name: state.table_name.clone(),
            declared_columns: declared_columns(&state.flat_schema, self.config.add_metadata_columns()),
            primary_key,
            skip_updates: self.config.skip_updates,
            hard_delete: self.config.hard_delete,
            select_grants: state.select_grants.clone(),
            ensure_table,
            version_switch,
        };

        Ok(Some((sealed, ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redshift_core::config::Compression;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Read;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            host: "localhost".into(),
            port: 5439,
            user: "u".into(),
            password: "p".into(),
            dbname: "db".into(),
            aws_profile: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            aws_redshift_copy_role_arn: None,
            s3_bucket: "bucket".into(),
            s3_key_prefix: String::new(),
            s3_acl: None,
            s3_endpoint: None,
            s3_region: None,
            default_target_schema: "public".into(),
            default_target_schema_select_permissions: vec![],
            schema_mapping: HashMap::new(),
            batch_size_rows: 2,
            flush_all_streams: false,
            parallelism: 0,
            max_parallelism: 16,
            compression: Compression::None,
            slices: 1,
            copy_options: String::new(),
            add_metadata_columns: false,
            hard_delete: false,
            data_flattening_max_level: 0,
            primary_key_required: false,
            validate_records: false,
            skip_updates: false,
            disable_table_cache: false,
            temp_dir: None,
            varchar_length: 10_000,
        })
    }

    fn schema_msg(stream: &str, keys: Vec<&str>) -> SchemaMessage {
        SchemaMessage {
            stream: stream.to_string(),
            schema: json!({
                "type": "object",
                "properties": { "id": {"type": "integer"}, "name": {"type": "string"} }
            }),
            key_properties: keys.into_iter().map(str::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn record_before_schema_is_a_protocol_error() {
        let registry = StreamRegistry::new(test_config());
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordMessage {
            stream: "orders".into(),
            record: json!({"id": 1}),
            time_extracted: None,
            version: None,
        };
        let err = registry.on_record(&msg, dir.path()).await.unwrap_err();
        assert!(matches!(err, TargetError::Protocol(_)));
    }

    #[tokio::test]
    async fn batch_full_predicate_fires_at_batch_size_rows() {
        let registry = StreamRegistry::new(test_config());
        let dir = tempfile::tempdir().unwrap();
        registry.on_schema(&schema_msg("public-orders", vec!["id"])).await.unwrap();

        let record = |id: i64| RecordMessage {
            stream: "public-orders".into(),
            record: json!({"id": id, "name": "a"}),
            time_extracted: None,
            version: None,
        };

        assert!(!registry.on_record(&record(1), dir.path()).await.unwrap());
        assert!(registry.on_record(&record(2), dir.path()).await.unwrap());
    }

    /// Scenario S1 (§8): records `{1,"a"},{2,"b"},{1,"c"}` against a
    /// declared key of `["id"]` stage down to one row per id, last
    /// write wins, even though all three were received.
    #[tokio::test]
    async fn keyed_records_dedupe_within_a_batch_before_sealing() {
        let mut cfg = (*test_config()).clone();
        cfg.batch_size_rows = 10;
        let registry = StreamRegistry::new(Arc::new(cfg));
        let dir = tempfile::tempdir().unwrap();
        registry.on_schema(&schema_msg("public-orders", vec!["id"])).await.unwrap();

        let record = |id: i64, name: &str| RecordMessage {
            stream: "public-orders".into(),
            record: json!({"id": id, "name": name}),
            time_extracted: None,
            version: None,
        };

        registry.on_record(&record(1, "a"), dir.path()).await.unwrap();
        registry.on_record(&record(2, "b"), dir.path()).await.unwrap();
        registry.on_record(&record(1, "c"), dir.path()).await.unwrap();

        let (sealed, _) = registry.seal_batch("public-orders", dir.path()).await.unwrap().unwrap();
        assert_eq!(sealed.row_count, 2);

        let mut contents = String::new();
        std::fs::File::open(&sealed.path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "1,c\n2,b\n");
    }

    #[tokio::test]
    async fn seal_batch_resets_ensure_table_and_is_none_when_empty() {
        let registry = StreamRegistry::new(test_config());
        let dir = tempfile::tempdir().unwrap();
        registry.on_schema(&schema_msg("public-orders", vec!["id"])).await.unwrap();

        assert!(registry.seal_batch("public-orders", dir.path()).await.unwrap().is_none());

        let record = RecordMessage {
            stream: "public-orders".into(),
            record: json!({"id": 1, "name": "a"}),
            time_extracted: None,
            version: None,
        };
        registry.on_record(&record, dir.path()).await.unwrap();

        let (sealed, ctx) = registry.seal_batch("public-orders", dir.path()).await.unwrap().unwrap();
        assert_eq!(sealed.row_count, 1);
        assert!(ctx.ensure_table);
        assert_eq!(ctx.table_name, "ORDERS");
        assert_eq!(ctx.primary_key, vec!["ID".to_string()]);

        // A second seal with no new rows in between is a no-op and the
        // pending-DDL flag has already been consumed.
        assert!(registry.seal_batch("public-orders", dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activate_version_is_applied_at_next_seal() {
        let registry = StreamRegistry::new(test_config());
        let dir = tempfile::tempdir().unwrap();
        registry.on_schema(&schema_msg("public-orders", vec!["id"])).await.unwrap();
        registry
            .on_activate_version(&ActivateVersionMessage { stream: "public-orders".into(), version: 7 })
            .await
            .unwrap();

        let record = RecordMessage {
            stream: "public-orders".into(),
            record: json!({"id": 1, "name": "a"}),
            time_extracted: None,
            version: None,
        };
        registry.on_record(&record, dir.path()).await.unwrap();

        let (_, ctx) = registry.seal_batch("public-orders", dir.path()).await.unwrap().unwrap();
        assert_eq!(ctx.version_switch, Some(7));
    }

    #[tokio::test]
    async fn primary_key_required_rejects_schema_without_keys() {
        let mut cfg = (*test_config()).clone();
        cfg.primary_key_required = true;
        let registry = StreamRegistry::new(Arc::new(cfg));
        let result = registry.on_schema(&schema_msg("public-orders", vec![])).await;
        assert!(matches!(result.unwrap_err(), TargetError::Schema { .. }));
    }

    #[tokio::test]
    async fn a_retyped_column_keeps_its_original_definition() {
        let registry = StreamRegistry::new(test_config());
        let dir = tempfile::tempdir().unwrap();
        registry.on_schema(&schema_msg("public-orders", vec!["id"])).await.unwrap();

        let record = RecordMessage {
            stream: "public-orders".into(),
            record: json!({"id": 1, "name": "a"}),
            time_extracted: None,
            version: None,
        };
        registry.on_record(&record, dir.path()).await.unwrap();
        let (_, first_ctx) = registry.seal_batch("public-orders", dir.path()).await.unwrap().unwrap();
        assert!(first_ctx.ensure_table);

        let retyped = SchemaMessage {
            stream: "public-orders".into(),
            schema: json!({
                "type": "object",
                "properties": { "id": {"type": "string"}, "name": {"type": "string"} }
            }),
            key_properties: vec!["id".to_string()],
        };
        registry.on_schema(&retyped).await.unwrap();

        registry.on_record(&record, dir.path()).await.unwrap();
        let (_, ctx) = registry.seal_batch("public-orders", dir.path()).await.unwrap().unwrap();
        // No new column was added by the retype, so no fresh DDL is due.
        // The original NUMERIC definition for "id" is kept.
        assert!(!ctx.ensure_table);
    }

    #[test]
    fn drain_emittable_respects_gate_order() {
        let registry = StreamRegistry::new(test_config());
        registry.on_state(json!({"a": 1}), 2);
        registry.on_state(json!({"a": 2}), 5);

        assert!(registry.drain_emittable(1).is_empty());
        assert_eq!(registry.drain_emittable(2), vec![json!({"a": 1})]);
        assert!(registry.drain_emittable(2).is_empty());
        assert_eq!(registry.drain_emittable(10), vec![json!({"a": 2})]);
    }
}
