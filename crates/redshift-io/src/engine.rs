//! The tap-to-target message loop (§4's "Message loop" component,
//! §5, §6): reads newline-delimited JSON messages from the tap,
//! dispatches them to the registry and orchestrator, and writes
//! gated `STATE` checkpoints to the output. Single-threaded and
//! synchronous over its input per §5: the only suspension points are
//! reading the next line, appending to a stage file (inside
//! `StreamRegistry::on_record`), and submitting a flush.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use redshift_core::config::Config;
use redshift_core::error::{Result, TargetError};
use redshift_core::message::TapMessage;
use redshift_core::traits::{StagingStore, Warehouse};

use crate::orchestrator::FlushOrchestrator;
use crate::registry::StreamRegistry;
use crate::stage::sweep_scratch_dir;
use crate::sync::WarehouseSync;

/// How long the loop waits for in-flight flushes to finish after a
/// shutdown signal before sweeping scratch and exiting anyway (§5).
const SIGNAL_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// How the loop exited, so the CLI wrapper can choose the matching
/// exit code (§6: 0 on clean EOF, 130 on signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Clean,
    Signalled,
}

/// Owns the registry and orchestrator and drives the message loop
/// over a given reader/writer pair. Generic over the I/O types so
/// tests can exercise it against in-memory buffers instead of real
/// stdin/stdout.
pub struct Engine {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    orchestrator: FlushOrchestrator,
    scratch_dir: PathBuf,
}

impl Engine {
    pub fn new(config: Arc<Config>, warehouse: Arc<dyn Warehouse>, staging: Arc<dyn StagingStore>) -> Self {
        let sync = Arc::new(WarehouseSync::new(warehouse, staging, config.clone()));
        let registry = Arc::new(StreamRegistry::new(config.clone()));
        let pool_size = config.effective_parallelism(1);
        let orchestrator = FlushOrchestrator::new(sync, pool_size);
        let scratch_dir = config
            .temp_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Self { config, registry, orchestrator, scratch_dir }
    }

    /// Prime the catalog cache over the schemas this run's config
    /// references (§4.5), before the loop reads its first line.
    pub async fn prime_catalog(&self, schemas: &[String]) -> Result<()> {
        self.orchestrator.sync().prime_catalog_cache(schemas).await
    }

    /// Run the message loop to completion: either clean EOF (flushing
    /// every stream's remaining rows first) or a cancellation signal
    /// (flushing nothing new, waiting out the grace period for
    /// in-flight work).
    pub async fn run<R, W>(&self, reader: R, mut writer: W, shutdown: CancellationToken) -> Result<EngineExit>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return self.shutdown_on_signal().await;
                }
                next = lines.next_line() => {
                    match next.map_err(|e| TargetError::Fatal(e.into()))? {
                        Some(line) => {
                            if !line.trim().is_empty() {
                                self.handle_line(&line, &mut writer).await?;
                            }
                        }
                        None => return self.finish_clean(&mut writer).await,
                    }
                }
            }
        }
    }

    async fn handle_line<W: AsyncWrite + Unpin>(&self, line: &str, writer: &mut W) -> Result<()> {
        let message: TapMessage = serde_json::from_str(line)
            .map_err(|e| TargetError::protocol(format!("malformed message: {e}")))?;

        match message {
            TapMessage::Schema(msg) => {
                let stream = msg.stream.clone();
                self.registry.on_schema(&msg).await?;
                self.orchestrator
                    .resize(self.config.effective_parallelism(self.registry.active_stream_count()));
                info!(stream, "stream registered");
            }
            TapMessage::Record(msg) => {
                let stream = msg.stream.clone();
                let batch_full = self.registry.on_record(&msg, &self.scratch_dir).await?;
                if batch_full {
                    if self.config.flush_all_streams {
                        self.flush_all().await?;
                    } else {
                        self.orchestrator
                            .flush_stream(&self.registry, &stream, &self.scratch_dir)
                            .await?;
                    }
                }
            }
            TapMessage::ActivateVersion(msg) => {
                self.registry.on_activate_version(&msg).await?;
            }
            TapMessage::State(msg) => {
                let gate = self.orchestrator.current_seq();
                self.registry.on_state(msg.value, gate);
            }
        }

        self.drain_states(writer).await
    }

    async fn flush_all(&self) -> Result<()> {
        for stream in self.registry.stream_names() {
            self.orchestrator
                .flush_stream(&self.registry, &stream, &self.scratch_dir)
                .await?;
        }
        Ok(())
    }

    async fn drain_states<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        self.orchestrator.check()?;
        let watermark = self.orchestrator.watermark();
        for value in self.registry.drain_emittable(watermark) {
            let line = serde_json::to_string(&value).map_err(|e| TargetError::Fatal(e.into()))?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| TargetError::Fatal(e.into()))?;
            writer.write_all(b"\n").await.map_err(|e| TargetError::Fatal(e.into()))?;
        }
        writer.flush().await.map_err(|e| TargetError::Fatal(e.into()))?;
        Ok(())
    }

    async fn finish_clean<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<EngineExit> {
        self.flush_all().await?;
        let wait_result = self.orchestrator.wait_idle().await;
        // Emit whatever cleared even if `wait_idle` ultimately surfaces
        // a failure. Flushes that did commit still earn their STATE.
        let _ = self.drain_states(writer).await;
        wait_result?;

        sweep_scratch_dir(&self.scratch_dir)?;
        info!("clean shutdown, scratch directory swept");
        Ok(EngineExit::Clean)
    }

    async fn shutdown_on_signal(&self) -> Result<EngineExit> {
        warn!("shutdown signal received; no further flushes will be submitted");
        if tokio::time::timeout(SIGNAL_GRACE_PERIOD, self.orchestrator.wait_idle())
            .await
            .is_err()
        {
            warn!("grace period elapsed with flushes still in flight");
        }
        sweep_scratch_dir(&self.scratch_dir)?;
        Ok(EngineExit::Signalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use redshift_core::config::Compression;
    use redshift_core::traits::ColumnInfo;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;

    struct RecordingWarehouse {
        executed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn execute(&self, sql: &str) -> Result<()> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(())
        }
        async fn copy(&self, sql: &str) -> Result<u64> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(1)
        }
        async fn columns(&self, _schema: &str, _table: &str) -> Result<Vec<ColumnInfo>> {
            Ok(vec![])
        }
        async fn tables(&self, _schema: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct RecordingStaging;

    #[async_trait]
    impl StagingStore for RecordingStaging {
        async fn put(&self, key: &str, _bytes: Vec<u8>) -> Result<String> {
            Ok(format!("s3://bucket/{key}"))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(batch_size_rows: usize) -> Arc<Config> {
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
            batch_size_rows,
            flush_all_streams: false,
            parallelism: 1,
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
            disable_table_cache: true,
            temp_dir: None,
            varchar_length: 10_000,
        })
    }

    /// Scenario S6 (§8): batch_size_rows=2, `S R R STATE{a:1} R R
    /// STATE{a:2} EOF` emits exactly two state lines, in order.
    #[tokio::test]
    async fn batch_boundary_gates_state_emission_in_order() {
        let config = test_config(2);
        let warehouse = Arc::new(RecordingWarehouse { executed: StdMutex::new(vec![]) });
        let engine = Engine::new(config, warehouse, Arc::new(RecordingStaging));

        let input = concat!(
            r#"{"type":"SCHEMA","stream":"public-orders","schema":{"type":"object","properties":{"id":{"type":"integer"}}},"key_properties":[]}"#, "\n",
            r#"{"type":"RECORD","stream":"public-orders","record":{"id":1}}"#, "\n",
            r#"{"type":"RECORD","stream":"public-orders","record":{"id":2}}"#, "\n",
            r#"{"type":"STATE","value":{"a":1}}"#, "\n",
            r#"{"type":"RECORD","stream":"public-orders","record":{"id":3}}"#, "\n",
            r#"{"type":"RECORD","stream":"public-orders","record":{"id":4}}"#, "\n",
            r#"{"type":"STATE","value":{"a":2}}"#, "\n",
        );

        let reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let exit = engine.run(reader, &mut out, CancellationToken::new()).await.unwrap();
        assert_eq!(exit, EngineExit::Clean);

        let output = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"a":2}"#]);
    }

    #[tokio::test]
    async fn record_before_schema_is_a_protocol_error() {
        let config = test_config(100_000);
        let warehouse = Arc::new(RecordingWarehouse { executed: StdMutex::new(vec![]) });
        let engine = Engine::new(config, warehouse, Arc::new(RecordingStaging));

        let input = "{\"type\":\"RECORD\",\"stream\":\"orders\",\"record\":{\"id\":1}}\n";
        let reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let err = engine.run(reader, &mut out, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TargetError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_message_type_is_a_protocol_error() {
        let config = test_config(100_000);
        let warehouse = Arc::new(RecordingWarehouse { executed: StdMutex::new(vec![]) });
        let engine = Engine::new(config, warehouse, Arc::new(RecordingStaging));

        let input = "{\"type\":\"BOGUS\"}\n";
        let reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let err = engine.run(reader, &mut out, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TargetError::Protocol(_)));
    }

    #[tokio::test]
    async fn signal_before_any_input_sweeps_and_exits_signalled() {
        let config = test_config(100_000);
        let warehouse = Arc::new(RecordingWarehouse { executed: StdMutex::new(vec![]) });
        let engine = Engine::new(config, warehouse, Arc::new(RecordingStaging));

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let reader = Cursor::new(Vec::new());
        let mut out = Vec::new();
        let exit = engine.run(reader, &mut out, shutdown).await.unwrap();
        assert_eq!(exit, EngineExit::Signalled);
    }
}
