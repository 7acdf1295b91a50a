//! Configuration recognized by the engine. Loaded by the CLI wrapper
//! from a JSON file and handed to the engine whole; the engine itself
//! never touches the filesystem to find it (§1: config parsing is an
//! external collaborator's job).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_batch_size_rows() -> usize {
    100_000
}

fn default_max_parallelism() -> usize {
    16
}

fn default_copy_options() -> String {
    "EMPTYASNULL BLANKSASNULL TRIMBLANKS TRUNCATECOLUMNS TIMEFORMAT 'auto' COMPUPDATE OFF STATUPDATE OFF".to_string()
}

fn default_slices() -> usize {
    1
}

fn default_varchar_length() -> usize {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

impl Compression {
    /// File suffix appended to staged CSV file names.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Bzip2 => ".bz2",
        }
    }

    /// The keyword the fixed COPY clause substitutes, if any.
    pub fn copy_keyword(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("GZIP"),
            Compression::Bzip2 => Some("BZIP2"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchemaMapping {
    #[serde(default)]
    pub target_schema: Option<String>,
    #[serde(default)]
    pub target_schema_select_permissions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Warehouse connection.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,

    // Credentials for the object store + COPY.
    #[serde(default)]
    pub aws_profile: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub aws_session_token: Option<String>,
    #[serde(default)]
    pub aws_redshift_copy_role_arn: Option<String>,

    // Staging location.
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_key_prefix: String,
    #[serde(default)]
    pub s3_acl: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,

    // Default target schema + per-source-schema overrides.
    pub default_target_schema: String,
    #[serde(default)]
    pub default_target_schema_select_permissions: Vec<String>,
    #[serde(default)]
    pub schema_mapping: HashMap<String, SchemaMapping>,

    // Batching policy.
    #[serde(default = "default_batch_size_rows")]
    pub batch_size_rows: usize,
    #[serde(default)]
    pub flush_all_streams: bool,

    // Flush worker pool sizing. 0 = one worker per active stream,
    // -1 = CPU count, positive = exact value.
    #[serde(default)]
    pub parallelism: i64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    // Staging layout.
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_slices")]
    pub slices: usize,

    #[serde(default = "default_copy_options")]
    pub copy_options: String,

    // Metadata + delete semantics.
    #[serde(default)]
    pub add_metadata_columns: bool,
    #[serde(default)]
    pub hard_delete: bool,

    // Flattening depth.
    #[serde(default)]
    pub data_flattening_max_level: usize,

    // Record handling policy.
    #[serde(default = "default_true")]
    pub primary_key_required: bool,
    #[serde(default)]
    pub validate_records: bool,
    #[serde(default)]
    pub skip_updates: bool,

    #[serde(default)]
    pub disable_table_cache: bool,

    #[serde(default)]
    pub temp_dir: Option<String>,

    #[serde(default = "default_varchar_length")]
    pub varchar_length: usize,
}

fn default_port() -> u16 {
    5439
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Enabling `hard_delete` implies `add_metadata_columns` (§4.5).
    pub fn add_metadata_columns(&self) -> bool {
        self.add_metadata_columns || self.hard_delete
    }

    /// Resolve the target schema + grant list for a source-qualified
    /// stream's leading (catalog/schema) component, falling back to
    /// the configured default.
    pub fn resolve_target_schema(&self, source_schema: &str) -> String {
        self.schema_mapping
            .get(source_schema)
            .and_then(|m| m.target_schema.clone())
            .unwrap_or_else(|| self.default_target_schema.clone())
    }

    pub fn resolve_select_grants(&self, source_schema: &str) -> Vec<String> {
        self.schema_mapping
            .get(source_schema)
            .map(|m| m.target_schema_select_permissions.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.default_target_schema_select_permissions.clone())
    }

    /// `s3_key_prefix` with exactly one trailing `/`, or empty if the
    /// prefix itself is empty. Used to build staged object keys
    /// without a leading `/` when no prefix is configured.
    pub fn s3_key_prefix_with_separator(&self) -> String {
        if self.s3_key_prefix.is_empty() {
            String::new()
        } else if self.s3_key_prefix.ends_with('/') {
            self.s3_key_prefix.clone()
        } else {
            format!("{}/", self.s3_key_prefix)
        }
    }

    /// Effective worker-pool size per §4.7: configured value if
    /// positive, CPU count if `-1`, `active_streams` if `0`.
    pub fn effective_parallelism(&self, active_streams: usize) -> usize {
        let effective = if self.parallelism > 0 {
            self.parallelism as usize
        } else if self.parallelism == -1 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            active_streams.max(1)
        };
        effective.min(self.max_parallelism).max(1)
    }
}
