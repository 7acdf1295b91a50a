//! The two thin interfaces the engine calls out to (§6): object-store
//! upload/delete and warehouse SQL execute/copy. Concrete
//! implementations backed by the `object_store` and `sqlx` crates
//! live in `redshift-io`; the engine itself only depends on these
//! traits, so tests can swap in in-memory fakes.

use async_trait::async_trait;

use crate::error::Result;

/// A column as reported by the warehouse's catalog (used to diff
/// against a flattened schema when deciding what to `ALTER TABLE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// The warehouse's own rendering of the type, e.g.
    /// `character varying(256)`.
    pub data_type: String,
}

/// Upload/delete against the staging area (S3 in production).
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Upload `bytes` to `key`, returning the fully qualified URI the
    /// warehouse's `COPY` command should read from.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String>;

    /// Remove a previously staged object. Called after a successful
    /// load; failures here are logged, not fatal. A stray staged
    /// object does not affect correctness.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// SQL execute/copy against the warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a DDL or DML statement with no result set.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Execute a `COPY ... FROM` statement. Kept distinct from
    /// `execute` because real drivers sometimes need different
    /// statement handling for bulk loads (e.g. a dedicated COPY
    /// protocol), even though both implementations below just run it
    /// as a statement over the pooled connection.
    async fn copy(&self, sql: &str) -> Result<u64>;

    /// List the columns of `schema.table`, or an empty vec if the
    /// table does not exist.
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// List the base tables of `schema`. Used to prime the catalog
    /// cache at startup (§4.5) without requiring a per-table round
    /// trip for every stream before its first flush.
    async fn tables(&self, schema: &str) -> Result<Vec<String>>;
}
