//! # redshift-io
//!
//! The concrete engine (§4.4–§4.8): the stage writer, the S3-backed
//! `StagingStore` and Postgres-wire-protocol-backed `Warehouse`
//! implementations, warehouse sync (DDL/COPY/merge), the stream
//! registry, the bounded-parallelism flush orchestrator, and the
//! stdin/stdout message loop that ties them together. Everything
//! here is built against `redshift_core`'s traits and
//! `redshift_schema`'s pure normalization logic. This crate is the
//! only one that touches the filesystem, the network, or the
//! warehouse.

pub mod engine;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod s3_store;
pub mod slicing;
pub mod stage;
pub mod sync;
pub mod warehouse_pg;

pub use engine::{Engine, EngineExit};
pub use orchestrator::FlushOrchestrator;
pub use registry::StreamRegistry;
pub use s3_store::S3StagingStore;
pub use stage::{sweep_scratch_dir, Batch, SealedBatch, StageFile};
pub use sync::{DeclaredColumn, LoadContext, LoadOutcome, WarehouseSync};
pub use warehouse_pg::PgWarehouse;
