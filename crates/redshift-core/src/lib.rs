//! # redshift-core
//!
//! Protocol types, configuration, error taxonomy, and the thin
//! interface traits that the streaming ingest engine is built on top
//! of. This crate does no I/O itself; it is the shared vocabulary
//! between `redshift-schema` (pure normalization logic) and
//! `redshift-io` (the concrete engine: stage writer, S3 client,
//! warehouse sync, orchestrator, message loop).

pub mod config;
pub mod error;
pub mod message;
pub mod traits;

pub use config::{Compression, Config, SchemaMapping};
pub use error::{Result, TargetError};
pub use message::{ActivateVersionMessage, RecordMessage, SchemaMessage, StateMessage, TapMessage};
pub use traits::{ColumnInfo, StagingStore, Warehouse};
