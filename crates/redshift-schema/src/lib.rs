//! # redshift-schema
//!
//! Pure, I/O-free logic for turning a tap's declared JSON-Schema and
//! records into warehouse-ready shapes (§4.1–4.3): identifier and
//! type mapping, schema flattening, and record normalization into CSV
//! rows. Nothing here touches the filesystem, the network, or the
//! warehouse; `redshift-io` is the only crate that calls out.

pub mod flatten;
pub mod identifier;
pub mod normalize;
pub mod types;

pub use flatten::{flatten, merge, FlatColumn, FlatSchema, FlattenError};
pub use identifier::{key_column_name, quote_always, quote_identifier, safe_column_name, safe_table_name};
pub use normalize::{normalize_record, primary_key_signature, NormalizedRow, RecordMetadata, METADATA_COLUMNS};
pub use types::{column_type, WarehouseType, DEFAULT_VARCHAR_LENGTH};
