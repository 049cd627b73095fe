//! tabstore Core Library
//!
//! This crate exposes buckets of schema-governed rows (create, delete,
//! describe, read, write) on top of a CKAN DataStore reached over its HTTP
//! action API.
//!
//! # Architecture
//!
//! - **Schema**: canonical, backend-independent table schema and cell types
//! - **Mapper**: pure conversions between canonical and DataStore types,
//!   rows and records
//! - **Storage**: bucket lifecycle, paginated listing and row streaming,
//!   with in-memory caches of the bucket list and descriptors
//! - **Transport**: the seam that actually executes HTTP requests
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let mut storage = Storage::from_config(&config)?;
//!
//! // Create a bucket and fill it
//! storage.create("articles", vec![descriptor], false)?;
//! storage.write("articles", rows, DEFAULT_WRITE_METHOD)?;
//!
//! // Read it back
//! let rows = storage.read("articles")?;
//! ```
//!
//! # Modules
//!
//! - `storage`: storage adapter (main entry point) and errors
//! - `schema`: descriptors, fields and canonical cells
//! - `mapper`: DataStore type and value mapping
//! - `transport`: request transport and the HTTP implementation
//! - `config`: application configuration

pub mod config;
pub mod mapper;
pub mod schema;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use schema::{Cell, Descriptor, Field, FieldType, PrimaryKey, Row};
pub use storage::{
    PreparedWrite, RowIter, Selection, Storage, StorageError, StorageResult, WriteStream,
    DEFAULT_WRITE_METHOD,
};
pub use transport::{Credential, HttpTransport, Request, Transport};
