//! Strata Core - Schema, Value and Error Types
//!
//! Pure data structures shared by every other Strata crate: the schema
//! descriptors that map classes onto relations, the column values and key
//! tuples exchanged with the backing store, configuration, and the error
//! taxonomy.

pub mod config;
pub mod error;
pub mod schema;
pub mod value;

pub use config::{LoadPolicy, Placeholder, StrataConfig};
pub use error::{
    AssociationError, ConfigError, IdentityError, SchemaError, StoreError, StrataError,
    StrataResult,
};
pub use schema::{AssociationDecl, Backing, Cardinality, SchemaBuilder, SchemaDescriptor};
pub use value::{Key, Value};

/// One row as exchanged with the backing store: column values in the order
/// of the statement's column list.
pub type Row = Vec<Value>;
