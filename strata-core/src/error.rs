//! Error types for Strata operations

use crate::Key;
use thiserror::Error;

/// Schema descriptor and class registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Class {class} has an empty relation name")]
    EmptyRelation { class: String },

    #[error("Class {class} declares no columns")]
    NoColumns { class: String },

    #[error("Column {column} is declared twice in class {class}")]
    DuplicateColumn { class: String, column: String },

    #[error("Class {class} declares no key columns")]
    EmptyKey { class: String },

    #[error("Key column {column} of class {class} is not a declared column")]
    UnknownKeyColumn { class: String, column: String },

    #[error("Column {column} is not declared in class {class}")]
    UnknownColumn { class: String, column: String },

    #[error("Association {name} collides with another attribute of class {class}")]
    DuplicateAssociation { class: String, name: String },

    #[error("Association {class}.{name} is invalid: {reason}")]
    InvalidAssociation {
        class: String,
        name: String,
        reason: String,
    },

    #[error("Class {class} is not registered")]
    UnknownClass { class: String },

    #[error("Class {class} is registered twice")]
    DuplicateClass { class: String },
}

/// Association membership errors. Always raised synchronously by
/// `append`/`remove`, never deferred to write-back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssociationError {
    #[error("Association {association} expects {expected} objects, got {found}")]
    WrongClass {
        association: String,
        expected: String,
        found: String,
    },

    #[error("Object of class {class} is already a member of association {association}")]
    AlreadyMember { association: String, class: String },

    #[error("Object of class {class} is not a member of association {association}")]
    NotMember { association: String, class: String },

    #[error("Single-valued association {association} already holds an object")]
    Occupied { association: String },

    #[error("Class {class} has no association named {name}")]
    UnknownAssociation { class: String, name: String },
}

/// Identity cache lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("No {class} object with key {key}")]
    NotFound { class: String, key: Key },

    #[error("A different {class} object is already cached under key {key}")]
    DuplicateKey { class: String, key: Key },

    #[error("Key {key} of class {class} contains null values")]
    IncompleteKey { class: String, key: Key },
}

/// Backing store errors, surfaced verbatim to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store gateway is not connected")]
    NotConnected,

    #[error("Connection to {source_name} failed: {reason}")]
    Connection { source_name: String, reason: String },

    #[error("Constraint violated on {relation}: {reason}")]
    ConstraintViolation { relation: String, reason: String },

    #[error("Relation {relation} does not exist")]
    UnknownRelation { relation: String },

    #[error("Relation {relation} has no column {column}")]
    UnknownColumn { relation: String, column: String },

    #[error("Statement on {relation} expects {expected} parameters, got {found}")]
    ParameterCount {
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("Row from {relation} has {found} values, expected {expected}")]
    RowArity {
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("Object of class {class} has no assigned key; add it before writing")]
    UnassignedKey { class: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Strata errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Association error: {0}")]
    Association(#[from] AssociationError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StrataError {
    /// True for errors raised by the backing store itself.
    pub fn is_store(&self) -> bool {
        matches!(self, StrataError::Store(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::Identity(IdentityError::NotFound { .. }))
    }
}

/// Result type alias for Strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================
