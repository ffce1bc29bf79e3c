//! Strata Storage - Store Gateway Trait and In-Memory Implementation
//!
//! Defines the gateway abstraction the mapper issues statements through,
//! the statement templates it issues, and an in-memory gateway. The SQLite
//! implementation lives in strata-sqlite.

pub mod gateway;
pub mod memory;
pub mod statement;

pub use gateway::StoreGateway;
pub use memory::{LoggedStatement, MemoryGateway, TableDef};
pub use statement::{quote_ident, Operation, Statement};

pub use strata_core::Row;
