//! Store gateway contract.

use crate::statement::Statement;
use strata_core::{Placeholder, Row, StrataResult, Value};

/// Thin wrapper over a backing store connection.
///
/// A gateway owns the connection and the transaction boundary. Every call is
/// synchronous and completes (or fails) before returning; callers serialize
/// access, so implementations need no internal locking.
pub trait StoreGateway {
    /// Open a connection to the named data source and begin a transaction.
    fn connect(&mut self, source: &str) -> StrataResult<()>;

    /// Close the connection. Uncommitted work is discarded.
    fn close(&mut self) -> StrataResult<()>;

    fn is_connected(&self) -> bool;

    /// Run a select template, returning rows in the order the store yields them.
    fn execute_query(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<Vec<Row>>;

    /// Run a write template, returning the number of affected rows.
    fn execute_write(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<u64>;

    fn commit(&mut self) -> StrataResult<()>;

    fn rollback(&mut self) -> StrataResult<()>;

    /// Placeholder convention the driver expects.
    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }
}

impl<G: StoreGateway + ?Sized> StoreGateway for Box<G> {
    fn connect(&mut self, source: &str) -> StrataResult<()> {
        (**self).connect(source)
    }

    fn close(&mut self) -> StrataResult<()> {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn execute_query(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<Vec<Row>> {
        (**self).execute_query(statement, params)
    }

    fn execute_write(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<u64> {
        (**self).execute_write(statement, params)
    }

    fn commit(&mut self) -> StrataResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> StrataResult<()> {
        (**self).rollback()
    }

    fn placeholder(&self) -> Placeholder {
        (**self).placeholder()
    }
}
