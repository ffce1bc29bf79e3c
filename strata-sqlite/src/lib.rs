//! Strata SQLite - Store Gateway over SQLite
//!
//! [`SqliteGateway`] runs statement templates through `rusqlite`. The
//! connection always sits inside an explicit transaction: `connect` begins
//! one, and `commit`/`rollback` end it and immediately begin the next, so
//! nothing reaches the database file until the caller commits.
//!
//! Booleans have no storage class of their own in SQLite; they are written
//! as integers and read back as [`Value::Int`].

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use strata_core::{Placeholder, Row, StoreError, StrataError, StrataResult, Value};
use strata_storage::{Statement, StoreGateway};

/// Data source names that open a private in-memory database.
const MEMORY_SOURCES: [&str; 2] = [":memory:", "memory"];

/// Store gateway backed by a SQLite database.
#[derive(Debug, Default)]
pub struct SqliteGateway {
    conn: Option<Connection>,
    source: Option<String>,
}

impl SqliteGateway {
    /// Create a disconnected gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected gateway over a fresh in-memory database.
    pub fn open_in_memory() -> StrataResult<Self> {
        let mut gateway = Self::new();
        gateway.connect(":memory:")?;
        Ok(gateway)
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Run one or more raw SQL statements (DDL, seeding) inside the current
    /// transaction.
    pub fn execute_batch(&mut self, sql: &str) -> StrataResult<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql)
            .map_err(|e| store_error("batch", e))?;
        tracing::debug!(bytes = sql.len(), "sqlite batch executed");
        Ok(())
    }

    fn connection(&self) -> StrataResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::NotConnected.into())
    }

    fn check_params(statement: &Statement, params: &[Value]) -> StrataResult<()> {
        let expected = statement.param_count();
        if expected != params.len() {
            return Err(StoreError::ParameterCount {
                relation: statement.relation().to_string(),
                expected,
                found: params.len(),
            }
            .into());
        }
        Ok(())
    }

    fn end_transaction(&mut self, verb: &str) -> StrataResult<()> {
        let conn = self.connection()?;
        conn.execute_batch(&format!("{verb}; BEGIN"))
            .map_err(|e| StoreError::TransactionFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

impl StoreGateway for SqliteGateway {
    fn connect(&mut self, source: &str) -> StrataResult<()> {
        if source.is_empty() {
            return Err(StoreError::Connection {
                source_name: source.to_string(),
                reason: "empty data source name".to_string(),
            }
            .into());
        }
        if self.conn.is_some() {
            self.close()?;
        }

        let connection_error = |e: rusqlite::Error| StoreError::Connection {
            source_name: source.to_string(),
            reason: e.to_string(),
        };
        let conn = if MEMORY_SOURCES.contains(&source) {
            Connection::open_in_memory()
        } else {
            Connection::open(source)
        }
        .map_err(connection_error)?;
        // Foreign key enforcement cannot change inside a transaction.
        conn.execute_batch("PRAGMA foreign_keys = ON; BEGIN")
            .map_err(connection_error)?;

        self.conn = Some(conn);
        self.source = Some(source.to_string());
        tracing::info!(source, "sqlite gateway connected");
        Ok(())
    }

    fn close(&mut self) -> StrataResult<()> {
        let conn = self.conn.take().ok_or(StoreError::NotConnected)?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")
                .map_err(|e| StoreError::TransactionFailed {
                    reason: e.to_string(),
                })?;
        }
        conn.close().map_err(|(_, e)| StoreError::Backend {
            reason: e.to_string(),
        })?;
        tracing::info!(source = ?self.source, "sqlite gateway closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn execute_query(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<Vec<Row>> {
        Self::check_params(statement, params)?;
        let relation = statement.relation();
        let conn = self.connection()?;
        tracing::debug!(sql = statement.sql(), params = params.len(), "sqlite query");

        let mut stmt = conn
            .prepare_cached(statement.sql())
            .map_err(|e| store_error(relation, e))?;
        let width = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sql)))
            .map_err(|e| store_error(relation, e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| store_error(relation, e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = row.get_ref(i).map_err(|e| store_error(relation, e))?;
                values.push(from_sql(relation, value)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_write(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<u64> {
        if !statement.operation().is_write() {
            return Err(StoreError::Backend {
                reason: format!("not a write: {}", statement.sql()),
            }
            .into());
        }
        Self::check_params(statement, params)?;
        let relation = statement.relation();
        let conn = self.connection()?;
        tracing::debug!(sql = statement.sql(), params = params.len(), "sqlite write");

        let mut stmt = conn
            .prepare_cached(statement.sql())
            .map_err(|e| store_error(relation, e))?;
        let affected = stmt
            .execute(params_from_iter(params.iter().map(to_sql)))
            .map_err(|e| store_error(relation, e))?;
        Ok(affected as u64)
    }

    fn commit(&mut self) -> StrataResult<()> {
        self.end_transaction("COMMIT")?;
        tracing::info!(source = ?self.source, "sqlite gateway commit");
        Ok(())
    }

    fn rollback(&mut self) -> StrataResult<()> {
        self.end_transaction("ROLLBACK")?;
        tracing::info!(source = ?self.source, "sqlite gateway rollback");
        Ok(())
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }
}

impl Drop for SqliteGateway {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "sqlite gateway close on drop failed");
            }
        }
    }
}

fn store_error(relation: &str, err: rusqlite::Error) -> StrataError {
    match err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::ConstraintViolation {
                relation: relation.to_string(),
                reason: message.unwrap_or_else(|| failure.to_string()),
            }
            .into()
        }
        other => StoreError::Backend {
            reason: format!("{relation}: {other}"),
        }
        .into(),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(relation: &str, value: ValueRef<'_>) -> StrataResult<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Backend {
                reason: format!("{relation}: invalid UTF-8 text: {e}"),
            })?;
            Value::Text(text.to_string())
        }
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    })
}
