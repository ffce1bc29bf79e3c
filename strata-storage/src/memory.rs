//! In-memory store gateway.
//!
//! Executes statement templates against in-memory tables using their
//! structured [`Operation`], with SQL semantics where they matter to the
//! mapper: NULL never equals anything in a filter, unique constraints ignore
//! tuples containing NULL, and `rollback` restores the last committed state.
//! Every statement issued is kept in a log so callers can assert exactly
//! which writes reached the store.

use std::collections::HashSet;

use indexmap::IndexMap;
use strata_core::{Key, Placeholder, Row, StoreError, StrataResult, Value};

use crate::gateway::StoreGateway;
use crate::statement::{Operation, Statement};

/// Relation definition for [`MemoryGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub relation: String,
    pub columns: Vec<String>,
    pub not_null: Vec<String>,
    pub unique: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new<S: Into<String>>(relation: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            relation: relation.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            not_null: Vec::new(),
            unique: Vec::new(),
        }
    }

    /// Primary key: unique and not null.
    pub fn primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        self.not_null.extend(columns.iter().cloned());
        self.unique.push(columns);
        self
    }

    pub fn unique<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn not_null<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.not_null.extend(columns.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    def: TableDef,
    rows: Vec<Row>,
    not_null: Vec<usize>,
    unique: Vec<Vec<usize>>,
}

impl Table {
    fn new(def: TableDef) -> StrataResult<Self> {
        let mut table = Self {
            def,
            rows: Vec::new(),
            not_null: Vec::new(),
            unique: Vec::new(),
        };
        table.not_null = table.positions(&table.def.not_null)?;
        let unique = table
            .def
            .unique
            .iter()
            .map(|cols| table.positions(cols))
            .collect::<StrataResult<Vec<_>>>()?;
        table.unique = unique;
        Ok(table)
    }

    fn position(&self, column: &str) -> StrataResult<usize> {
        self.def
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| {
                StoreError::UnknownColumn {
                    relation: self.def.relation.clone(),
                    column: column.to_string(),
                }
                .into()
            })
    }

    fn positions(&self, columns: &[String]) -> StrataResult<Vec<usize>> {
        columns.iter().map(|c| self.position(c)).collect()
    }

    fn matches(row: &Row, filter: &[usize], params: &[Value]) -> bool {
        filter
            .iter()
            .zip(params)
            .all(|(&pos, param)| !param.is_null() && row[pos] == *param)
    }

    /// Validate not-null and unique constraints over a candidate row set.
    fn check(&self, rows: &[Row]) -> StrataResult<()> {
        for row in rows {
            if let Some(&pos) = self.not_null.iter().find(|&&pos| row[pos].is_null()) {
                return Err(self.violation(format!(
                    "null value in column {} violates not-null constraint",
                    self.def.columns[pos]
                )));
            }
        }

        for (set, positions) in self.unique.iter().enumerate() {
            let mut seen = HashSet::with_capacity(rows.len());
            for row in rows {
                let tuple: Vec<Value> = positions.iter().map(|&p| row[p].clone()).collect();
                if tuple.iter().any(Value::is_null) {
                    continue;
                }
                if !seen.insert(tuple.clone()) {
                    return Err(self.violation(format!(
                        "duplicate key {} violates unique constraint ({})",
                        Key::new(tuple),
                        self.def.unique[set].join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    fn violation(&self, reason: String) -> strata_core::StrataError {
        StoreError::ConstraintViolation {
            relation: self.def.relation.clone(),
            reason,
        }
        .into()
    }

    fn insert(&mut self, columns: &[String], params: &[Value]) -> StrataResult<u64> {
        let positions = self.positions(columns)?;
        let mut row = vec![Value::Null; self.def.columns.len()];
        for (&pos, value) in positions.iter().zip(params) {
            row[pos] = value.clone();
        }
        let mut candidate = self.rows.clone();
        candidate.push(row);
        self.check(&candidate)?;
        self.rows = candidate;
        Ok(1)
    }
}

/// Statement as it was issued to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub sql: String,
    pub operation: Operation,
    pub params: Vec<Value>,
}

impl LoggedStatement {
    pub fn is_write(&self) -> bool {
        self.operation.is_write()
    }
}

/// In-memory store gateway for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    tables: IndexMap<String, Table>,
    committed: IndexMap<String, Table>,
    connected: bool,
    source: Option<String>,
    placeholder: Placeholder,
    log: Vec<LoggedStatement>,
}

impl MemoryGateway {
    /// Create an empty, disconnected gateway.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_placeholder(mut self, placeholder: Placeholder) -> Self {
        self.placeholder = placeholder;
        self
    }

    /// Define a relation. Definitions are not transactional.
    pub fn create_table(&mut self, def: TableDef) -> StrataResult<()> {
        if self.tables.contains_key(&def.relation) {
            return Err(StoreError::Backend {
                reason: format!("relation {} already exists", def.relation),
            }
            .into());
        }
        let table = Table::new(def)?;
        self.committed.insert(table.def.relation.clone(), table.clone());
        self.tables.insert(table.def.relation.clone(), table);
        Ok(())
    }

    /// Insert full-width rows as already-committed data.
    pub fn seed(&mut self, relation: &str, rows: Vec<Row>) -> StrataResult<()> {
        for target in [&mut self.tables, &mut self.committed] {
            let table = target
                .get_mut(relation)
                .ok_or_else(|| StoreError::UnknownRelation {
                    relation: relation.to_string(),
                })?;
            let width = table.def.columns.len();
            for row in &rows {
                if row.len() != width {
                    return Err(StoreError::RowArity {
                        relation: relation.to_string(),
                        expected: width,
                        found: row.len(),
                    }
                    .into());
                }
            }
            let mut candidate = table.rows.clone();
            candidate.extend(rows.iter().cloned());
            table.check(&candidate)?;
            table.rows = candidate;
        }
        Ok(())
    }

    /// Current (uncommitted) rows of a relation, in storage order.
    pub fn rows(&self, relation: &str) -> StrataResult<Vec<Row>> {
        self.tables
            .get(relation)
            .map(|t| t.rows.clone())
            .ok_or_else(|| {
                StoreError::UnknownRelation {
                    relation: relation.to_string(),
                }
                .into()
            })
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Every statement issued since creation or the last [`clear_log`](Self::clear_log).
    pub fn log(&self) -> &[LoggedStatement] {
        &self.log
    }

    /// Only the write statements of the log.
    pub fn writes(&self) -> Vec<&LoggedStatement> {
        self.log.iter().filter(|s| s.is_write()).collect()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn ensure_connected(&self) -> StrataResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(StoreError::NotConnected.into())
        }
    }

    fn record(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<()> {
        self.ensure_connected()?;
        tracing::debug!(sql = statement.sql(), params = params.len(), "memory gateway statement");
        self.log.push(LoggedStatement {
            sql: statement.sql().to_string(),
            operation: statement.operation().clone(),
            params: params.to_vec(),
        });
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

    fn table_mut(&mut self, relation: &str) -> StrataResult<&mut Table> {
        self.tables.get_mut(relation).ok_or_else(|| {
            StoreError::UnknownRelation {
                relation: relation.to_string(),
            }
            .into()
        })
    }
}

impl StoreGateway for MemoryGateway {
    fn connect(&mut self, source: &str) -> StrataResult<()> {
        if source.is_empty() {
            return Err(StoreError::Connection {
                source_name: source.to_string(),
                reason: "empty data source name".to_string(),
            }
            .into());
        }
        self.connected = true;
        self.source = Some(source.to_string());
        self.committed = self.tables.clone();
        tracing::info!(source, "memory gateway connected");
        Ok(())
    }

    fn close(&mut self) -> StrataResult<()> {
        self.ensure_connected()?;
        self.tables = self.committed.clone();
        self.connected = false;
        tracing::info!(source = ?self.source, "memory gateway closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn execute_query(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<Vec<Row>> {
        self.record(statement, params)?;
        let Operation::Select {
            relation,
            columns,
            filter,
        } = statement.operation()
        else {
            return Err(StoreError::Backend {
                reason: format!("not a query: {}", statement.sql()),
            }
            .into());
        };

        let table = self.table_mut(relation)?;
        let projection = table.positions(columns)?;
        let filter = table.positions(filter)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| Table::matches(row, &filter, params))
            .map(|row| projection.iter().map(|&p| row[p].clone()).collect())
            .collect())
    }

    fn execute_write(&mut self, statement: &Statement, params: &[Value]) -> StrataResult<u64> {
        self.record(statement, params)?;
        match statement.operation() {
            Operation::Insert { relation, columns } => self.table_mut(relation)?.insert(columns, params),
            Operation::Update {
                relation,
                columns,
                filter,
            } => {
                let table = self.table_mut(relation)?;
                let set = table.positions(columns)?;
                let filter = table.positions(filter)?;
                let (values, filter_params) = params.split_at(set.len());

                let mut candidate = table.rows.clone();
                let mut affected = 0;
                for row in candidate.iter_mut() {
                    if Table::matches(row, &filter, filter_params) {
                        for (&pos, value) in set.iter().zip(values) {
                            row[pos] = value.clone();
                        }
                        affected += 1;
                    }
                }
                table.check(&candidate)?;
                table.rows = candidate;
                Ok(affected)
            }
            Operation::Delete { relation, filter } => {
                let table = self.table_mut(relation)?;
                let filter = table.positions(filter)?;
                let before = table.rows.len();
                table.rows.retain(|row| !Table::matches(row, &filter, params));
                Ok((before - table.rows.len()) as u64)
            }
            Operation::Select { .. } => Err(StoreError::Backend {
                reason: format!("not a write: {}", statement.sql()),
            }
            .into()),
        }
    }

    fn commit(&mut self) -> StrataResult<()> {
        self.ensure_connected()?;
        self.committed = self.tables.clone();
        tracing::info!("memory gateway commit");
        Ok(())
    }

    fn rollback(&mut self) -> StrataResult<()> {
        self.ensure_connected()?;
        self.tables = self.committed.clone();
        tracing::info!("memory gateway rollback");
        Ok(())
    }

    fn placeholder(&self) -> Placeholder {
        self.placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn article_store() -> MemoryGateway {
        let mut gw = MemoryGateway::new();
        gw.create_table(
            TableDef::new("article", ["id", "name", "price"])
                .primary_key(["id"])
                .unique(["name"])
                .not_null(["name"]),
        )
        .unwrap();
        gw.seed(
            "article",
            vec![
                vec![Value::Int(1), "apple".into(), Value::Real(2.33)],
                vec![Value::Int(2), "peach".into(), Value::Real(2.34)],
            ],
        )
        .unwrap();
        gw.connect("memory").unwrap();
        gw
    }

    #[test]
    fn test_requires_connection() {
        let mut gw = MemoryGateway::new();
        gw.create_table(TableDef::new("t", ["id"])).unwrap();
        let stmt = Statement::select("t", cols(&["id"]), vec![], Placeholder::Question);
        let err = gw.execute_query(&stmt, &[]).unwrap_err();
        assert_eq!(err, strata_core::StrataError::from(StoreError::NotConnected));
    }

    #[test]
    fn test_select_with_filter_and_null_semantics() {
        let mut gw = article_store();
        let stmt = Statement::select("article", cols(&["name"]), cols(&["id"]), Placeholder::Question);
        let rows = gw.execute_query(&stmt, &[Value::Int(2)]).unwrap();
        assert_eq!(rows, vec![vec![Value::Text("peach".into())]]);

        let rows = gw.execute_query(&stmt, &[Value::Null]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unique_violation_leaves_table_unchanged() {
        let mut gw = article_store();
        let insert = Statement::insert("article", cols(&["id", "name", "price"]), Placeholder::Question);
        let err = gw
            .execute_write(&insert, &[Value::Int(3), "apple".into(), Value::Real(1.0)])
            .unwrap_err();
        assert!(matches!(
            err,
            strata_core::StrataError::Store(StoreError::ConstraintViolation { .. })
        ));
        assert_eq!(gw.rows("article").unwrap().len(), 2);
    }

    #[test]
    fn test_not_null_violation_on_update() {
        let mut gw = article_store();
        let update = Statement::update("article", cols(&["name"]), cols(&["id"]), Placeholder::Question);
        let err = gw.execute_write(&update, &[Value::Null, Value::Int(1)]).unwrap_err();
        assert!(err.is_store());
        assert_eq!(gw.rows("article").unwrap()[0][1], Value::Text("apple".into()));
    }

    #[test]
    fn test_rollback_restores_committed_rows() {
        let mut gw = article_store();
        let delete = Statement::delete("article", cols(&["id"]), Placeholder::Question);
        assert_eq!(gw.execute_write(&delete, &[Value::Int(1)]).unwrap(), 1);
        assert_eq!(gw.rows("article").unwrap().len(), 1);
        gw.rollback().unwrap();
        assert_eq!(gw.rows("article").unwrap().len(), 2);

        gw.execute_write(&delete, &[Value::Int(1)]).unwrap();
        gw.commit().unwrap();
        gw.rollback().unwrap();
        assert_eq!(gw.rows("article").unwrap().len(), 1);
    }

    #[test]
    fn test_log_records_writes() {
        let mut gw = article_store();
        let select = Statement::select("article", cols(&["id"]), vec![], Placeholder::Question);
        let update = Statement::update("article", cols(&["price"]), cols(&["id"]), Placeholder::Question);
        gw.execute_query(&select, &[]).unwrap();
        gw.execute_write(&update, &[Value::Real(3.0), Value::Int(2)]).unwrap();
        assert_eq!(gw.log().len(), 2);
        assert_eq!(gw.writes().len(), 1);
        assert_eq!(gw.writes()[0].params, vec![Value::Real(3.0), Value::Int(2)]);
        gw.clear_log();
        assert!(gw.log().is_empty());
    }

    #[test]
    fn test_parameter_count_checked() {
        let mut gw = article_store();
        let delete = Statement::delete("article", cols(&["id"]), Placeholder::Question);
        let err = gw.execute_write(&delete, &[]).unwrap_err();
        assert!(matches!(
            err,
            strata_core::StrataError::Store(StoreError::ParameterCount { expected: 1, found: 0, .. })
        ));
    }
}
