//! Parameterized statement templates.
//!
//! A [`Statement`] carries both the rendered SQL text, for drivers that speak
//! SQL, and the structured [`Operation`] it was rendered from, so in-memory
//! gateways can execute it without parsing. Identifiers are always quoted so
//! reserved words such as `order` work as relation or column names.

use strata_core::Placeholder;

/// Structured form of a statement. Every filter is a conjunction of
/// `column = ?` equalities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Select {
        relation: String,
        columns: Vec<String>,
        filter: Vec<String>,
    },
    Insert {
        relation: String,
        columns: Vec<String>,
    },
    /// Parameters are the `columns` values followed by the `filter` values.
    Update {
        relation: String,
        columns: Vec<String>,
        filter: Vec<String>,
    },
    Delete {
        relation: String,
        filter: Vec<String>,
    },
}

impl Operation {
    pub fn relation(&self) -> &str {
        match self {
            Operation::Select { relation, .. }
            | Operation::Insert { relation, .. }
            | Operation::Update { relation, .. }
            | Operation::Delete { relation, .. } => relation,
        }
    }

    /// Number of positional parameters the statement binds.
    pub fn param_count(&self) -> usize {
        match self {
            Operation::Select { filter, .. } | Operation::Delete { filter, .. } => filter.len(),
            Operation::Insert { columns, .. } => columns.len(),
            Operation::Update {
                columns, filter, ..
            } => columns.len() + filter.len(),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Select { .. })
    }
}

/// A rendered statement template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    operation: Operation,
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render `"a" = ? AND "b" = ?`, numbering placeholders from `first`.
fn conjunction(columns: &[String], placeholder: Placeholder, first: usize) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(c), placeholder.render(first + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl Statement {
    pub fn new(operation: Operation, placeholder: Placeholder) -> Self {
        let sql = match &operation {
            Operation::Select {
                relation,
                columns,
                filter,
            } => {
                let mut sql = format!(
                    "SELECT {} FROM {}",
                    column_list(columns),
                    quote_ident(relation)
                );
                if !filter.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conjunction(filter, placeholder, 1));
                }
                sql
            }
            Operation::Insert { relation, columns } => {
                let params = (1..=columns.len())
                    .map(|i| placeholder.render(i))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(relation),
                    column_list(columns),
                    params
                )
            }
            Operation::Update {
                relation,
                columns,
                filter,
            } => {
                let set = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = {}", quote_ident(c), placeholder.render(i + 1)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!("UPDATE {} SET {}", quote_ident(relation), set);
                if !filter.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conjunction(filter, placeholder, columns.len() + 1));
                }
                sql
            }
            Operation::Delete { relation, filter } => {
                let mut sql = format!("DELETE FROM {}", quote_ident(relation));
                if !filter.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conjunction(filter, placeholder, 1));
                }
                sql
            }
        };
        Self { sql, operation }
    }

    pub fn select(
        relation: impl Into<String>,
        columns: Vec<String>,
        filter: Vec<String>,
        placeholder: Placeholder,
    ) -> Self {
        Self::new(
            Operation::Select {
                relation: relation.into(),
                columns,
                filter,
            },
            placeholder,
        )
    }

    pub fn insert(relation: impl Into<String>, columns: Vec<String>, placeholder: Placeholder) -> Self {
        Self::new(
            Operation::Insert {
                relation: relation.into(),
                columns,
            },
            placeholder,
        )
    }

    pub fn update(
        relation: impl Into<String>,
        columns: Vec<String>,
        filter: Vec<String>,
        placeholder: Placeholder,
    ) -> Self {
        Self::new(
            Operation::Update {
                relation: relation.into(),
                columns,
                filter,
            },
            placeholder,
        )
    }

    pub fn delete(relation: impl Into<String>, filter: Vec<String>, placeholder: Placeholder) -> Self {
        Self::new(
            Operation::Delete {
                relation: relation.into(),
                filter,
            },
            placeholder,
        )
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn relation(&self) -> &str {
        self.operation.relation()
    }

    pub fn param_count(&self) -> usize {
        self.operation.param_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_quotes_reserved_words() {
        let stmt = Statement::select(
            "order",
            cols(&["id", "no", "finished"]),
            vec![],
            Placeholder::Question,
        );
        assert_eq!(stmt.sql(), "SELECT \"id\", \"no\", \"finished\" FROM \"order\"");
        assert_eq!(stmt.param_count(), 0);
    }

    #[test]
    fn test_update_numbers_filter_after_set() {
        let stmt = Statement::update(
            "employee",
            cols(&["name", "surname", "phone"]),
            cols(&["name", "surname"]),
            Placeholder::Dollar,
        );
        assert_eq!(
            stmt.sql(),
            "UPDATE \"employee\" SET \"name\" = $1, \"surname\" = $2, \"phone\" = $3 \
             WHERE \"name\" = $4 AND \"surname\" = $5"
        );
        assert_eq!(stmt.param_count(), 5);
    }

    #[test]
    fn test_insert_and_delete() {
        let insert = Statement::insert("article", cols(&["id", "name"]), Placeholder::Format);
        assert_eq!(
            insert.sql(),
            "INSERT INTO \"article\" (\"id\", \"name\") VALUES (%s, %s)"
        );
        let delete = Statement::delete("article", cols(&["id"]), Placeholder::Question);
        assert_eq!(delete.sql(), "DELETE FROM \"article\" WHERE \"id\" = ?");
        assert!(delete.operation().is_write());
    }

    #[test]
    fn test_embedded_quote_is_doubled() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
