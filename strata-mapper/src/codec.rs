//! Row codecs: conversion between store rows and objects, plus the statement
//! templates each class and association needs.
//!
//! Templates are rendered once, when a session registers its classes, so a
//! descriptor that cannot produce a keyed statement fails there and not on
//! first use.

use std::sync::Arc;

use strata_core::{
    AssociationDecl, Backing, Key, Placeholder, Row, SchemaDescriptor, SchemaError, StoreError,
    StrataResult, Value,
};
use strata_storage::Statement;

use crate::object::ObjectRef;

/// Per-class codec built from a schema descriptor.
#[derive(Debug, Clone)]
pub struct RowCodec {
    schema: Arc<SchemaDescriptor>,
    placeholder: Placeholder,
    select_all: Statement,
    select_by_key: Statement,
    insert: Statement,
    update: Statement,
    delete: Statement,
}

impl RowCodec {
    pub fn new(schema: Arc<SchemaDescriptor>, placeholder: Placeholder) -> StrataResult<Self> {
        if schema.key_positions().is_empty() {
            return Err(SchemaError::EmptyKey {
                class: schema.class().to_string(),
            }
            .into());
        }

        let relation = schema.relation().to_string();
        let columns = schema.columns().to_vec();
        let key = schema.key_columns();

        Ok(Self {
            select_all: Statement::select(&relation, columns.clone(), vec![], placeholder),
            select_by_key: Statement::select(&relation, columns.clone(), key.clone(), placeholder),
            insert: Statement::insert(&relation, columns.clone(), placeholder),
            // The filter binds the key the row is stored under, not the
            // possibly mutated key attributes.
            update: Statement::update(&relation, columns, key.clone(), placeholder),
            delete: Statement::delete(&relation, key, placeholder),
            schema,
            placeholder,
        })
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn select_all(&self) -> &Statement {
        &self.select_all
    }

    pub fn select_by_key(&self) -> &Statement {
        &self.select_by_key
    }

    pub fn insert(&self) -> &Statement {
        &self.insert
    }

    pub fn update(&self) -> &Statement {
        &self.update
    }

    pub fn delete(&self) -> &Statement {
        &self.delete
    }

    /// Select every column filtered by equality on `filter`.
    pub fn select_where(&self, filter: Vec<String>) -> Statement {
        Statement::select(
            self.schema.relation(),
            self.schema.columns().to_vec(),
            filter,
            self.placeholder,
        )
    }

    /// Fail with `RowArity` unless the row is index-aligned with the columns.
    pub fn check_row(&self, row: &[Value]) -> StrataResult<()> {
        let expected = self.schema.columns().len();
        if row.len() != expected {
            return Err(StoreError::RowArity {
                relation: self.schema.relation().to_string(),
                expected,
                found: row.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Build a fresh object from a row. The object is recorded under the key
    /// the row carries.
    pub fn decode(&self, row: Row) -> StrataResult<ObjectRef> {
        self.check_row(&row)?;
        let key = self.key_of_row(&row);
        Ok(ObjectRef::from_parts(Arc::clone(&self.schema), row, Some(key)))
    }

    /// Key tuple of an object's current attributes.
    pub fn derive_key(&self, object: &ObjectRef) -> Key {
        object.derive_key()
    }

    /// Key tuple carried by a full-width row.
    pub fn key_of_row(&self, row: &[Value]) -> Key {
        Key::new(
            self.schema
                .key_positions()
                .iter()
                .map(|&i| row[i].clone())
                .collect(),
        )
    }

    /// Parameters for the update template: current values, then the old key.
    pub fn update_params(&self, object: &ObjectRef, old_key: &Key) -> Row {
        let mut params = object.values();
        params.extend(old_key.values().iter().cloned());
        params
    }
}

/// Statements backing one association.
#[derive(Debug, Clone)]
pub enum LinkCodec {
    /// Foreign key on the owner's row.
    Local {
        /// Positions of the foreign-key columns on the owner.
        positions: Vec<usize>,
        /// `UPDATE owner SET fk WHERE owner_key`
        assign: Statement,
        /// `UPDATE owner SET fk WHERE owner_key AND fk`
        clear: Statement,
    },
    /// Foreign key on the related rows.
    Remote {
        /// Positions of the foreign-key columns on the related class.
        positions: Vec<usize>,
        /// `SELECT related.* WHERE fk`
        select: Statement,
        /// `UPDATE related SET fk WHERE related_key`
        assign: Statement,
        /// `UPDATE related SET fk WHERE related_key AND fk`
        clear: Statement,
    },
    Join {
        /// `SELECT related_columns WHERE owner_columns`
        select: Statement,
        insert: Statement,
        delete: Statement,
    },
}

impl LinkCodec {
    pub fn new(
        owner: &SchemaDescriptor,
        decl: &AssociationDecl,
        related: &SchemaDescriptor,
        placeholder: Placeholder,
    ) -> StrataResult<Self> {
        let codec = match &decl.backing {
            Backing::LocalColumns(cols) => {
                let positions = cols
                    .iter()
                    .map(|c| owner.require_column(c))
                    .collect::<Result<Vec<_>, _>>()?;
                let key = owner.key_columns();
                let mut guarded = key.clone();
                guarded.extend(cols.iter().cloned());
                LinkCodec::Local {
                    positions,
                    assign: Statement::update(owner.relation(), cols.clone(), key, placeholder),
                    clear: Statement::update(owner.relation(), cols.clone(), guarded, placeholder),
                }
            }
            Backing::RemoteColumns(cols) => {
                let positions = cols
                    .iter()
                    .map(|c| related.require_column(c))
                    .collect::<Result<Vec<_>, _>>()?;
                let key = related.key_columns();
                let mut guarded = key.clone();
                guarded.extend(cols.iter().cloned());
                LinkCodec::Remote {
                    positions,
                    select: Statement::select(
                        related.relation(),
                        related.columns().to_vec(),
                        cols.clone(),
                        placeholder,
                    ),
                    assign: Statement::update(related.relation(), cols.clone(), key, placeholder),
                    clear: Statement::update(related.relation(), cols.clone(), guarded, placeholder),
                }
            }
            Backing::JoinRelation {
                relation,
                owner_columns,
                related_columns,
            } => {
                let mut all = owner_columns.clone();
                all.extend(related_columns.iter().cloned());
                LinkCodec::Join {
                    select: Statement::select(
                        relation,
                        related_columns.clone(),
                        owner_columns.clone(),
                        placeholder,
                    ),
                    insert: Statement::insert(relation, all.clone(), placeholder),
                    delete: Statement::delete(relation, all, placeholder),
                }
            }
        };
        Ok(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::fixtures;

    #[test]
    fn test_templates_quote_reserved_relation() {
        let codec = RowCodec::new(Arc::new(fixtures::order_schema()), Placeholder::Question).unwrap();
        assert_eq!(
            codec.select_all().sql(),
            "SELECT \"id\", \"no\", \"finished\" FROM \"order\""
        );
        assert_eq!(
            codec.update().sql(),
            "UPDATE \"order\" SET \"id\" = ?, \"no\" = ?, \"finished\" = ? WHERE \"id\" = ?"
        );
        assert_eq!(codec.delete().sql(), "DELETE FROM \"order\" WHERE \"id\" = ?");
    }

    #[test]
    fn test_decode_records_row_key() {
        let codec = RowCodec::new(Arc::new(fixtures::employee_schema()), Placeholder::Dollar).unwrap();
        let obj = codec
            .decode(vec!["n1".into(), "s1".into(), "555".into()])
            .unwrap();
        assert_eq!(obj.key(), Some(Key::from(("n1", "s1"))));
        assert_eq!(codec.derive_key(&obj), Key::from(("n1", "s1")));
    }

    #[test]
    fn test_decode_rejects_misaligned_row() {
        let codec = RowCodec::new(Arc::new(fixtures::article_schema()), Placeholder::Question).unwrap();
        let err = codec.decode(vec![Value::Int(1)]).unwrap_err();
        assert_eq!(
            err,
            strata_core::StrataError::from(StoreError::RowArity {
                relation: "article".to_string(),
                expected: 3,
                found: 1
            })
        );
    }

    #[test]
    fn test_update_params_bind_old_key_last() {
        let codec = RowCodec::new(Arc::new(fixtures::employee_schema()), Placeholder::Question).unwrap();
        let obj = codec
            .decode(vec!["n1".into(), "s1".into(), Value::Null])
            .unwrap();
        obj.set("name", "n2").unwrap();
        let old = obj.key().unwrap();
        let params = codec.update_params(&obj, &old);
        assert_eq!(
            params,
            vec!["n2".into(), "s1".into(), Value::Null, "n1".into(), "s1".into()]
        );
    }

    #[test]
    fn test_link_codecs_for_each_backing() {
        let order = fixtures::order_schema();
        let item = fixtures::order_item_schema();
        let employee = fixtures::employee_schema();

        let items = LinkCodec::new(&order, order.association("items").unwrap(), &item, Placeholder::Question)
            .unwrap();
        match items {
            LinkCodec::Remote {
                positions,
                select,
                clear,
                ..
            } => {
                assert_eq!(positions, vec![1]);
                assert!(select.sql().ends_with("FROM \"order_item\" WHERE \"order_fkey\" = ?"));
                assert_eq!(
                    clear.sql(),
                    "UPDATE \"order_item\" SET \"order_fkey\" = ? WHERE \"id\" = ? AND \"order_fkey\" = ?"
                );
            }
            other => panic!("expected remote codec, got {:?}", other),
        }

        let back = LinkCodec::new(&item, item.association("order").unwrap(), &order, Placeholder::Question)
            .unwrap();
        assert!(matches!(back, LinkCodec::Local { ref positions, .. } if positions == &vec![1]));

        let orders = LinkCodec::new(
            &employee,
            employee.association("orders").unwrap(),
            &order,
            Placeholder::Question,
        )
        .unwrap();
        match orders {
            LinkCodec::Join { select, insert, delete } => {
                assert_eq!(
                    select.sql(),
                    "SELECT \"order_id\" FROM \"employee_orders\" \
                     WHERE \"employee_name\" = ? AND \"employee_surname\" = ?"
                );
                assert_eq!(insert.param_count(), 3);
                assert_eq!(delete.param_count(), 3);
            }
            other => panic!("expected join codec, got {:?}", other),
        }
    }
}
