//! Schema descriptors: the static mapping of a class onto a relation.
//!
//! A descriptor is built once per class and never mutated afterwards. Column
//! names are resolved to positions at build time so objects never search
//! column lists on attribute access.

use crate::error::{SchemaError, StrataResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Relationship cardinality from the owner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// How an association is represented in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backing {
    /// Foreign-key columns on the owner's own row, referencing the related key.
    LocalColumns(Vec<String>),
    /// Foreign-key columns on the related rows, referencing the owner key.
    RemoteColumns(Vec<String>),
    /// Join relation holding (owner key, related key) pairs.
    JoinRelation {
        relation: String,
        owner_columns: Vec<String>,
        related_columns: Vec<String>,
    },
}

impl Backing {
    /// Foreign-key columns for the two column-based forms.
    pub fn foreign_key_columns(&self) -> Option<&[String]> {
        match self {
            Backing::LocalColumns(cols) | Backing::RemoteColumns(cols) => Some(cols),
            Backing::JoinRelation { .. } => None,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, Backing::JoinRelation { .. })
    }
}

/// Declaration of one association attribute of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationDecl {
    pub name: String,
    pub cardinality: Cardinality,
    /// Class name of the related objects.
    pub related: String,
    pub backing: Backing,
    /// Name of the paired association on the related class. Present for
    /// bidirectional relationships only.
    pub back_ref: Option<String>,
}

impl AssociationDecl {
    pub fn new(
        name: impl Into<String>,
        cardinality: Cardinality,
        related: impl Into<String>,
        backing: Backing,
    ) -> Self {
        Self {
            name: name.into(),
            cardinality,
            related: related.into(),
            backing,
            back_ref: None,
        }
    }

    /// One-to-one reference stored in foreign-key columns of the owner's row.
    pub fn reference<S: Into<String>>(
        name: impl Into<String>,
        related: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            Cardinality::OneToOne,
            related,
            Backing::LocalColumns(columns.into_iter().map(Into::into).collect()),
        )
    }

    /// One-to-many collection stored in foreign-key columns of the related rows.
    pub fn one_to_many<S: Into<String>>(
        name: impl Into<String>,
        related: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            Cardinality::OneToMany,
            related,
            Backing::RemoteColumns(columns.into_iter().map(Into::into).collect()),
        )
    }

    /// Many-to-many collection stored in a join relation.
    pub fn many_to_many<S: Into<String>, T: Into<String>>(
        name: impl Into<String>,
        related: impl Into<String>,
        relation: impl Into<String>,
        owner_columns: impl IntoIterator<Item = S>,
        related_columns: impl IntoIterator<Item = T>,
    ) -> Self {
        Self::new(
            name,
            Cardinality::ManyToMany,
            related,
            Backing::JoinRelation {
                relation: relation.into(),
                owner_columns: owner_columns.into_iter().map(Into::into).collect(),
                related_columns: related_columns.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Make the association bidirectional, paired with `attr` on the related class.
    pub fn with_back_ref(mut self, attr: impl Into<String>) -> Self {
        self.back_ref = Some(attr.into());
        self
    }

    pub fn is_bidirectional(&self) -> bool {
        self.back_ref.is_some()
    }

    /// Single-valued associations hold at most one related object.
    pub fn is_single(&self) -> bool {
        self.cardinality == Cardinality::OneToOne
    }

    fn check_shape(&self, class: &str) -> Result<(), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidAssociation {
            class: class.to_string(),
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.related.is_empty() {
            return Err(invalid("related class is empty"));
        }

        match (&self.cardinality, &self.backing) {
            (Cardinality::OneToMany, Backing::RemoteColumns(_))
            | (Cardinality::OneToOne, Backing::LocalColumns(_))
            | (Cardinality::OneToOne, Backing::RemoteColumns(_))
            | (Cardinality::ManyToMany, Backing::JoinRelation { .. }) => {}
            (Cardinality::OneToMany, _) => {
                return Err(invalid("one-to-many requires foreign-key columns on the related class"))
            }
            (Cardinality::ManyToMany, _) => {
                return Err(invalid("many-to-many requires a join relation"))
            }
            (Cardinality::OneToOne, _) => {
                return Err(invalid("one-to-one requires foreign-key columns"))
            }
        }

        match &self.backing {
            Backing::LocalColumns(cols) | Backing::RemoteColumns(cols) => {
                if cols.is_empty() {
                    return Err(invalid("foreign-key column list is empty"));
                }
            }
            Backing::JoinRelation {
                relation,
                owner_columns,
                related_columns,
            } => {
                if relation.is_empty() {
                    return Err(invalid("join relation name is empty"));
                }
                if owner_columns.is_empty() || related_columns.is_empty() {
                    return Err(invalid("join column lists must not be empty"));
                }
            }
        }

        Ok(())
    }
}

/// Immutable description of how one class maps onto one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    class: String,
    relation: String,
    columns: Vec<String>,
    key: Vec<usize>,
    associations: Vec<AssociationDecl>,
    positions: HashMap<String, usize>,
}

impl SchemaDescriptor {
    pub fn builder(class: impl Into<String>, relation: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            class: class.into(),
            relation: relation.into(),
            columns: Vec::new(),
            key: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Declared columns in declaration order; rows are index-aligned with this list.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    /// Resolve a column to its position or fail with [`SchemaError::UnknownColumn`].
    pub fn require_column(&self, column: &str) -> Result<usize, SchemaError> {
        self.column_index(column)
            .ok_or_else(|| SchemaError::UnknownColumn {
                class: self.class.clone(),
                column: column.to_string(),
            })
    }

    /// Positions of the key columns, in key declaration order.
    pub fn key_positions(&self) -> &[usize] {
        &self.key
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.key.iter().map(|&i| self.columns[i].clone()).collect()
    }

    pub fn is_key_column(&self, position: usize) -> bool {
        self.key.contains(&position)
    }

    pub fn associations(&self) -> &[AssociationDecl] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDecl> {
        self.associations.iter().find(|a| a.name == name)
    }
}

/// Builder for [`SchemaDescriptor`]. `build` enforces every descriptor invariant.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    class: String,
    relation: String,
    columns: Vec<String>,
    key: Vec<String>,
    associations: Vec<AssociationDecl>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(name.into());
        self
    }

    pub fn columns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.columns.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn key<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.key = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn association(mut self, decl: AssociationDecl) -> Self {
        self.associations.push(decl);
        self
    }

    pub fn build(self) -> StrataResult<SchemaDescriptor> {
        let class = self.class;

        if self.relation.is_empty() {
            return Err(SchemaError::EmptyRelation { class }.into());
        }
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns { class }.into());
        }

        let mut positions = HashMap::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            if positions.insert(column.clone(), i).is_some() {
                return Err(SchemaError::DuplicateColumn {
                    class,
                    column: column.clone(),
                }
                .into());
            }
        }

        if self.key.is_empty() {
            return Err(SchemaError::EmptyKey { class }.into());
        }
        let mut key = Vec::with_capacity(self.key.len());
        for column in &self.key {
            match positions.get(column) {
                Some(&i) if !key.contains(&i) => key.push(i),
                Some(_) => {
                    return Err(SchemaError::DuplicateColumn {
                        class,
                        column: column.clone(),
                    }
                    .into())
                }
                None => {
                    return Err(SchemaError::UnknownKeyColumn {
                        class,
                        column: column.clone(),
                    }
                    .into())
                }
            }
        }

        for (i, decl) in self.associations.iter().enumerate() {
            if positions.contains_key(&decl.name)
                || self.associations[..i].iter().any(|a| a.name == decl.name)
            {
                return Err(SchemaError::DuplicateAssociation {
                    class,
                    name: decl.name.clone(),
                }
                .into());
            }
            decl.check_shape(&class)?;
            if let Backing::LocalColumns(cols) = &decl.backing {
                if let Some(missing) = cols.iter().find(|c| !positions.contains_key(*c)) {
                    return Err(SchemaError::InvalidAssociation {
                        class,
                        name: decl.name.clone(),
                        reason: format!("foreign-key column {} is not declared", missing),
                    }
                    .into());
                }
            }
        }

        Ok(SchemaDescriptor {
            class,
            relation: self.relation,
            columns: self.columns,
            key,
            associations: self.associations,
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StrataError;

    fn employee() -> SchemaBuilder {
        SchemaDescriptor::builder("Employee", "employee")
            .columns(["name", "surname", "phone"])
            .key(["name", "surname"])
    }

    #[test]
    fn test_build_resolves_positions() {
        let schema = employee().build().unwrap();
        assert_eq!(schema.class(), "Employee");
        assert_eq!(schema.relation(), "employee");
        assert_eq!(schema.column_index("phone"), Some(2));
        assert_eq!(schema.key_positions(), &[0, 1]);
        assert_eq!(schema.key_columns(), vec!["name", "surname"]);
        assert!(schema.is_key_column(1));
        assert!(!schema.is_key_column(2));
    }

    #[test]
    fn test_empty_key_fails_fast() {
        let err = SchemaDescriptor::builder("Order", "order")
            .column("no")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            StrataError::Schema(SchemaError::EmptyKey {
                class: "Order".to_string()
            })
        );
    }

    #[test]
    fn test_key_must_be_declared() {
        let err = employee().key(["badge"]).build().unwrap_err();
        assert!(matches!(
            err,
            StrataError::Schema(SchemaError::UnknownKeyColumn { ref column, .. }) if column == "badge"
        ));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = employee().column("phone").build().unwrap_err();
        assert!(matches!(
            err,
            StrataError::Schema(SchemaError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_association_name_collides_with_column() {
        let err = employee()
            .association(AssociationDecl::one_to_many("phone", "Order", ["emp"]))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::Schema(SchemaError::DuplicateAssociation { .. })
        ));
    }

    #[test]
    fn test_cardinality_backing_mismatch() {
        let decl = AssociationDecl::new(
            "orders",
            Cardinality::ManyToMany,
            "Order",
            Backing::RemoteColumns(vec!["emp".into()]),
        );
        let err = employee().association(decl).build().unwrap_err();
        assert!(matches!(
            err,
            StrataError::Schema(SchemaError::InvalidAssociation { .. })
        ));
    }

    #[test]
    fn test_local_columns_must_be_declared() {
        let err = SchemaDescriptor::builder("OrderItem", "order_item")
            .columns(["id", "pos"])
            .key(["id"])
            .association(AssociationDecl::reference("order", "Order", ["order_fkey"]))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::Schema(SchemaError::InvalidAssociation { ref reason, .. })
                if reason.contains("order_fkey")
        ));
    }

    #[test]
    fn test_back_ref_makes_bidirectional() {
        let decl = AssociationDecl::one_to_many("items", "OrderItem", ["order_fkey"])
            .with_back_ref("order");
        assert!(decl.is_bidirectional());
        assert!(!decl.is_single());
        assert_eq!(
            decl.backing.foreign_key_columns(),
            Some(&["order_fkey".to_string()][..])
        );
    }
}
