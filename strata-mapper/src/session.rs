//! Session: one gateway connection plus one identity broker per class.
//!
//! The session owns the gateway exclusively and hands out association views
//! that borrow it. All access is single-threaded; interior mutability is
//! scoped to a single call so no borrow is held across calls.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use strata_core::{
    AssociationDecl, AssociationError, Backing, ConfigError, Key, Row, SchemaDescriptor,
    SchemaError, StoreError, StrataConfig, StrataResult, Value,
};
use strata_storage::{Statement, StoreGateway};

use crate::association::{reset_view, Association};
use crate::broker::IdentityBroker;
use crate::codec::LinkCodec;
use crate::object::ObjectRef;

struct ClassEntry {
    schema: Arc<SchemaDescriptor>,
    broker: RefCell<IdentityBroker>,
    links: HashMap<String, LinkCodec>,
}

/// Equality search terms for [`Session::find`].
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    terms: Vec<Term>,
}

#[derive(Debug, Clone)]
enum Term {
    Column(String, Value),
    /// Match a single-valued association stored in local foreign-key columns.
    Related(String, ObjectRef),
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push(Term::Column(column.into(), value.into()));
        self
    }

    pub fn related(mut self, association: impl Into<String>, object: &ObjectRef) -> Self {
        self.terms.push(Term::Related(association.into(), object.clone()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Builder for [`Session`]. `build` validates the registered classes
/// against each other.
pub struct SessionBuilder<G: StoreGateway> {
    gateway: G,
    config: StrataConfig,
    schemas: Vec<SchemaDescriptor>,
}

impl<G: StoreGateway> SessionBuilder<G> {
    pub fn config(mut self, config: StrataConfig) -> Self {
        self.config = config;
        self
    }

    pub fn class(mut self, schema: SchemaDescriptor) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn classes(mut self, schemas: impl IntoIterator<Item = SchemaDescriptor>) -> Self {
        self.schemas.extend(schemas);
        self
    }

    pub fn build(self) -> StrataResult<Session<G>> {
        self.config.validate()?;
        let placeholder = self.config.placeholder.unwrap_or_else(|| self.gateway.placeholder());

        let mut schemas: IndexMap<String, Arc<SchemaDescriptor>> = IndexMap::new();
        for schema in self.schemas {
            let class = schema.class().to_string();
            if schemas.contains_key(&class) {
                return Err(SchemaError::DuplicateClass { class }.into());
            }
            schemas.insert(class, Arc::new(schema));
        }

        for schema in schemas.values() {
            for decl in schema.associations() {
                validate_association(&schemas, schema, decl)?;
            }
        }

        let mut classes = IndexMap::with_capacity(schemas.len());
        for (class, schema) in &schemas {
            let mut links = HashMap::new();
            for decl in schema.associations() {
                let related = &schemas[decl.related.as_str()];
                links.insert(decl.name.clone(), LinkCodec::new(schema, decl, related, placeholder)?);
            }
            let broker = IdentityBroker::new(Arc::clone(schema), placeholder, self.config.load_policy)?;
            classes.insert(
                class.clone(),
                ClassEntry {
                    schema: Arc::clone(schema),
                    broker: RefCell::new(broker),
                    links,
                },
            );
        }

        tracing::debug!(classes = classes.len(), ?placeholder, "Session built");
        Ok(Session {
            gateway: RefCell::new(self.gateway),
            classes,
            config: self.config,
        })
    }
}

fn validate_association(
    schemas: &IndexMap<String, Arc<SchemaDescriptor>>,
    owner: &SchemaDescriptor,
    decl: &AssociationDecl,
) -> StrataResult<()> {
    let invalid = |reason: String| SchemaError::InvalidAssociation {
        class: owner.class().to_string(),
        name: decl.name.clone(),
        reason,
    };

    let related = schemas
        .get(decl.related.as_str())
        .ok_or_else(|| SchemaError::UnknownClass {
            class: decl.related.clone(),
        })?;
    let owner_arity = owner.key_positions().len();
    let related_arity = related.key_positions().len();

    match &decl.backing {
        Backing::LocalColumns(cols) => {
            if cols.len() != related_arity {
                return Err(invalid(format!(
                    "{} foreign-key columns for a {}-column key of {}",
                    cols.len(),
                    related_arity,
                    related.class()
                ))
                .into());
            }
        }
        Backing::RemoteColumns(cols) => {
            if cols.len() != owner_arity {
                return Err(invalid(format!(
                    "{} foreign-key columns for a {}-column key of {}",
                    cols.len(),
                    owner_arity,
                    owner.class()
                ))
                .into());
            }
            if let Some(col) = cols.iter().find(|c| related.column_index(c).is_none()) {
                return Err(invalid(format!("{} has no column {}", related.class(), col)).into());
            }
        }
        Backing::JoinRelation {
            owner_columns,
            related_columns,
            ..
        } => {
            if owner_columns.len() != owner_arity || related_columns.len() != related_arity {
                return Err(invalid("join column arity does not match the key arities".to_string()).into());
            }
        }
    }

    let Some(back) = &decl.back_ref else {
        return Ok(());
    };
    let paired = related
        .association(back)
        .ok_or_else(|| invalid(format!("{} has no association {}", related.class(), back)))?;
    if paired.related != owner.class() || paired.back_ref.as_deref() != Some(decl.name.as_str()) {
        return Err(invalid(format!("{}.{} does not point back", related.class(), back)).into());
    }
    let mirrored = match (&decl.backing, &paired.backing) {
        (Backing::LocalColumns(a), Backing::RemoteColumns(b))
        | (Backing::RemoteColumns(a), Backing::LocalColumns(b)) => a == b,
        (
            Backing::JoinRelation {
                relation: ra,
                owner_columns: oa,
                related_columns: ca,
            },
            Backing::JoinRelation {
                relation: rb,
                owner_columns: ob,
                related_columns: cb,
            },
        ) => ra == rb && oa == cb && ca == ob,
        _ => false,
    };
    if !mirrored {
        return Err(invalid(format!(
            "backing does not mirror {}.{}",
            related.class(),
            back
        ))
        .into());
    }
    Ok(())
}

/// Mapping session over one store gateway.
pub struct Session<G: StoreGateway> {
    gateway: RefCell<G>,
    classes: IndexMap<String, ClassEntry>,
    config: StrataConfig,
}

impl<G: StoreGateway> Session<G> {
    pub fn builder(gateway: G) -> SessionBuilder<G> {
        SessionBuilder {
            gateway,
            config: StrataConfig::default(),
            schemas: Vec::new(),
        }
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn gateway(&self) -> Ref<'_, G> {
        self.gateway.borrow()
    }

    pub fn gateway_mut(&self) -> RefMut<'_, G> {
        self.gateway.borrow_mut()
    }

    /// Registered class names, in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    fn entry(&self, class: &str) -> StrataResult<&ClassEntry> {
        self.classes.get(class).ok_or_else(|| {
            SchemaError::UnknownClass {
                class: class.to_string(),
            }
            .into()
        })
    }

    pub fn schema(&self, class: &str) -> StrataResult<Arc<SchemaDescriptor>> {
        Ok(Arc::clone(&self.entry(class)?.schema))
    }

    fn with_broker<R>(
        &self,
        class: &str,
        f: impl FnOnce(&mut IdentityBroker, &mut G) -> StrataResult<R>,
    ) -> StrataResult<R> {
        let entry = self.entry(class)?;
        let mut broker = entry.broker.borrow_mut();
        let mut gateway = self.gateway.borrow_mut();
        f(&mut broker, &mut gateway)
    }

    pub(crate) fn link(&self, class: &str, name: &str) -> StrataResult<(&AssociationDecl, &LinkCodec)> {
        let entry = self.entry(class)?;
        let unknown = || AssociationError::UnknownAssociation {
            class: class.to_string(),
            name: name.to_string(),
        };
        let decl = entry.schema.association(name).ok_or_else(unknown)?;
        let codec = entry.links.get(name).ok_or_else(unknown)?;
        Ok((decl, codec))
    }

    pub(crate) fn cached_objects(&self, class: &str) -> StrataResult<Vec<ObjectRef>> {
        Ok(self.entry(class)?.broker.borrow().objects())
    }

    pub(crate) fn query(&self, class: &str, statement: &Statement, params: &[Value]) -> StrataResult<Vec<ObjectRef>> {
        self.with_broker(class, |broker, gw| broker.query(gw, statement, params))
    }

    pub(crate) fn query_rows(&self, statement: &Statement, params: &[Value]) -> StrataResult<Vec<Row>> {
        self.gateway.borrow_mut().execute_query(statement, params)
    }

    pub(crate) fn write(&self, statement: &Statement, params: &[Value]) -> StrataResult<u64> {
        self.gateway.borrow_mut().execute_write(statement, params)
    }

    // === Connection and transactions ===

    pub fn connect(&self, source: &str) -> StrataResult<()> {
        self.gateway.borrow_mut().connect(source)
    }

    /// Connect to the data source named in the configuration.
    pub fn connect_default(&self) -> StrataResult<()> {
        let source = self.config.source.as_deref().ok_or_else(|| ConfigError::InvalidValue {
            field: "source".to_string(),
            value: String::new(),
            reason: "no default data source configured".to_string(),
        })?;
        self.connect(source)
    }

    pub fn close(&self) -> StrataResult<()> {
        self.gateway.borrow_mut().close()
    }

    pub fn is_connected(&self) -> bool {
        self.gateway.borrow().is_connected()
    }

    pub fn commit(&self) -> StrataResult<()> {
        self.gateway.borrow_mut().commit()
    }

    /// Roll back the store transaction. Caches and association views are not
    /// touched; reload them before trusting them again.
    pub fn rollback(&self) -> StrataResult<()> {
        self.gateway.borrow_mut().rollback()
    }

    // === Objects ===

    /// Fresh unsaved object of `class` with every attribute null.
    pub fn create(&self, class: &str) -> StrataResult<ObjectRef> {
        Ok(ObjectRef::new(self.schema(class)?))
    }

    pub fn get(&self, class: &str, key: impl Into<Key>) -> StrataResult<ObjectRef> {
        let key = key.into();
        self.with_broker(class, |broker, gw| broker.get(gw, &key))
    }

    pub fn get_all(&self, class: &str) -> StrataResult<Vec<ObjectRef>> {
        self.with_broker(class, |broker, gw| broker.get_all(gw))
    }

    pub fn reload(&self, class: &str, immediate: bool) -> StrataResult<()> {
        self.with_broker(class, |broker, gw| broker.reload(gw, immediate))
    }

    pub fn add(&self, object: &ObjectRef) -> StrataResult<()> {
        self.with_broker(&object.class(), |broker, gw| broker.add(gw, object))
    }

    /// Write `object`'s attributes under its recorded key and rekey the cache
    /// if a key column changed.
    ///
    /// A new key already held by another cached object fails with
    /// [`IdentityError::DuplicateKey`](strata_core::IdentityError::DuplicateKey)
    /// before any statement is issued; a clash with an uncached row surfaces
    /// as the store's constraint violation.
    pub fn update(&self, object: &ObjectRef) -> StrataResult<()> {
        self.with_broker(&object.class(), |broker, gw| broker.update(gw, object))
    }

    pub fn delete(&self, object: &ObjectRef) -> StrataResult<()> {
        self.with_broker(&object.class(), |broker, gw| broker.delete(gw, object))
    }

    /// Equality search routed through the identity cache.
    ///
    /// Related terms only apply to associations stored in the searched
    /// class's own foreign-key columns; they match on the related object's
    /// recorded key. Terms are equalities joined with AND; free-form SQL
    /// conditions are not accepted.
    pub fn find(&self, class: &str, criteria: &Criteria) -> StrataResult<Vec<ObjectRef>> {
        let schema = self.schema(class)?;
        let mut columns = Vec::new();
        let mut values = Vec::new();

        for term in &criteria.terms {
            match term {
                Term::Column(column, value) => {
                    schema.require_column(column)?;
                    columns.push(column.clone());
                    values.push(value.clone());
                }
                Term::Related(name, object) => {
                    let (decl, _) = self.link(class, name)?;
                    let Backing::LocalColumns(cols) = &decl.backing else {
                        return Err(SchemaError::InvalidAssociation {
                            class: class.to_string(),
                            name: name.clone(),
                            reason: "search by related object needs local foreign-key columns"
                                .to_string(),
                        }
                        .into());
                    };
                    if !object.is_instance_of(&decl.related) {
                        return Err(AssociationError::WrongClass {
                            association: format!("{}.{}", class, name),
                            expected: decl.related.clone(),
                            found: object.class(),
                        }
                        .into());
                    }
                    let key = object
                        .key()
                        .ok_or_else(|| StoreError::UnassignedKey { class: object.class() })?;
                    columns.extend(cols.iter().cloned());
                    values.extend(key.into_values());
                }
            }
        }

        self.with_broker(class, |broker, gw| broker.find(gw, columns, &values))
    }

    // === Associations ===

    /// Membership view of association `name` on `owner`.
    pub fn association(&self, owner: &ObjectRef, name: &str) -> StrataResult<Association<'_, G>> {
        let (decl, codec) = self.link(&owner.class(), name)?;
        Ok(Association::new(self, owner.clone(), decl, codec))
    }

    /// Discard the loaded view and pending changes of association `name` on
    /// every cached object of `class`.
    pub fn reload_associations(&self, class: &str, name: &str) -> StrataResult<()> {
        let (decl, _) = self.link(class, name)?;
        for obj in self.cached_objects(class)? {
            reset_view(&obj, decl);
        }
        tracing::debug!(class, association = name, "Association views reset");
        Ok(())
    }

    // === Cache introspection ===

    pub fn cached(&self, class: &str, key: impl Into<Key>) -> StrataResult<Option<ObjectRef>> {
        Ok(self.entry(class)?.broker.borrow().cached(&key.into()))
    }

    pub fn cache_len(&self, class: &str) -> StrataResult<usize> {
        Ok(self.entry(class)?.broker.borrow().len())
    }

    pub fn is_stale(&self, class: &str) -> StrataResult<bool> {
        Ok(self.entry(class)?.broker.borrow().is_stale())
    }
}

impl<G: StoreGateway> Drop for Session<G> {
    fn drop(&mut self) {
        // Pending memberships hold strong handles and may form cycles.
        for entry in self.classes.values() {
            if let Ok(broker) = entry.broker.try_borrow() {
                for obj in broker.objects() {
                    obj.clear_links();
                }
            }
        }
    }
}
