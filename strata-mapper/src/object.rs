//! Application object handles.
//!
//! An object is a row-shaped record bound to one schema descriptor. Handles
//! are reference counted and compare by identity: two handles are equal only
//! when they point at the same live instance, which is what the identity
//! cache guarantees per key.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use strata_core::{Key, Row, SchemaDescriptor, StrataResult, Value};

use crate::association::LinkState;

pub(crate) struct Object {
    schema: Arc<SchemaDescriptor>,
    values: Vec<Value>,
    /// Key under which the object is known to the store. `None` until added.
    key: Option<Key>,
    links: HashMap<String, LinkState>,
}

/// Shared handle to a mapped object.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);

/// Non-owning handle, used for association membership.
#[derive(Clone)]
pub struct WeakObjectRef(Weak<RefCell<Object>>);

impl ObjectRef {
    /// New unsaved object with every attribute null.
    pub fn new(schema: Arc<SchemaDescriptor>) -> Self {
        let values = vec![Value::Null; schema.columns().len()];
        Self::from_parts(schema, values, None)
    }

    pub(crate) fn from_parts(schema: Arc<SchemaDescriptor>, values: Row, key: Option<Key>) -> Self {
        Self(Rc::new(RefCell::new(Object {
            schema,
            values,
            key,
            links: HashMap::new(),
        })))
    }

    pub fn schema(&self) -> Arc<SchemaDescriptor> {
        Arc::clone(&self.0.borrow().schema)
    }

    pub fn class(&self) -> String {
        self.0.borrow().schema.class().to_string()
    }

    pub fn is_instance_of(&self, class: &str) -> bool {
        self.0.borrow().schema.class() == class
    }

    pub fn get(&self, column: &str) -> StrataResult<Value> {
        let obj = self.0.borrow();
        let pos = obj.schema.require_column(column)?;
        Ok(obj.values[pos].clone())
    }

    /// Assign an attribute. Key columns may be changed freely; the recorded
    /// key only follows after a successful `update`.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> StrataResult<()> {
        let mut obj = self.0.borrow_mut();
        let pos = obj.schema.require_column(column)?;
        obj.values[pos] = value.into();
        Ok(())
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(self, column: &str, value: impl Into<Value>) -> StrataResult<Self> {
        self.set(column, value)?;
        Ok(self)
    }

    /// All attribute values in declared column order.
    pub fn values(&self) -> Row {
        self.0.borrow().values.clone()
    }

    /// The key the object is recorded under, `None` when never added.
    pub fn key(&self) -> Option<Key> {
        self.0.borrow().key.clone()
    }

    /// Key tuple recomputed from the current key-column attributes.
    pub fn derive_key(&self) -> Key {
        let obj = self.0.borrow();
        Key::new(
            obj.schema
                .key_positions()
                .iter()
                .map(|&i| obj.values[i].clone())
                .collect(),
        )
    }

    /// Values of the given column positions.
    pub(crate) fn values_at(&self, positions: &[usize]) -> Vec<Value> {
        let obj = self.0.borrow();
        positions.iter().map(|&i| obj.values[i].clone()).collect()
    }

    pub(crate) fn assign_at(&self, positions: &[usize], values: &[Value]) {
        let mut obj = self.0.borrow_mut();
        for (&pos, value) in positions.iter().zip(values) {
            obj.values[pos] = value.clone();
        }
    }

    pub(crate) fn set_key(&self, key: Option<Key>) {
        self.0.borrow_mut().key = key;
    }

    /// Overwrite every non-key attribute from a freshly fetched row.
    pub(crate) fn refresh_non_key(&self, row: &[Value]) {
        let mut obj = self.0.borrow_mut();
        let schema = Arc::clone(&obj.schema);
        for (i, value) in row.iter().enumerate() {
            if !schema.is_key_column(i) {
                obj.values[i] = value.clone();
            }
        }
    }

    /// Run `f` on the association state named `name`, creating it if absent.
    ///
    /// `f` must not borrow any object; link states only compare handles.
    pub(crate) fn with_link<R>(&self, name: &str, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let mut obj = self.0.borrow_mut();
        f(obj.links.entry(name.to_string()).or_default())
    }

    /// Run `f` on the association state only if it has been loaded.
    pub(crate) fn with_loaded_link<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut LinkState) -> R,
    ) -> Option<R> {
        let mut obj = self.0.borrow_mut();
        match obj.links.get_mut(name) {
            Some(state) if state.is_loaded() => Some(f(state)),
            _ => None,
        }
    }

    /// Drop every association state, releasing pending references.
    pub(crate) fn clear_links(&self) {
        if let Ok(mut obj) = self.0.try_borrow_mut() {
            obj.links.clear();
        }
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Rc::downgrade(&self.0))
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state)
    }
}

// Links are left out so cyclic graphs print finitely.
impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(obj) => f
                .debug_struct(obj.schema.class())
                .field("key", &obj.key)
                .field("values", &obj.values)
                .finish(),
            Err(_) => f.write_str("ObjectRef(<borrowed>)"),
        }
    }
}

impl WeakObjectRef {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }

    /// True when `other` is the instance this handle points at.
    pub fn points_to(&self, other: &ObjectRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Rc::as_ptr(&other.0))
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(obj) => write!(f, "Weak({:?})", obj),
            None => f.write_str("Weak(<dropped>)"),
        }
    }
}
