//! Identity broker: the per-class identity cache.
//!
//! The broker is the sole authority for object identity within a session.
//! Every path that materializes an object from a row (single fetch, full
//! load, association load, search) goes through it, so a key maps to at most
//! one live instance. Entries are never evicted because a handle became
//! unreachable elsewhere; only `delete`, a reload that no longer sees the
//! row, and `clear` remove them.

use std::sync::Arc;

use indexmap::IndexMap;
use strata_core::{
    IdentityError, Key, LoadPolicy, Placeholder, Row, SchemaDescriptor, StoreError, StrataResult,
    Value,
};
use strata_storage::{Statement, StoreGateway};

use crate::codec::RowCodec;
use crate::object::ObjectRef;

/// Load state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Never fully loaded. Entries may still exist from lazy fetches.
    Empty,
    /// A full load has completed at least once.
    Loaded,
}

/// Per-class identity cache.
#[derive(Debug)]
pub struct IdentityBroker {
    codec: RowCodec,
    cache: IndexMap<Key, ObjectRef>,
    state: BrokerState,
    /// Set by `reload`, cleared by the next full load.
    stale: bool,
    policy: LoadPolicy,
}

impl IdentityBroker {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        placeholder: Placeholder,
        policy: LoadPolicy,
    ) -> StrataResult<Self> {
        Ok(Self {
            codec: RowCodec::new(schema, placeholder)?,
            cache: IndexMap::new(),
            state: BrokerState::Empty,
            stale: false,
            policy,
        })
    }

    pub fn codec(&self) -> &RowCodec {
        &self.codec
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        self.codec.schema()
    }

    fn class(&self) -> String {
        self.codec.schema().class().to_string()
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// True while a requested reload has not yet run.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Cached instance for `key`, without store I/O.
    pub fn cached(&self, key: &Key) -> Option<ObjectRef> {
        self.cache.get(key).cloned()
    }

    /// Every cached instance, in cache order, without store I/O.
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.cache.values().cloned().collect()
    }

    /// Look up one object, fetching its row on a cache miss.
    pub fn get<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G, key: &Key) -> StrataResult<ObjectRef> {
        if self.stale || (self.policy == LoadPolicy::Full && self.state == BrokerState::Empty) {
            self.load_all(gateway)?;
        }

        if let Some(obj) = self.cache.get(key) {
            tracing::debug!(class = %self.class(), %key, "Identity cache hit");
            return Ok(obj.clone());
        }

        tracing::debug!(class = %self.class(), %key, "Identity cache miss");
        let not_found = || IdentityError::NotFound {
            class: self.class(),
            key: key.clone(),
        };
        if !key.is_complete() {
            return Err(not_found().into());
        }

        let rows = gateway.execute_query(self.codec.select_by_key(), key.values())?;
        let Some(row) = rows.into_iter().next() else {
            return Err(not_found().into());
        };
        let obj = self.codec.decode(row)?;
        self.cache.insert(key.clone(), obj.clone());
        Ok(obj)
    }

    /// Every object of the class, loading the relation when stale or never loaded.
    pub fn get_all<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G) -> StrataResult<Vec<ObjectRef>> {
        if self.stale || self.state == BrokerState::Empty {
            self.load_all(gateway)?;
        }
        Ok(self.objects())
    }

    /// Flag the cache for reloading; with `immediate` the reload runs now.
    pub fn reload<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G, immediate: bool) -> StrataResult<()> {
        self.stale = true;
        if immediate {
            self.load_all(gateway)?;
        }
        Ok(())
    }

    /// Re-populate from the full relation.
    ///
    /// Existing instances are refreshed in place; keys the store no longer
    /// returns are evicted and their objects lose their recorded key. The
    /// cache ends up in stream order. Nothing changes if the query or any
    /// row fails.
    pub fn load_all<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G) -> StrataResult<()> {
        let rows = gateway.execute_query(self.codec.select_all(), &[])?;
        for row in &rows {
            self.codec.check_row(row)?;
        }

        let mut fresh = IndexMap::with_capacity(rows.len());
        for row in rows {
            let key = self.codec.key_of_row(&row);
            if fresh.contains_key(&key) {
                tracing::warn!(class = %self.class(), %key, "Duplicate key in full load, keeping first row");
                continue;
            }
            let obj = match self.cache.shift_remove(&key) {
                Some(existing) => {
                    existing.refresh_non_key(&row);
                    existing
                }
                None => self.codec.decode(row)?,
            };
            fresh.insert(key, obj);
        }

        let evicted = self.cache.len();
        for (_, gone) in self.cache.drain(..) {
            gone.set_key(None);
        }
        self.cache = fresh;
        self.state = BrokerState::Loaded;
        self.stale = false;
        tracing::info!(class = %self.class(), count = self.cache.len(), evicted, "Identity cache loaded");
        Ok(())
    }

    /// Route a full-width row through the cache without refreshing an
    /// already cached instance.
    pub fn absorb(&mut self, row: Row) -> StrataResult<ObjectRef> {
        self.codec.check_row(&row)?;
        let key = self.codec.key_of_row(&row);
        if let Some(obj) = self.cache.get(&key) {
            return Ok(obj.clone());
        }
        let obj = self.codec.decode(row)?;
        if key.is_complete() {
            self.cache.insert(key, obj.clone());
        }
        Ok(obj)
    }

    /// Run a filtered select and route each row through the cache.
    pub fn query<G: StoreGateway + ?Sized>(
        &mut self,
        gateway: &mut G,
        statement: &Statement,
        params: &[Value],
    ) -> StrataResult<Vec<ObjectRef>> {
        let rows = gateway.execute_query(statement, params)?;
        rows.into_iter().map(|row| self.absorb(row)).collect()
    }

    /// Equality search over columns.
    pub fn find<G: StoreGateway + ?Sized>(
        &mut self,
        gateway: &mut G,
        columns: Vec<String>,
        values: &[Value],
    ) -> StrataResult<Vec<ObjectRef>> {
        let statement = self.codec.select_where(columns);
        self.query(gateway, &statement, values)
    }

    fn check_vacant(&self, key: &Key, object: &ObjectRef) -> StrataResult<()> {
        if !key.is_complete() {
            return Err(IdentityError::IncompleteKey {
                class: self.class(),
                key: key.clone(),
            }
            .into());
        }
        match self.cache.get(key) {
            Some(other) if !other.ptr_eq(object) => Err(IdentityError::DuplicateKey {
                class: self.class(),
                key: key.clone(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Insert the object's row and cache it under its key.
    ///
    /// On any failure the cache and the object's recorded key are untouched.
    pub fn add<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G, object: &ObjectRef) -> StrataResult<()> {
        let key = self.codec.derive_key(object);
        self.check_vacant(&key, object)?;

        if let Err(e) = gateway.execute_write(self.codec.insert(), &object.values()) {
            tracing::warn!(class = %self.class(), %key, error = %e, "Insert failed");
            return Err(e);
        }

        object.set_key(Some(key.clone()));
        tracing::debug!(class = %self.class(), %key, "Object added");
        self.cache.insert(key, object.clone());
        Ok(())
    }

    /// Write the object's current attributes to the row stored under its
    /// recorded key, rekeying the cache if key attributes changed.
    ///
    /// On failure the recorded key and the cache keep the pre-update key.
    pub fn update<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G, object: &ObjectRef) -> StrataResult<()> {
        let old = object.key().ok_or_else(|| StoreError::UnassignedKey { class: self.class() })?;
        let new = self.codec.derive_key(object);
        if new != old {
            self.check_vacant(&new, object)?;
        }

        let params = self.codec.update_params(object, &old);
        let affected = match gateway.execute_write(self.codec.update(), &params) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(class = %self.class(), key = %old, error = %e, "Update failed");
                return Err(e);
            }
        };
        if affected == 0 {
            return Err(IdentityError::NotFound {
                class: self.class(),
                key: old,
            }
            .into());
        }

        if new != old {
            if matches!(self.cache.get(&old), Some(cached) if cached.ptr_eq(object)) {
                self.cache.shift_remove(&old);
            }
            tracing::debug!(class = %self.class(), from = %old, to = %new, "Object rekeyed");
            object.set_key(Some(new.clone()));
        }
        self.cache.insert(new, object.clone());
        Ok(())
    }

    /// Delete the row stored under the object's recorded key and evict it.
    pub fn delete<G: StoreGateway + ?Sized>(&mut self, gateway: &mut G, object: &ObjectRef) -> StrataResult<()> {
        let key = object.key().ok_or_else(|| StoreError::UnassignedKey { class: self.class() })?;

        if let Err(e) = gateway.execute_write(self.codec.delete(), key.values()) {
            tracing::warn!(class = %self.class(), %key, error = %e, "Delete failed");
            return Err(e);
        }

        if matches!(self.cache.get(&key), Some(cached) if cached.ptr_eq(object)) {
            self.cache.shift_remove(&key);
        }
        object.set_key(None);
        tracing::debug!(class = %self.class(), %key, "Object deleted");
        Ok(())
    }

    /// Forget every cached instance and return to the never-loaded state.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.state = BrokerState::Empty;
        self.stale = false;
    }
}
