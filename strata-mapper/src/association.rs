//! Associations: mutable, diffable membership views between objects.
//!
//! Each owner object keeps one [`LinkState`] per association it has touched.
//! Membership is loaded lazily on first access through the related class's
//! identity broker, so an object reached through an association is the same
//! instance a direct lookup returns. `append` and `remove` change the view
//! immediately and record pending changes; `update` writes exactly those
//! changes back.
//!
//! A failed `update` leaves the pending sets as they were and does not undo
//! the optimistic view. Callers roll back the transaction and call
//! `reload_data` (or [`Session::reload_associations`]) before trusting the
//! view again.

use strata_core::{
    AssociationDecl, AssociationError, Key, SchemaError, StoreError, StrataResult, Value,
};
use strata_storage::{Statement, StoreGateway};

use crate::codec::LinkCodec;
use crate::object::{ObjectRef, WeakObjectRef};
use crate::session::Session;

/// Per-owner state of one association.
///
/// Current members are held weakly; the identity cache owns them. Pending
/// additions and removals are held strongly until written back. An object is
/// in at most one of `current` and `added`, and never in both `added` and
/// `removed`.
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    loaded: bool,
    current: Vec<WeakObjectRef>,
    added: Vec<ObjectRef>,
    removed: Vec<ObjectRef>,
}

impl LinkState {
    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn populate(&mut self, members: &[ObjectRef]) {
        self.loaded = true;
        self.current = members.iter().map(ObjectRef::downgrade).collect();
        self.added.clear();
        self.removed.clear();
    }

    /// Visible membership: live current members, then pending additions.
    fn members(&mut self) -> Vec<ObjectRef> {
        self.current.retain(WeakObjectRef::is_alive);
        self.current
            .iter()
            .filter_map(WeakObjectRef::upgrade)
            .chain(self.added.iter().cloned())
            .collect()
    }

    pub(crate) fn contains(&self, obj: &ObjectRef) -> bool {
        self.current.iter().any(|w| w.points_to(obj)) || self.added.contains(obj)
    }

    fn is_empty(&mut self) -> bool {
        self.members().is_empty()
    }

    /// Make `obj` a member. Restores a pending removal without store traffic.
    fn attach(&mut self, obj: &ObjectRef) {
        if let Some(i) = self.removed.iter().position(|o| o == obj) {
            self.removed.remove(i);
            self.current.push(obj.downgrade());
        } else if !self.contains(obj) {
            self.added.push(obj.clone());
        }
    }

    /// Drop `obj` from membership. Cancels a pending addition outright.
    fn detach(&mut self, obj: &ObjectRef) {
        if let Some(i) = self.added.iter().position(|o| o == obj) {
            self.added.remove(i);
        } else if let Some(i) = self.current.iter().position(|w| w.points_to(obj)) {
            self.current.remove(i);
            self.removed.push(obj.clone());
        }
    }

    /// Drop `obj` from the view without recording a removal.
    fn forget(&mut self, obj: &ObjectRef) {
        self.current.retain(|w| !w.points_to(obj));
        self.added.retain(|o| o != obj);
    }

    /// Forget every member except `keep`.
    fn forget_all_except(&mut self, keep: &ObjectRef) {
        for member in self.members() {
            if &member != keep {
                self.forget(&member);
            }
        }
    }

    /// Fold a pending entry for `obj` after the paired side wrote the same row change.
    fn settle(&mut self, obj: &ObjectRef) {
        if let Some(i) = self.added.iter().position(|o| o == obj) {
            let obj = self.added.remove(i);
            self.current.push(obj.downgrade());
        } else if let Some(i) = self.removed.iter().position(|o| o == obj) {
            self.removed.remove(i);
        }
    }

    /// Fold every pending change after a successful write-back.
    fn commit(&mut self) {
        let added = std::mem::take(&mut self.added);
        self.current.extend(added.iter().map(ObjectRef::downgrade));
        self.removed.clear();
    }

    /// Every object the state refers to: live members and pending removals.
    fn tracked(&mut self) -> Vec<ObjectRef> {
        let mut all = self.members();
        all.extend(self.removed.iter().cloned());
        all
    }

    fn reset(&mut self) {
        *self = LinkState::default();
    }
}

/// Keys resolved for a write-back, checked before any statement is issued.
struct WriteBack {
    owner_key: Key,
    added: Vec<(ObjectRef, Key)>,
    removed: Vec<(ObjectRef, Key)>,
}

/// Membership view of one association of one owner object.
pub struct Association<'s, G: StoreGateway> {
    session: &'s Session<G>,
    owner: ObjectRef,
    decl: &'s AssociationDecl,
    codec: &'s LinkCodec,
}

impl<'s, G: StoreGateway> Association<'s, G> {
    pub(crate) fn new(
        session: &'s Session<G>,
        owner: ObjectRef,
        decl: &'s AssociationDecl,
        codec: &'s LinkCodec,
    ) -> Self {
        Self {
            session,
            owner,
            decl,
            codec,
        }
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn owner(&self) -> &ObjectRef {
        &self.owner
    }

    pub fn decl(&self) -> &AssociationDecl {
        self.decl
    }

    /// True once membership has been read from the store.
    pub fn is_loaded(&self) -> bool {
        self.owner
            .with_loaded_link(&self.decl.name, |_| ())
            .is_some()
    }

    fn label(&self) -> String {
        format!("{}.{}", self.owner.class(), self.decl.name)
    }

    fn check_class(&self, candidate: &ObjectRef) -> StrataResult<()> {
        if candidate.is_instance_of(&self.decl.related) {
            Ok(())
        } else {
            Err(AssociationError::WrongClass {
                association: self.label(),
                expected: self.decl.related.clone(),
                found: candidate.class(),
            }
            .into())
        }
    }

    fn paired(&self) -> StrataResult<Option<(&'s AssociationDecl, &'s LinkCodec)>> {
        match &self.decl.back_ref {
            Some(back) => self.session.link(&self.decl.related, back).map(Some),
            None => Ok(None),
        }
    }

    fn ensure_loaded(&self) -> StrataResult<()> {
        ensure_loaded(self.session, &self.owner, self.decl, self.codec)
    }

    /// Current membership, loading it on first access.
    pub fn members(&self) -> StrataResult<Vec<ObjectRef>> {
        self.ensure_loaded()?;
        Ok(self.owner.with_link(&self.decl.name, LinkState::members))
    }

    pub fn contains(&self, candidate: &ObjectRef) -> StrataResult<bool> {
        self.ensure_loaded()?;
        Ok(self.owner.with_link(&self.decl.name, |s| s.contains(candidate)))
    }

    pub fn len(&self) -> StrataResult<usize> {
        Ok(self.members()?.len())
    }

    pub fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.members()?.is_empty())
    }

    /// The member of a single-valued association, if any.
    pub fn get(&self) -> StrataResult<Option<ObjectRef>> {
        Ok(self.members()?.into_iter().next())
    }

    /// Add `candidate` to the view and record a pending addition.
    ///
    /// For foreign-key backings a candidate held by another owner is moved:
    /// the previous owner's view drops it. Bidirectional pairs gain the
    /// back-reference immediately.
    pub fn append(&self, candidate: &ObjectRef) -> StrataResult<()> {
        self.check_class(candidate)?;
        self.ensure_loaded()?;

        let name = &self.decl.name;
        if self.owner.with_link(name, |s| s.contains(candidate)) {
            return Err(AssociationError::AlreadyMember {
                association: self.label(),
                class: candidate.class(),
            }
            .into());
        }
        if self.decl.is_single() && !self.owner.with_link(name, LinkState::is_empty) {
            return Err(AssociationError::Occupied {
                association: self.label(),
            }
            .into());
        }

        let paired = self.paired()?;
        if let Some((pdecl, pcodec)) = paired {
            ensure_loaded(self.session, candidate, pdecl, pcodec)?;
        }

        if matches!(self.codec, LinkCodec::Remote { .. }) {
            for other in self.session.cached_objects(&self.owner.class())? {
                if !other.ptr_eq(&self.owner) {
                    other.with_loaded_link(name, |s| s.forget(candidate));
                }
            }
        }

        self.owner.with_link(name, |s| s.attach(candidate));

        if let Some((pdecl, _)) = paired {
            let owner = &self.owner;
            candidate.with_link(&pdecl.name, |s| {
                if pdecl.is_single() {
                    s.forget_all_except(owner);
                }
                s.attach(owner);
            });
        }

        tracing::debug!(association = %self.label(), "Member appended");
        Ok(())
    }

    /// Drop `candidate` from the view and record a pending removal.
    pub fn remove(&self, candidate: &ObjectRef) -> StrataResult<()> {
        self.check_class(candidate)?;
        self.ensure_loaded()?;

        let name = &self.decl.name;
        if !self.owner.with_link(name, |s| s.contains(candidate)) {
            return Err(AssociationError::NotMember {
                association: self.label(),
                class: candidate.class(),
            }
            .into());
        }

        let paired = self.paired()?;
        if let Some((pdecl, pcodec)) = paired {
            ensure_loaded(self.session, candidate, pdecl, pcodec)?;
        }

        self.owner.with_link(name, |s| s.detach(candidate));
        if let Some((pdecl, _)) = paired {
            candidate.with_link(&pdecl.name, |s| s.detach(&self.owner));
        }

        tracing::debug!(association = %self.label(), "Member removed");
        Ok(())
    }

    /// Replace the member of a single-valued association.
    pub fn set(&self, candidate: Option<&ObjectRef>) -> StrataResult<()> {
        if !self.decl.is_single() {
            return Err(SchemaError::InvalidAssociation {
                class: self.owner.class(),
                name: self.decl.name.clone(),
                reason: "set requires a single-valued association".to_string(),
            }
            .into());
        }
        if let Some(c) = candidate {
            self.check_class(c)?;
        }

        let current = self.get()?;
        if let (Some(cur), Some(new)) = (&current, candidate) {
            if cur.ptr_eq(new) {
                return Ok(());
            }
        }
        if let Some(cur) = &current {
            self.remove(cur)?;
        }
        if let Some(new) = candidate {
            self.append(new)?;
        }
        Ok(())
    }

    pub fn pending_additions(&self) -> Vec<ObjectRef> {
        self.owner.with_link(&self.decl.name, |s| s.added.clone())
    }

    pub fn pending_removals(&self) -> Vec<ObjectRef> {
        self.owner.with_link(&self.decl.name, |s| s.removed.clone())
    }

    /// Discard pending changes and the loaded view; the next access re-queries.
    ///
    /// For bidirectional pairs the back-reference views of every tracked
    /// member are discarded too, since they mirror the changes dropped here.
    pub fn reload_data(&self) {
        reset_view(&self.owner, self.decl);
    }

    /// Write pending changes back to the store, removals first.
    ///
    /// Returns the number of statements issued. With nothing pending no
    /// statement is issued. On failure the error is returned as the store
    /// raised it and the pending sets are left unchanged.
    pub fn update(&self) -> StrataResult<usize> {
        let (added, removed) = self
            .owner
            .with_link(&self.decl.name, |s| (s.added.clone(), s.removed.clone()));
        if added.is_empty() && removed.is_empty() {
            tracing::debug!(association = %self.label(), "Nothing to write back");
            return Ok(0);
        }

        let resolved = self.resolve(added, removed)?;
        let statements = self.statements(&resolved);
        for (statement, params) in &statements {
            if let Err(e) = self.session.write(statement, params) {
                tracing::warn!(
                    association = %self.label(),
                    error = %e,
                    "Association write-back failed, pending changes kept"
                );
                return Err(e);
            }
        }

        self.sync_columns(&resolved);
        self.owner.with_link(&self.decl.name, LinkState::commit);
        if let Some(back) = &self.decl.back_ref {
            for (obj, _) in resolved.added.iter().chain(&resolved.removed) {
                obj.with_loaded_link(back, |s| s.settle(&self.owner));
            }
        }

        tracing::debug!(
            association = %self.label(),
            added = resolved.added.len(),
            removed = resolved.removed.len(),
            "Association written back"
        );
        Ok(statements.len())
    }

    fn resolve(&self, added: Vec<ObjectRef>, removed: Vec<ObjectRef>) -> StrataResult<WriteBack> {
        let keyed = |obj: &ObjectRef| {
            obj.key()
                .ok_or_else(|| StoreError::UnassignedKey { class: obj.class() })
        };
        let owner_key = keyed(&self.owner)?;
        let pair = |obj: ObjectRef| -> StrataResult<(ObjectRef, Key)> {
            let key = keyed(&obj)?;
            Ok((obj, key))
        };
        Ok(WriteBack {
            owner_key,
            added: added.into_iter().map(pair).collect::<StrataResult<_>>()?,
            removed: removed.into_iter().map(pair).collect::<StrataResult<_>>()?,
        })
    }

    fn statements<'c>(&'c self, wb: &WriteBack) -> Vec<(&'c Statement, Vec<Value>)> {
        let concat = |a: &Key, b: &Key| -> Vec<Value> {
            a.values().iter().chain(b.values()).cloned().collect()
        };
        let nulls = |n: usize, a: &Key, b: &Key| -> Vec<Value> {
            let mut params = vec![Value::Null; n];
            params.extend(concat(a, b));
            params
        };
        let owner = &wb.owner_key;

        let mut out = Vec::with_capacity(wb.added.len() + wb.removed.len());
        match self.codec {
            LinkCodec::Local {
                positions,
                assign,
                clear,
            } => {
                for (_, key) in &wb.removed {
                    out.push((clear, nulls(positions.len(), owner, key)));
                }
                for (_, key) in &wb.added {
                    out.push((assign, concat(key, owner)));
                }
            }
            LinkCodec::Remote {
                positions,
                assign,
                clear,
                ..
            } => {
                for (_, key) in &wb.removed {
                    out.push((clear, nulls(positions.len(), key, owner)));
                }
                for (_, key) in &wb.added {
                    out.push((assign, concat(owner, key)));
                }
            }
            LinkCodec::Join { insert, delete, .. } => {
                for (_, key) in &wb.removed {
                    out.push((delete, concat(owner, key)));
                }
                for (_, key) in &wb.added {
                    out.push((insert, concat(owner, key)));
                }
            }
        }
        out
    }

    /// Mirror a successful foreign-key write-back onto the in-memory rows.
    fn sync_columns(&self, wb: &WriteBack) {
        match self.codec {
            LinkCodec::Local { positions, .. } => {
                for (_, key) in &wb.removed {
                    if self.owner.values_at(positions) == key.values() {
                        self.owner.assign_at(positions, &vec![Value::Null; positions.len()]);
                    }
                }
                for (_, key) in &wb.added {
                    self.owner.assign_at(positions, key.values());
                }
            }
            LinkCodec::Remote { positions, .. } => {
                for (obj, _) in &wb.removed {
                    if obj.values_at(positions) == wb.owner_key.values() {
                        obj.assign_at(positions, &vec![Value::Null; positions.len()]);
                    }
                }
                for (obj, _) in &wb.added {
                    obj.assign_at(positions, wb.owner_key.values());
                }
            }
            LinkCodec::Join { .. } => {}
        }
    }
}

/// Drop `owner`'s view of `decl` and the paired views of the objects it tracked.
pub(crate) fn reset_view(owner: &ObjectRef, decl: &AssociationDecl) {
    let tracked = owner
        .with_loaded_link(&decl.name, |s| {
            let tracked = s.tracked();
            s.reset();
            tracked
        })
        .unwrap_or_default();
    if let Some(back) = &decl.back_ref {
        for obj in &tracked {
            obj.with_loaded_link(back, LinkState::reset);
        }
    }
}

/// Load `owner`'s membership of `decl` unless already loaded.
pub(crate) fn ensure_loaded<G: StoreGateway>(
    session: &Session<G>,
    owner: &ObjectRef,
    decl: &AssociationDecl,
    codec: &LinkCodec,
) -> StrataResult<()> {
    if owner.with_link(&decl.name, |s| s.is_loaded()) {
        return Ok(());
    }
    let members = load_members(session, owner, decl, codec)?;
    owner.with_link(&decl.name, |s| s.populate(&members));
    tracing::debug!(
        class = %owner.class(),
        association = %decl.name,
        count = members.len(),
        "Association loaded"
    );
    Ok(())
}

fn load_members<G: StoreGateway>(
    session: &Session<G>,
    owner: &ObjectRef,
    decl: &AssociationDecl,
    codec: &LinkCodec,
) -> StrataResult<Vec<ObjectRef>> {
    match codec {
        LinkCodec::Local { positions, .. } => {
            let key = Key::new(owner.values_at(positions));
            if !key.is_complete() {
                return Ok(Vec::new());
            }
            Ok(vec![session.get(&decl.related, key)?])
        }
        LinkCodec::Remote { select, .. } => {
            let Some(key) = owner.key() else {
                return Ok(Vec::new());
            };
            let mut found = session.query(&decl.related, select, key.values())?;
            // Rows pending addition to another owner have moved in memory.
            let moved: Vec<ObjectRef> = session
                .cached_objects(&owner.class())?
                .into_iter()
                .filter(|other| !other.ptr_eq(owner))
                .filter_map(|other| other.with_loaded_link(&decl.name, |s| s.added.clone()))
                .flatten()
                .collect();
            found.retain(|c| !moved.contains(c));
            Ok(found)
        }
        LinkCodec::Join { select, .. } => {
            let Some(key) = owner.key() else {
                return Ok(Vec::new());
            };
            session
                .query_rows(select, key.values())?
                .into_iter()
                .map(|row| session.get(&decl.related, Key::new(row)))
                .collect()
        }
    }
}
