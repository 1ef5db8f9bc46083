//! Building blocks shared by the reactions: loading, direct writes and the
//! reference/cache primitives.

use super::descriptor::{FieldPair, RelationDescriptor};
use super::tracer::{CascadeEvent, Tracer};
use crate::document::{
    ensure_list_cache_field, ensure_list_field, list_cache, reference_id, reference_ids,
    Document, Patch,
};
use crate::error::{DenormError, Result};
use crate::hooks::DirectStore;
use crate::schema::RelationKind;
use serde_json::Value;

pub(crate) struct Cascade<'a> {
    store: &'a dyn DirectStore,
    tracer: &'a dyn Tracer,
}

impl<'a> Cascade<'a> {
    pub(crate) fn new(store: &'a dyn DirectStore, tracer: &'a dyn Tracer) -> Self {
        Cascade { store, tracer }
    }

    pub(crate) fn store(&self) -> &'a dyn DirectStore {
        self.store
    }

    pub(crate) fn trace(&self, event: CascadeEvent) {
        self.tracer.event(&event);
    }

    pub(crate) fn find(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.store.find_one(collection, id)
    }

    /// Load a document that must exist.
    pub(crate) fn load(&self, collection: &str, id: &str, context: &str) -> Result<Document> {
        self.store
            .find_one(collection, id)?
            .ok_or_else(|| DenormError::dangling(collection, id, context))
    }

    /// Direct write of a patch. Zero affected documents is a failure.
    pub(crate) fn apply_direct(&self, collection: &str, id: &str, patch: &Patch) -> Result<()> {
        let affected = self.store.update_direct(collection, id, patch)?;
        if affected == 0 {
            return Err(DenormError::WriteFailure {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.trace(CascadeEvent::DirectWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: patch.touched_fields(),
        });
        Ok(())
    }

    /// Full-document direct `$set`.
    pub(crate) fn write_direct(&self, collection: &str, doc: &Document) -> Result<()> {
        self.apply_direct(collection, &doc.id, &Patch::set_all(&doc.data))
    }

    /// Projected snapshot of the document `side` points at.
    fn project(&self, side: &FieldPair<'_>, target: &str) -> Result<Value> {
        let related = self.load(
            side.related_collection,
            target,
            &format!("{}.{}", side.collection, side.reference),
        )?;
        Ok(side.projection.apply(&related))
    }

    /// Point a single reference at `target` and reload its cache, or unset
    /// both when `target` is `None`.
    pub(crate) fn set_singular_reference_and_reload_cache(
        &self,
        side: &FieldPair<'_>,
        id: &str,
        target: Option<&str>,
    ) -> Result<()> {
        let patch = match target {
            Some(target) => {
                let snapshot = self.project(side, target)?;
                Patch::new()
                    .set(side.reference, Value::String(target.to_string()))
                    .set(side.cache, snapshot)
            }
            None => Patch::new().unset(side.reference).unset(side.cache),
        };
        self.apply_direct(side.collection, id, &patch)
    }

    /// Replace a reference list and rebuild its list-cache in the same order.
    /// Every id must resolve before anything is written.
    pub(crate) fn set_list_reference_and_reload_cache(
        &self,
        side: &FieldPair<'_>,
        id: &str,
        ids: &[String],
    ) -> Result<()> {
        let mut doc = self.load(side.collection, id, "reference list owner")?;
        ensure_list_field(&mut doc.data, side.reference)?;
        ensure_list_cache_field(&mut doc.data, side.cache)?;

        let mut instances = Vec::with_capacity(ids.len());
        for target in ids {
            instances.push(self.project(side, target)?);
        }

        let list = ids.iter().cloned().map(Value::String).collect();
        let patch = Patch::new()
            .set(side.reference, Value::Array(list))
            .set(side.cache, list_cache(instances));
        self.apply_direct(side.collection, id, &patch)
    }

    /// Union `add` into the reference list of document `id`.
    pub(crate) fn add_id_to_reference(&self, side: &FieldPair<'_>, id: &str, add: &str) -> Result<()> {
        let mut doc = self.load(side.collection, id, "reference list owner")?;
        ensure_list_field(&mut doc.data, side.reference)?;
        let mut ids = reference_ids(&doc.data, side.reference)?;
        if !ids.iter().any(|existing| existing == add) {
            ids.push(add.to_string());
        }
        self.set_list_reference_and_reload_cache(side, id, &ids)
    }

    /// Remove `remove` from the reference list of document `id`.
    pub(crate) fn remove_id_from_reference(
        &self,
        side: &FieldPair<'_>,
        id: &str,
        remove: &str,
    ) -> Result<()> {
        let mut doc = self.load(side.collection, id, "reference list owner")?;
        ensure_list_field(&mut doc.data, side.reference)?;
        let ids: Vec<String> = reference_ids(&doc.data, side.reference)?
            .into_iter()
            .filter(|existing| existing != remove)
            .collect();
        self.set_list_reference_and_reload_cache(side, id, &ids)
    }

    /// Rebuild the cache of document `id` from its current reference value.
    pub(crate) fn refresh_denormalization(
        &self,
        side: &FieldPair<'_>,
        id: &str,
        kind: RelationKind,
    ) -> Result<()> {
        let doc = self.load(side.collection, id, "refreshed document")?;
        match kind {
            RelationKind::HasOne => {
                let target = reference_id(&doc.data, side.reference)?;
                if target.is_none() && doc.get(side.cache).is_none() {
                    return Ok(());
                }
                self.set_singular_reference_and_reload_cache(side, id, target.as_deref())
            }
            RelationKind::HasMany => {
                let ids = reference_ids(&doc.data, side.reference)?;
                self.set_list_reference_and_reload_cache(side, id, &ids)
            }
        }
    }

    /// Make `new_owner` the single owner of related document `related_id`
    /// and drop it from the list of a different previous owner. Returns the
    /// previous owner's id.
    pub(crate) fn transfer_ownership(
        &self,
        relation: &RelationDescriptor,
        related_id: &str,
        new_owner: &Document,
    ) -> Result<Option<String>> {
        let back = relation.back_side();
        let related = self.load(
            back.collection,
            related_id,
            &format!("{}.{}", relation.collection, relation.reference_field),
        )?;
        let previous = reference_id(&related.data, back.reference)?;

        let patch = Patch::new()
            .set(back.reference, Value::String(new_owner.id.clone()))
            .set(back.cache, back.projection.apply(new_owner));
        self.apply_direct(back.collection, related_id, &patch)?;

        if let Some(prev) = previous.as_deref().filter(|prev| *prev != new_owner.id) {
            if self.find(&relation.collection, prev)?.is_none() {
                return Err(DenormError::dangling(
                    &relation.collection,
                    prev,
                    &format!("previous owner of {}/{related_id}", back.collection),
                ));
            }
            self.remove_id_from_reference(&relation.own_side(), prev, related_id)?;
            self.trace(CascadeEvent::OwnershipTransferred {
                collection: back.collection.to_string(),
                id: related_id.to_string(),
                from: prev.to_string(),
                to: new_owner.id.clone(),
            });
        }

        Ok(previous)
    }
}
