use super::cascade::Cascade;
use super::descriptor::RelationDescriptor;
use super::tracer::{CascadeEvent, Trigger};
use crate::document::{
    ensure_list_cache_field, ensure_list_field, reference_id, reference_ids, Document, CACHE_INSTANCES_FIELD,
};
use crate::error::Result;
use crate::schema::RelationKind;
use serde_json::Value;

fn trace_reaction(cascade: &Cascade<'_>, d: &RelationDescriptor, id: &str, trigger: Trigger) {
    cascade.trace(CascadeEvent::Reaction {
        collection: d.collection.clone(),
        id: id.to_string(),
        field: d.reference_field.clone(),
        trigger,
    });
}

pub(crate) fn after_insert(cascade: &Cascade<'_>, d: &RelationDescriptor, doc: &Document) -> Result<()> {
    match d.kind {
        RelationKind::HasOne => has_one_inserted(cascade, d, doc),
        RelationKind::HasMany => has_many_inserted(cascade, d, doc),
    }
}

pub(crate) fn after_update(
    cascade: &Cascade<'_>,
    d: &RelationDescriptor,
    doc: &Document,
    changed: &[String],
    previous: &Document,
) -> Result<()> {
    match d.kind {
        RelationKind::HasOne => has_one_updated(cascade, d, doc, changed, previous),
        RelationKind::HasMany => has_many_updated(cascade, d, doc, changed, previous),
    }
}

// ── HAS_ONE: the document holds one id, the related side holds a list ──

fn has_one_inserted(cascade: &Cascade<'_>, d: &RelationDescriptor, doc: &Document) -> Result<()> {
    let Some(target) = reference_id(&doc.data, &d.reference_field)? else {
        return Ok(());
    };
    trace_reaction(cascade, d, &doc.id, Trigger::Insert);

    cascade.set_singular_reference_and_reload_cache(&d.own_side(), &doc.id, Some(target.as_str()))?;

    let back = d.back_side();
    let mut related = cascade.load(back.collection, &target, "inserted reference")?;
    ensure_list_field(&mut related.data, back.reference)?;
    ensure_list_cache_field(&mut related.data, back.cache)?;

    let already_listed = reference_ids(&related.data, back.reference)?
        .iter()
        .any(|id| id == &doc.id);
    if already_listed {
        return cascade.refresh_denormalization(&back, &target, RelationKind::HasMany);
    }

    if let Some(Value::Array(ids)) = related.data.get_mut(back.reference) {
        ids.push(Value::String(doc.id.clone()));
    }
    let snapshot = back.projection.apply(doc);
    if let Some(Value::Array(instances)) = related
        .data
        .get_mut(back.cache)
        .and_then(|cache| cache.get_mut(CACHE_INSTANCES_FIELD))
    {
        instances.push(snapshot);
    }
    cascade.write_direct(back.collection, &related)
}

fn has_one_updated(
    cascade: &Cascade<'_>,
    d: &RelationDescriptor,
    doc: &Document,
    changed: &[String],
    previous: &Document,
) -> Result<()> {
    let own = d.own_side();
    let back = d.back_side();
    let current = reference_id(&doc.data, &d.reference_field)?;

    if !changed.iter().any(|f| f == &d.reference_field) {
        // Reference unchanged: the related list-cache still shows the old fields.
        if let Some(target) = current.filter(|_| d.has_relevant_change(changed)) {
            trace_reaction(cascade, d, &doc.id, Trigger::Update);
            cascade.refresh_denormalization(&back, &target, RelationKind::HasMany)?;
        }
        return Ok(());
    }

    trace_reaction(cascade, d, &doc.id, Trigger::Update);
    let old = reference_id(&previous.data, &d.reference_field)?;

    cascade.set_singular_reference_and_reload_cache(&own, &doc.id, current.as_deref())?;

    if let Some(target) = current.as_deref() {
        cascade.add_id_to_reference(&back, target, &doc.id)?;
    }

    if let Some(old) = old.filter(|old| current.as_deref() != Some(old.as_str())) {
        if cascade.find(back.collection, &old)?.is_some() {
            cascade.remove_id_from_reference(&back, &old, &doc.id)?;
        } else {
            log::warn!(
                "{}/{}: previous {} '{old}' no longer exists, nothing to clean up",
                d.collection,
                doc.id,
                d.reference_field
            );
        }
    }
    Ok(())
}

// ── HAS_MANY: the document holds a list, each related document one id ──

fn has_many_inserted(cascade: &Cascade<'_>, d: &RelationDescriptor, doc: &Document) -> Result<()> {
    if doc.get(&d.reference_field).map_or(true, Value::is_null) {
        return Ok(());
    }
    trace_reaction(cascade, d, &doc.id, Trigger::Insert);

    let ids = reference_ids(&doc.data, &d.reference_field)?;
    cascade.set_list_reference_and_reload_cache(&d.own_side(), &doc.id, &ids)?;

    for related_id in &ids {
        cascade.transfer_ownership(d, related_id, doc)?;
    }
    Ok(())
}

fn has_many_updated(
    cascade: &Cascade<'_>,
    d: &RelationDescriptor,
    doc: &Document,
    changed: &[String],
    previous: &Document,
) -> Result<()> {
    let own = d.own_side();
    let back = d.back_side();
    let current = reference_ids(&doc.data, &d.reference_field)?;

    if !changed.iter().any(|f| f == &d.reference_field) {
        if !d.has_relevant_change(changed) {
            return Ok(());
        }
        trace_reaction(cascade, d, &doc.id, Trigger::Update);
        for related_id in &current {
            refresh_back_cache(cascade, d, related_id, &doc.id)?;
        }
        return Ok(());
    }

    trace_reaction(cascade, d, &doc.id, Trigger::Update);
    let old = reference_ids(&previous.data, &d.reference_field)?;

    cascade.set_list_reference_and_reload_cache(&own, &doc.id, &current)?;
    let owner = cascade.load(&d.collection, &doc.id, "updated document")?;

    for added in current.iter().filter(|id| !old.contains(id)) {
        cascade.transfer_ownership(d, added, &owner)?;
    }

    for removed in old.iter().filter(|id| !current.contains(id)) {
        let related = cascade.load(back.collection, removed, "removed reference")?;
        if reference_id(&related.data, back.reference)?.as_deref() == Some(doc.id.as_str()) {
            cascade.set_singular_reference_and_reload_cache(&back, removed, None)?;
        }
    }

    let others_changed = changed
        .iter()
        .any(|f| f != &d.reference_field && f != &d.cache_field);
    if others_changed {
        for kept in current.iter().filter(|id| old.contains(id)) {
            refresh_back_cache(cascade, d, kept, &doc.id)?;
        }
    }
    Ok(())
}

/// Reload the back-cache of `related_id` from `owner_id`, unless it has
/// moved on to another owner.
fn refresh_back_cache(
    cascade: &Cascade<'_>,
    d: &RelationDescriptor,
    related_id: &str,
    owner_id: &str,
) -> Result<()> {
    let back = d.back_side();
    let related = cascade.load(back.collection, related_id, "referenced document")?;
    match reference_id(&related.data, back.reference)? {
        Some(points_at) if points_at == owner_id => {
            cascade.set_singular_reference_and_reload_cache(&back, related_id, Some(owner_id))
        }
        other => {
            log::warn!(
                "{}/{related_id}: {} is {:?}, expected '{owner_id}', cache left as is",
                back.collection,
                back.reference,
                other
            );
            Ok(())
        }
    }
}

/// A related document changed and nobody maintains the reverse direction:
/// reload the caches of every document of `d.collection` referencing it.
pub(crate) fn refresh_one_way(
    cascade: &Cascade<'_>,
    d: &RelationDescriptor,
    related: &Document,
    changed: &[String],
) -> Result<()> {
    if changed.iter().all(|f| f == &d.back_reference || f == &d.back_cache) {
        return Ok(());
    }
    let holders = cascade
        .store()
        .find_ids(&d.collection, &d.selector_for(&related.id))?;
    for holder in holders {
        trace_reaction(cascade, d, &holder, Trigger::Refresh);
        cascade.refresh_denormalization(&d.own_side(), &holder, d.kind)?;
    }
    Ok(())
}

/// Rebuild the cache of one document from its current reference.
pub(crate) fn resync(cascade: &Cascade<'_>, d: &RelationDescriptor, id: &str) -> Result<()> {
    trace_reaction(cascade, d, id, Trigger::Refresh);
    cascade.refresh_denormalization(&d.own_side(), id, d.kind)
}
