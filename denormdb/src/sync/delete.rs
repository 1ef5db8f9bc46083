use super::cascade::Cascade;
use super::descriptor::RelationDescriptor;
use super::tracer::{CascadeEvent, Trigger};
use crate::document::{reference_id, reference_ids, Document};
use crate::error::{DenormError, Result};
use crate::schema::{OnDeletePolicy, RelationKind};
use std::collections::HashSet;

/// Tracks removed documents so cascades through cycles terminate.
pub(crate) type Visited = HashSet<(String, String)>;

/// Settle every relationship touching `doc` before its row is removed:
/// apply the delete policy of each relationship pointing at it, then clean
/// the back-references it left on documents it points at.
pub(crate) fn handle_remove(
    cascade: &Cascade<'_>,
    descriptors: &[RelationDescriptor],
    collection: &str,
    doc: &Document,
    visited: &mut Visited,
) -> Result<()> {
    visited.insert((collection.to_string(), doc.id.clone()));

    let incoming: Vec<(&RelationDescriptor, Vec<String>)> = descriptors
        .iter()
        .filter(|d| d.related_collection == collection)
        .map(|d| {
            let holders = cascade
                .store()
                .find_ids(&d.collection, &d.selector_for(&doc.id))?
                .into_iter()
                .filter(|id| !(d.collection == collection && id == &doc.id))
                .collect::<Vec<_>>();
            Ok((d, holders))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|(_, holders)| !holders.is_empty())
        .collect();

    // Refuse before anything is written.
    for (d, holders) in &incoming {
        if d.on_delete == OnDeletePolicy::Error {
            return Err(DenormError::ReferentialIntegrity(format!(
                "cannot delete {collection}/{}: referenced by {} document(s) in {}.{} ({})",
                doc.id,
                holders.len(),
                d.collection,
                d.reference_field,
                holders.join(", ")
            )));
        }
    }

    for (d, holders) in &incoming {
        match d.on_delete {
            OnDeletePolicy::Error => {}
            OnDeletePolicy::Nullify => {
                for holder in holders {
                    cascade.trace(CascadeEvent::Reaction {
                        collection: d.collection.clone(),
                        id: holder.clone(),
                        field: d.reference_field.clone(),
                        trigger: Trigger::Remove,
                    });
                    match d.kind {
                        RelationKind::HasOne => cascade
                            .set_singular_reference_and_reload_cache(&d.own_side(), holder, None)?,
                        RelationKind::HasMany => {
                            cascade.remove_id_from_reference(&d.own_side(), holder, &doc.id)?
                        }
                    }
                }
            }
            OnDeletePolicy::Cascade => {
                for holder in holders {
                    let key = (d.collection.clone(), holder.clone());
                    if visited.contains(&key) {
                        continue;
                    }
                    let Some(child) = cascade.find(&d.collection, holder)? else {
                        continue;
                    };
                    handle_remove(cascade, descriptors, &d.collection, &child, visited)?;
                    cascade.store().remove_direct(&d.collection, holder)?;
                    cascade.trace(CascadeEvent::Removed {
                        collection: d.collection.clone(),
                        id: holder.clone(),
                    });
                }
            }
        }
    }

    for d in descriptors.iter().filter(|d| d.collection == collection) {
        clean_outgoing(cascade, d, doc)?;
    }
    Ok(())
}

/// Drop the back-references `doc` left on the documents it points at.
fn clean_outgoing(cascade: &Cascade<'_>, d: &RelationDescriptor, doc: &Document) -> Result<()> {
    let back = d.back_side();
    match d.kind {
        RelationKind::HasOne => {
            let Some(target) = reference_id(&doc.data, &d.reference_field)? else {
                return Ok(());
            };
            let Some(related) = cascade.find(back.collection, &target)? else {
                return Ok(());
            };
            let listed = reference_ids(&related.data, back.reference)?
                .iter()
                .any(|id| id == &doc.id);
            if listed {
                cascade.remove_id_from_reference(&back, &target, &doc.id)?;
            }
        }
        RelationKind::HasMany => {
            for related_id in reference_ids(&doc.data, &d.reference_field)? {
                let Some(related) = cascade.find(back.collection, &related_id)? else {
                    continue;
                };
                if reference_id(&related.data, back.reference)?.as_deref() == Some(doc.id.as_str()) {
                    cascade.set_singular_reference_and_reload_cache(&back, &related_id, None)?;
                }
            }
        }
    }
    Ok(())
}
