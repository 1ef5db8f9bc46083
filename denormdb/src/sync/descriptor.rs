use crate::schema::{cache_field_name, DeclaredRelation, OnDeletePolicy, Projection, RelationKind};
use crate::document::Selector;
use serde_json::Value;

/// Everything the engine needs to maintain one declared relationship,
/// resolved once when the store opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub collection: String,
    pub reference_field: String,
    pub cache_field: String,
    pub kind: RelationKind,
    pub related_collection: String,
    /// Field on the related documents pointing back.
    pub back_reference: String,
    pub back_cache: String,
    /// Projection of related documents into `cache_field`.
    pub projection: Projection,
    /// Projection of this collection's documents into `back_cache`.
    pub back_projection: Projection,
    /// Whether the related collection declares the back-reference itself.
    pub reciprocal: bool,
    pub on_delete: OnDeletePolicy,
}

/// One reference field and the cache it feeds.
#[derive(Debug, Clone, Copy)]
pub struct FieldPair<'a> {
    pub collection: &'a str,
    pub reference: &'a str,
    pub cache: &'a str,
    /// Collection the reference points into.
    pub related_collection: &'a str,
    pub projection: &'a Projection,
}

impl RelationDescriptor {
    pub fn build_all(relations: &[DeclaredRelation]) -> Vec<RelationDescriptor> {
        relations
            .iter()
            .map(|r| {
                let related = r.relationship.related_collection();
                let back_reference = r.relationship.back_reference();
                let reciprocal = relations.iter().find(|other| {
                    other.collection == related && other.reference_field == back_reference
                });

                RelationDescriptor {
                    collection: r.collection.clone(),
                    reference_field: r.reference_field.clone(),
                    cache_field: r.cache_field.clone(),
                    kind: r.relationship.kind(),
                    related_collection: related.to_string(),
                    back_reference: back_reference.to_string(),
                    back_cache: reciprocal
                        .map(|o| o.cache_field.clone())
                        .unwrap_or_else(|| cache_field_name(back_reference)),
                    projection: r.relationship.projection().clone(),
                    back_projection: reciprocal
                        .map(|o| o.relationship.projection().clone())
                        .unwrap_or_default(),
                    reciprocal: reciprocal.is_some(),
                    on_delete: r.on_delete,
                }
            })
            .collect()
    }

    /// The reference field declared on this collection.
    pub fn own_side(&self) -> FieldPair<'_> {
        FieldPair {
            collection: &self.collection,
            reference: &self.reference_field,
            cache: &self.cache_field,
            related_collection: &self.related_collection,
            projection: &self.projection,
        }
    }

    /// The back-reference on the related collection.
    pub fn back_side(&self) -> FieldPair<'_> {
        FieldPair {
            collection: &self.related_collection,
            reference: &self.back_reference,
            cache: &self.back_cache,
            related_collection: &self.collection,
            projection: &self.back_projection,
        }
    }

    /// Kind of the back-reference, always the opposite cardinality.
    pub fn back_kind(&self) -> RelationKind {
        self.kind.opposite()
    }

    /// Documents of this collection whose reference includes `target_id`.
    pub fn selector_for(&self, target_id: &str) -> Selector {
        let value = Value::String(target_id.to_string());
        match self.kind {
            RelationKind::HasOne => Selector::all().eq(self.reference_field.clone(), value),
            RelationKind::HasMany => Selector::all().contains(self.reference_field.clone(), value),
        }
    }

    /// Whether an update touched anything besides this relationship's cache.
    pub(crate) fn has_relevant_change(&self, changed: &[String]) -> bool {
        changed.iter().any(|f| f != &self.cache_field)
    }
}
