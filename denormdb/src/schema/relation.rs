use super::types::{DenormalizeDeclaration, OnDeletePolicy};
use crate::document::{Document, Fields};
use crate::error::{DenormError, Result};
use serde_json::Value;

/// Cardinality of a relationship, seen from the field that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// The declaring document holds one id; the related side holds a list.
    HasOne,
    /// The declaring document holds a list of ids; each related document holds one id.
    HasMany,
}

impl RelationKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "has_one" | "many_to_one" => Ok(RelationKind::HasOne),
            "has_many" | "one_to_many" => Ok(RelationKind::HasMany),
            "one_to_one" | "many_to_many" => Err(DenormError::Configuration(format!(
                "relation '{raw}' is not supported, use has_one or has_many"
            ))),
            other => Err(DenormError::Configuration(format!(
                "unknown relation '{other}'"
            ))),
        }
    }

    /// The kind the reciprocal field must declare.
    pub fn opposite(self) -> Self {
        match self {
            RelationKind::HasOne => RelationKind::HasMany,
            RelationKind::HasMany => RelationKind::HasOne,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
        }
    }
}

/// Which fields of a related document end up in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    #[default]
    Full,
    /// Ordered allow-list.
    Pick(Vec<String>),
    /// Deny-list.
    Omit(Vec<String>),
}

impl Projection {
    /// A pick list takes precedence over an omit list.
    pub fn from_lists(pick: Option<&[String]>, omit: Option<&[String]>) -> Self {
        match (pick, omit) {
            (Some(pick), _) => Projection::Pick(pick.to_vec()),
            (None, Some(omit)) => Projection::Omit(omit.to_vec()),
            (None, None) => Projection::Full,
        }
    }

    pub fn apply(&self, doc: &Document) -> Value {
        Value::Object(self.apply_fields(doc.snapshot()))
    }

    pub fn apply_fields(&self, snapshot: Fields) -> Fields {
        match self {
            Projection::Full => snapshot,
            Projection::Pick(keep) => {
                let mut picked = Fields::new();
                for key in keep {
                    if let Some(v) = snapshot.get(key) {
                        picked.insert(key.clone(), v.clone());
                    }
                }
                picked
            }
            Projection::Omit(drop) => snapshot
                .into_iter()
                .filter(|(k, _)| !drop.contains(k))
                .collect(),
        }
    }
}

/// A validated relationship declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relationship {
    HasOne {
        related_collection: String,
        back_reference: String,
        projection: Projection,
    },
    HasMany {
        related_collection: String,
        back_reference: String,
        projection: Projection,
    },
}

impl Relationship {
    /// Validate a raw declaration. `field` is only used in error messages.
    pub fn from_declaration(field: &str, decl: &DenormalizeDeclaration) -> Result<Self> {
        let relation = decl.relation.as_deref().ok_or_else(|| {
            DenormError::Configuration(format!("field '{field}': denormalize.relation is missing"))
        })?;
        let kind = RelationKind::parse(relation)
            .map_err(|e| prefix_field(field, e))?;
        let related_collection = decl
            .related_collection
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                DenormError::Configuration(format!(
                    "field '{field}': denormalize.related_collection is missing"
                ))
            })?;
        let back_reference = decl
            .related_reference_property
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                let reason = match kind {
                    RelationKind::HasOne => "it names the id list on the related documents",
                    RelationKind::HasMany => {
                        "each related document stores its single owner's id there, which keeps ownership exclusive"
                    }
                };
                DenormError::Configuration(format!(
                    "field '{field}': denormalize.related_reference_property is required for {} relations: {reason}",
                    kind.as_str()
                ))
            })?;
        let projection = Projection::from_lists(
            decl.pick_properties.as_deref(),
            decl.omit_properties.as_deref(),
        );

        Ok(match kind {
            RelationKind::HasOne => Relationship::HasOne {
                related_collection,
                back_reference,
                projection,
            },
            RelationKind::HasMany => Relationship::HasMany {
                related_collection,
                back_reference,
                projection,
            },
        })
    }

    pub fn kind(&self) -> RelationKind {
        match self {
            Relationship::HasOne { .. } => RelationKind::HasOne,
            Relationship::HasMany { .. } => RelationKind::HasMany,
        }
    }

    pub fn related_collection(&self) -> &str {
        match self {
            Relationship::HasOne { related_collection, .. }
            | Relationship::HasMany { related_collection, .. } => related_collection,
        }
    }

    pub fn back_reference(&self) -> &str {
        match self {
            Relationship::HasOne { back_reference, .. }
            | Relationship::HasMany { back_reference, .. } => back_reference,
        }
    }

    pub fn projection(&self) -> &Projection {
        match self {
            Relationship::HasOne { projection, .. }
            | Relationship::HasMany { projection, .. } => projection,
        }
    }
}

fn prefix_field(field: &str, err: DenormError) -> DenormError {
    match err {
        DenormError::Configuration(msg) => {
            DenormError::Configuration(format!("field '{field}': {msg}"))
        }
        other => other,
    }
}

/// One relationship as produced by schema expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRelation {
    pub collection: String,
    pub reference_field: String,
    pub cache_field: String,
    pub relationship: Relationship,
    pub on_delete: OnDeletePolicy,
}
