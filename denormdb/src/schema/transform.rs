//! Expansion of `denormalize:` declarations into reference and cache fields.
//!
//! For every `*Id` / `*Ids` field carrying a declaration the transformer
//! validates the declaration, forces the reference field's type to match its
//! cardinality, and adds a generated `*Cache` field next to it. The result is
//! a plain [`SchemaDefinition`] plus the list of [`DeclaredRelation`]s the
//! synchronization engine is built from.

use super::relation::{DeclaredRelation, RelationKind, Relationship};
use super::types::{CollectionDefinition, FieldDefinition, FieldType, SchemaDefinition, StoreSettings};
use crate::error::{DenormError, Result};
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::HashMap;

const CACHE_SUFFIX: &str = "Cache";

/// Keys on a generated cache field that `extend_cache_field_by` cannot override.
const RESERVED_CACHE_KEYS: &[&str] = &[
    "type",
    "required",
    "optional",
    "blackbox",
    "denormalize",
    "enum",
    "default",
    "items",
];

/// `postId` → `postCache`, `commentIds` → `commentCache`.
pub fn cache_field_name(reference_field: &str) -> String {
    let base = reference_field
        .strip_suffix("Ids")
        .or_else(|| reference_field.strip_suffix("Id"))
        .unwrap_or(reference_field);
    format!("{base}{CACHE_SUFFIX}")
}

/// Whether a field name is eligible to carry a relationship declaration.
pub fn is_reference_candidate(field: &str) -> bool {
    field.ends_with("Id") || field.ends_with("Ids")
}

fn is_embedded(field: &str) -> bool {
    field.contains('$') || field.contains('.')
}

/// Names of all fields in a collection that carry a declaration, sorted.
pub fn find_denormalized_fields(definition: &CollectionDefinition) -> Vec<String> {
    let mut fields: Vec<String> = definition
        .fields
        .iter()
        .filter(|(_, f)| f.denormalize.is_some())
        .map(|(name, _)| name.clone())
        .collect();
    fields.sort();
    fields
}

pub struct SchemaTransformer {
    forms_integration: bool,
}

impl SchemaTransformer {
    pub fn new(forms_integration: bool) -> Self {
        SchemaTransformer { forms_integration }
    }

    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self::new(settings.forms_integration)
    }

    /// Expand every collection in place and return the declared relationships.
    ///
    /// Fails on the first invalid declaration; on error the schema may be
    /// partially expanded and should be discarded.
    pub fn expand(&self, schema: &mut SchemaDefinition) -> Result<Vec<DeclaredRelation>> {
        let registered = schema.collections.clone();

        let mut names: Vec<String> = schema.collections.keys().cloned().collect();
        names.sort();

        let mut relations = Vec::new();
        for name in &names {
            if let Some(definition) = schema.collections.get_mut(name) {
                relations.extend(self.expand_collection(name, definition, &registered)?);
            }
        }

        check_related_collections(&relations, &registered)?;
        check_reciprocals(&relations)?;
        declare_one_way_back_fields(schema, &relations);

        for relation in &relations {
            log::debug!(
                "denormalized data for {}.{} will be available in {}.{}",
                relation.relationship.related_collection(),
                relation.reference_field,
                relation.collection,
                relation.cache_field
            );
        }
        Ok(relations)
    }

    /// Expand one collection's fields. `registered` is the unexpanded schema
    /// of every known collection, used to check back-reference fields.
    pub fn expand_collection(
        &self,
        collection: &str,
        definition: &mut CollectionDefinition,
        registered: &HashMap<String, CollectionDefinition>,
    ) -> Result<Vec<DeclaredRelation>> {
        let mut relations = Vec::new();

        for field in find_denormalized_fields(definition) {
            if is_embedded(&field) {
                return Err(DenormError::Configuration(format!(
                    "{collection}.{field}: relationships inside embedded arrays are not supported"
                )));
            }
            if !is_reference_candidate(&field) {
                log::warn!(
                    "{collection}.{field}: denormalize is only read on fields ending in Id or Ids, ignoring"
                );
                continue;
            }

            let Some(field_def) = definition.fields.get_mut(&field) else {
                continue;
            };
            let Some(decl) = field_def.denormalize.clone() else {
                continue;
            };
            let relationship = Relationship::from_declaration(&field, &decl)
                .map_err(|e| in_collection(collection, e))?;

            if relationship.kind() == RelationKind::HasOne {
                if let Some(related) = registered.get(relationship.related_collection()) {
                    if !related.fields.contains_key(relationship.back_reference()) {
                        return Err(DenormError::Configuration(format!(
                            "{collection}.{field}: related_reference_property '{}' is not a field of collection '{}'",
                            relationship.back_reference(),
                            relationship.related_collection()
                        )));
                    }
                }
            }

            force_reference_type(collection, &field, field_def, relationship.kind())?;

            let cache_field = cache_field_name(&field);
            if definition.fields.contains_key(&cache_field) {
                return Err(DenormError::Configuration(format!(
                    "{collection}.{field}: generated cache field '{cache_field}' collides with a declared field"
                )));
            }
            let cache = self.cache_field(&field, decl.extend_cache_field_by.as_ref())?;
            definition.fields.insert(cache_field.clone(), cache);

            relations.push(DeclaredRelation {
                collection: collection.to_string(),
                reference_field: field,
                cache_field,
                on_delete: decl.effective_on_delete(
                    definition.on_delete.as_ref(),
                    relationship.kind() == RelationKind::HasMany,
                ),
                relationship,
            });
        }

        Ok(relations)
    }

    fn cache_field(&self, field: &str, extension: Option<&YamlValue>) -> Result<FieldDefinition> {
        let mut metadata = Mapping::new();
        if self.forms_integration {
            let mut autoform = Mapping::new();
            autoform.insert("omit".into(), YamlValue::Bool(true));
            metadata.insert("autoform".into(), YamlValue::Mapping(autoform));
        }

        match extension {
            None | Some(YamlValue::Null) => {}
            Some(YamlValue::Mapping(ext)) => deep_merge(&mut metadata, ext),
            Some(_) => {
                return Err(DenormError::Configuration(format!(
                    "field '{field}': extend_cache_field_by must be a mapping"
                )))
            }
        }

        let mut cache = FieldDefinition {
            field_type: Some(FieldType::Object),
            required: false,
            blackbox: true,
            ..Default::default()
        };
        for (k, v) in metadata {
            let Some(key) = k.as_str() else { continue };
            if !RESERVED_CACHE_KEYS.contains(&key) {
                cache.metadata.insert(key.to_string(), v);
            }
        }
        Ok(cache)
    }
}

fn force_reference_type(
    collection: &str,
    field: &str,
    def: &mut FieldDefinition,
    kind: RelationKind,
) -> Result<()> {
    let mismatch = |found: &str| {
        DenormError::Configuration(format!(
            "{collection}.{field}: a {} reference must be {}, found type '{found}'",
            kind.as_str(),
            match kind {
                RelationKind::HasOne => "a string id",
                RelationKind::HasMany => "a list of string ids",
            }
        ))
    };

    match kind {
        RelationKind::HasOne => match &def.field_type {
            None => def.field_type = Some(FieldType::String),
            Some(FieldType::String) | Some(FieldType::Ref) => {}
            Some(other) => return Err(mismatch(other.as_str())),
        },
        RelationKind::HasMany => match (&def.field_type, def.items.as_deref()) {
            (None, _) => {
                def.field_type = Some(FieldType::List);
                def.items = Some("string".into());
            }
            (Some(FieldType::List), None) => def.items = Some("string".into()),
            (Some(FieldType::List), Some("string")) => {}
            (Some(FieldType::List), Some(items)) => {
                return Err(mismatch(&format!("list of {items}")))
            }
            (Some(other), _) => return Err(mismatch(other.as_str())),
        },
    }
    Ok(())
}

/// Merge `ext` into `base`. Keys from `ext` win; nested mappings merge so
/// that siblings only present in `base` survive.
fn deep_merge(base: &mut Mapping, ext: &Mapping) {
    for (k, v) in ext {
        if let YamlValue::Mapping(incoming) = v {
            if let Some(YamlValue::Mapping(existing)) = base.get_mut(k) {
                deep_merge(existing, incoming);
                continue;
            }
        }
        base.insert(k.clone(), v.clone());
    }
}

fn in_collection(collection: &str, err: DenormError) -> DenormError {
    match err {
        DenormError::Configuration(msg) => {
            DenormError::Configuration(format!("collection '{collection}': {msg}"))
        }
        other => other,
    }
}

fn check_related_collections(
    relations: &[DeclaredRelation],
    registered: &HashMap<String, CollectionDefinition>,
) -> Result<()> {
    for r in relations {
        let related = r.relationship.related_collection();
        if !registered.contains_key(related) {
            return Err(DenormError::Configuration(format!(
                "{}.{}: related collection '{related}' is not defined",
                r.collection, r.reference_field
            )));
        }
    }
    Ok(())
}

/// A relationship declared on one side only still writes a back-reference
/// and a back cache onto the related documents. Declare both there so that
/// related documents keep validating under `additional_properties: false`.
fn declare_one_way_back_fields(schema: &mut SchemaDefinition, relations: &[DeclaredRelation]) {
    for r in relations {
        let related = r.relationship.related_collection();
        let back_reference = r.relationship.back_reference();
        let reciprocal = relations
            .iter()
            .any(|o| o.collection == related && o.reference_field == back_reference);
        if reciprocal {
            continue;
        }
        let Some(definition) = schema.collections.get_mut(related) else {
            continue;
        };

        if r.relationship.kind() == RelationKind::HasMany {
            definition
                .fields
                .entry(back_reference.to_string())
                .or_insert_with(|| FieldDefinition {
                    field_type: Some(FieldType::String),
                    required: false,
                    ..Default::default()
                });
        }
        definition
            .fields
            .entry(cache_field_name(back_reference))
            .or_insert_with(|| FieldDefinition {
                field_type: Some(FieldType::Object),
                required: false,
                blackbox: true,
                ..Default::default()
            });
    }
}

/// When both sides declare a relationship they must describe the same link.
fn check_reciprocals(relations: &[DeclaredRelation]) -> Result<()> {
    let by_field: HashMap<(&str, &str), &DeclaredRelation> = relations
        .iter()
        .map(|r| ((r.collection.as_str(), r.reference_field.as_str()), r))
        .collect();

    for r in relations {
        let key = (
            r.relationship.related_collection(),
            r.relationship.back_reference(),
        );
        let Some(other) = by_field.get(&key) else {
            continue;
        };
        let points_back = other.relationship.related_collection() == r.collection
            && other.relationship.back_reference() == r.reference_field;
        if other.relationship.kind() != r.relationship.kind().opposite() || !points_back {
            return Err(DenormError::Configuration(format!(
                "{}.{} ({}) and {}.{} ({}) do not describe the same relationship",
                r.collection,
                r.reference_field,
                r.relationship.kind().as_str(),
                other.collection,
                other.reference_field,
                other.relationship.kind().as_str()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use crate::schema::{OnDeletePolicy, Projection};
    use pretty_assertions::assert_eq;

    const BLOG: &str = r#"
collections:
  authors:
    fields:
      name: { type: string }
      postIds:
        denormalize:
          relation: has_many
          related_collection: posts
          related_reference_property: authorId
          pick_properties: [post]
  posts:
    fields:
      post: { type: string }
      authorId:
        denormalize:
          relation: has_one
          related_collection: authors
          related_reference_property: postIds
          on_delete: nullify
"#;

    fn expand(yaml: &str, forms: bool) -> Result<(SchemaDefinition, Vec<DeclaredRelation>)> {
        let mut schema = parse_schema_str(yaml)?;
        let relations = SchemaTransformer::new(forms).expand(&mut schema)?;
        Ok((schema, relations))
    }

    #[test]
    fn test_cache_field_name() {
        assert_eq!(cache_field_name("postId"), "postCache");
        assert_eq!(cache_field_name("commentIds"), "commentCache");
        assert_eq!(cache_field_name("authorId"), "authorCache");
        assert_eq!(cache_field_name("owner"), "ownerCache");
    }

    #[test]
    fn test_expand_blog_schema() {
        let (schema, relations) = expand(BLOG, false).unwrap();

        let authors = &schema.collections["authors"];
        assert_eq!(authors.fields["postIds"].field_type, Some(FieldType::List));
        assert_eq!(authors.fields["postIds"].items.as_deref(), Some("string"));
        let post_cache = &authors.fields["postCache"];
        assert_eq!(post_cache.field_type, Some(FieldType::Object));
        assert!(!post_cache.required);
        assert!(post_cache.blackbox);
        assert!(post_cache.metadata.is_empty());

        let posts = &schema.collections["posts"];
        assert_eq!(posts.fields["authorId"].field_type, Some(FieldType::String));
        assert!(posts.fields.contains_key("authorCache"));

        assert_eq!(relations.len(), 2);
        assert_eq!(relations[0].collection, "authors");
        assert_eq!(relations[0].cache_field, "postCache");
        assert_eq!(relations[0].on_delete, OnDeletePolicy::Nullify);
        assert_eq!(
            relations[0].relationship.projection(),
            &Projection::Pick(vec!["post".into()])
        );
        assert_eq!(relations[1].collection, "posts");
        assert_eq!(relations[1].on_delete, OnDeletePolicy::Nullify);
    }

    #[test]
    fn test_forms_integration_marks_cache_omitted() {
        let (schema, _) = expand(BLOG, true).unwrap();
        let cache = &schema.collections["posts"].fields["authorCache"];
        let autoform = cache.metadata["autoform"].as_mapping().unwrap();
        assert_eq!(autoform.get("omit"), Some(&YamlValue::Bool(true)));
    }

    #[test]
    fn test_extend_cache_field_by_merges_and_keeps_base_settings() {
        let yaml = r#"
collections:
  posts:
    fields:
      commentIds: { type: list }
  comments:
    fields:
      postId:
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
          extend_cache_field_by:
            label: Post
            blackbox: false
            type: string
            autoform:
              afFieldInput: { type: hidden }
"#;
        let (schema, _) = expand(yaml, true).unwrap();
        let cache = &schema.collections["comments"].fields["postCache"];
        assert_eq!(cache.field_type, Some(FieldType::Object));
        assert!(cache.blackbox);
        assert_eq!(cache.metadata["label"], YamlValue::String("Post".into()));
        assert!(!cache.metadata.contains_key("type"));

        let autoform = cache.metadata["autoform"].as_mapping().unwrap();
        assert_eq!(autoform.get("omit"), Some(&YamlValue::Bool(true)));
        assert!(autoform.contains_key("afFieldInput"));
    }

    #[test]
    fn test_extend_cache_field_by_overrides_nested_default() {
        let yaml = r#"
collections:
  posts:
    fields:
      commentIds: { type: list }
  comments:
    fields:
      postId:
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
          extend_cache_field_by:
            autoform:
              omit: overwrite standard
"#;
        let (schema, _) = expand(yaml, true).unwrap();
        let autoform = schema.collections["comments"].fields["postCache"].metadata["autoform"]
            .as_mapping()
            .cloned()
            .unwrap();
        assert_eq!(
            autoform.get("omit"),
            Some(&YamlValue::String("overwrite standard".into()))
        );
    }

    #[test]
    fn test_unknown_relation_is_rejected() {
        let yaml = r#"
collections:
  posts: { fields: { commentIds: { type: list } } }
  comments:
    fields:
      postId:
        denormalize:
          relation: belongs_to
          related_collection: posts
          related_reference_property: commentIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(matches!(err, DenormError::Configuration(_)));
    }

    #[test]
    fn test_has_many_without_back_reference_is_rejected() {
        let yaml = r#"
collections:
  comments: { fields: { postId: { type: string } } }
  posts:
    fields:
      commentIds:
        denormalize:
          relation: has_many
          related_collection: comments
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("related_reference_property"));
    }

    #[test]
    fn test_has_one_back_reference_must_exist_on_related() {
        let yaml = r#"
collections:
  posts: { fields: { title: { type: string } } }
  comments:
    fields:
      postId:
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("commentIds"));
    }

    #[test]
    fn test_reference_type_mismatch_is_rejected() {
        let has_one_list = r#"
collections:
  posts: { fields: { commentIds: { type: list } } }
  comments:
    fields:
      postId:
        type: list
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
"#;
        assert!(matches!(
            expand(has_one_list, false),
            Err(DenormError::Configuration(_))
        ));

        let has_many_string = r#"
collections:
  comments: { fields: { postId: { type: string } } }
  posts:
    fields:
      commentIds:
        type: string
        denormalize:
          relation: has_many
          related_collection: comments
          related_reference_property: postId
"#;
        assert!(matches!(
            expand(has_many_string, false),
            Err(DenormError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_related_collection_is_rejected() {
        let yaml = r#"
collections:
  comments:
    fields:
      postId:
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("posts"));
    }

    #[test]
    fn test_cache_name_collision_is_rejected() {
        let yaml = r#"
collections:
  posts: { fields: { commentIds: { type: list } } }
  comments:
    fields:
      postCache: { type: string }
      postId:
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("postCache"));
    }

    #[test]
    fn test_embedded_reference_is_rejected() {
        let yaml = r#"
collections:
  posts: { fields: { commentIds: { type: list } } }
  comments:
    fields:
      "items.$.postId":
        denormalize:
          relation: has_one
          related_collection: posts
          related_reference_property: commentIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("embedded"));
    }

    #[test]
    fn test_reciprocal_mismatch_is_rejected() {
        let yaml = r#"
collections:
  authors:
    fields:
      otherIds: { type: list }
      postIds:
        denormalize:
          relation: has_many
          related_collection: posts
          related_reference_property: authorId
  posts:
    fields:
      authorId:
        denormalize:
          relation: has_one
          related_collection: authors
          related_reference_property: otherIds
"#;
        let err = expand(yaml, false).unwrap_err();
        assert!(err.to_string().contains("same relationship"));
    }

    #[test]
    fn test_one_way_relations_declare_back_fields_on_related() {
        let yaml = r#"
collections:
  guests:
    strict: true
    fields:
      name: { type: string }
      commentIds: { type: list, items: string }
      postIds:
        denormalize:
          relation: has_many
          related_collection: posts
          related_reference_property: guestId
  comments:
    fields:
      guestId:
        denormalize:
          relation: has_one
          related_collection: guests
          related_reference_property: commentIds
  posts:
    fields:
      post: { type: string }
"#;
        let (schema, _) = expand(yaml, false).unwrap();

        let guests = &schema.collections["guests"];
        let back_cache = &guests.fields["commentCache"];
        assert_eq!(back_cache.field_type, Some(FieldType::Object));
        assert!(back_cache.blackbox);
        assert!(!back_cache.required);
        assert_eq!(guests.fields["commentIds"].field_type, Some(FieldType::List));

        let posts = &schema.collections["posts"];
        assert_eq!(posts.fields["guestId"].field_type, Some(FieldType::String));
        assert!(!posts.fields["guestId"].required);
        assert!(posts.fields["guestCache"].blackbox);
    }

    #[test]
    fn test_reciprocal_relations_add_no_extra_fields() {
        let (schema, _) = expand(BLOG, false).unwrap();
        let mut authors: Vec<&String> = schema.collections["authors"].fields.keys().collect();
        authors.sort();
        assert_eq!(authors, ["name", "postCache", "postIds"]);
        let mut posts: Vec<&String> = schema.collections["posts"].fields.keys().collect();
        posts.sort();
        assert_eq!(posts, ["authorCache", "authorId", "post"]);
    }

    #[test]
    fn test_fields_without_declaration_are_untouched() {
        let yaml = r#"
collections:
  posts:
    fields:
      ownerId: { type: number }
"#;
        let (schema, relations) = expand(yaml, false).unwrap();
        assert!(relations.is_empty());
        assert_eq!(
            schema.collections["posts"].fields["ownerId"].field_type,
            Some(FieldType::Number)
        );
        assert_eq!(schema.collections["posts"].fields.len(), 1);
    }
}
