// Documents, patches ($set / $unset), selectors and the shape helpers used
// by the synchronization engine.

use crate::error::{DenormError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Name under which a document's id appears in snapshots and in insert payloads.
pub const ID_FIELD: &str = "_id";

/// Member of a list-cache holding the ordered snapshots.
pub const CACHE_INSTANCES_FIELD: &str = "instances";

pub type Fields = Map<String, Value>;

/// A stored document: id, store-maintained timestamps, and its JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub data: Fields,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// The document as it is copied into caches: its fields plus `_id`.
    pub fn snapshot(&self) -> Fields {
        let mut snapshot = Fields::new();
        snapshot.insert(ID_FIELD.into(), Value::String(self.id.clone()));
        for (k, v) in &self.data {
            if k != ID_FIELD {
                snapshot.insert(k.clone(), v.clone());
            }
        }
        snapshot
    }

    /// Deserialize the document fields into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let value = Value::Object(self.snapshot());
        Ok(serde_json::from_value(value)?)
    }

    /// JSON view with id, timestamps and fields at the top level.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        obj.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        obj.insert(
            "modified_at".into(),
            Value::String(self.modified_at.to_rfc3339()),
        );
        for (k, v) in &self.data {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// A field-level modification: `$set` values and `$unset` names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    set: Fields,
    unset: BTreeSet<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set_field(field, value);
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset_field(field);
        self
    }

    pub fn set_field(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        self.unset.remove(&field);
        self.set.insert(field, value);
    }

    pub fn unset_field(&mut self, field: impl Into<String>) {
        let field = field.into();
        self.set.remove(&field);
        self.unset.insert(field);
    }

    /// `$set` of every given field, the full-document write.
    pub fn set_all(fields: &Fields) -> Self {
        let mut patch = Patch::new();
        for (k, v) in fields {
            if k != ID_FIELD {
                patch.set_field(k.clone(), v.clone());
            }
        }
        patch
    }

    /// Build a patch from a JSON object. `null` values unset their field.
    pub fn from_object(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(DenormError::Validation(
                "update payload must be a JSON object".into(),
            ));
        };
        let mut patch = Patch::new();
        for (k, v) in fields {
            if k == ID_FIELD {
                return Err(DenormError::Validation(format!(
                    "field '{ID_FIELD}' cannot be updated"
                )));
            }
            if v.is_null() {
                patch.unset_field(k);
            } else {
                patch.set_field(k, v);
            }
        }
        Ok(patch)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Names of all fields this patch sets or unsets.
    pub fn touched_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.set.keys().cloned().collect();
        fields.extend(self.unset.iter().cloned());
        fields.sort();
        fields
    }

    pub fn apply(&self, data: &mut Fields) {
        for (k, v) in &self.set {
            data.insert(k.clone(), v.clone());
        }
        for k in &self.unset {
            data.remove(k);
        }
    }
}

/// Names of the fields whose values differ between two versions of a document.
pub fn changed_fields(before: &Fields, after: &Fields) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect()
}

/// A conjunction of field conditions, used for `count` and back-reference lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Eq { field: String, value: Value },
    Contains { field: String, value: Value },
}

impl Selector {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Field equals value. `_id` compares against the document id.
    pub fn eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.into(),
            value,
        });
        self
    }

    /// List field contains value.
    pub fn contains(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push(Clause::Contains {
            field: field.into(),
            value,
        });
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq { field, value } if field == ID_FIELD => {
                value.as_str() == Some(doc.id.as_str())
            }
            Clause::Eq { field, value } => doc.get(field) == Some(value),
            Clause::Contains { field, value } => doc
                .get(field)
                .and_then(Value::as_array)
                .map(|items| items.contains(value))
                .unwrap_or(false),
        })
    }
}

// ── Shape helpers ───────────────────────────────────────────────

/// Make sure `field` holds a list: absent or null becomes `[]`, any other
/// non-list value is a data inconsistency. Idempotent.
pub fn ensure_list_field(data: &mut Fields, field: &str) -> Result<()> {
    match data.get(field) {
        None | Some(Value::Null) => {
            data.insert(field.to_string(), Value::Array(Vec::new()));
            Ok(())
        }
        Some(Value::Array(_)) => Ok(()),
        Some(other) => Err(DenormError::DataInconsistency(format!(
            "expected field '{field}' to be a list, found {}",
            json_type_name(other)
        ))),
    }
}

/// Make sure `cache` holds `{instances: [...]}`: absent or null is
/// initialized, an object without an `instances` list is a data
/// inconsistency. Idempotent.
pub fn ensure_list_cache_field(data: &mut Fields, cache: &str) -> Result<()> {
    match data.get(cache) {
        None | Some(Value::Null) => {
            data.insert(cache.to_string(), empty_list_cache());
            Ok(())
        }
        Some(Value::Object(obj)) => match obj.get(CACHE_INSTANCES_FIELD) {
            Some(Value::Array(_)) => Ok(()),
            Some(other) => Err(DenormError::DataInconsistency(format!(
                "expected '{cache}.{CACHE_INSTANCES_FIELD}' to be a list, found {}",
                json_type_name(other)
            ))),
            None => Err(DenormError::DataInconsistency(format!(
                "cache '{cache}' has no '{CACHE_INSTANCES_FIELD}' member"
            ))),
        },
        Some(other) => Err(DenormError::DataInconsistency(format!(
            "expected cache '{cache}' to be an object, found {}",
            json_type_name(other)
        ))),
    }
}

pub fn empty_list_cache() -> Value {
    list_cache(Vec::new())
}

pub fn list_cache(instances: Vec<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert(CACHE_INSTANCES_FIELD.into(), Value::Array(instances));
    Value::Object(obj)
}

/// Read a single-id reference. Absent, null and empty string mean "unset".
pub fn reference_id(data: &Fields, field: &str) -> Result<Option<String>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DenormError::DataInconsistency(format!(
            "expected reference '{field}' to be an id string, found {}",
            json_type_name(other)
        ))),
    }
}

/// Read an id-list reference. Absent and null mean the empty list.
pub fn reference_ids(data: &Fields, field: &str) -> Result<Vec<String>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    DenormError::DataInconsistency(format!(
                        "reference list '{field}' contains a non-string {}",
                        json_type_name(item)
                    ))
                })
            })
            .collect(),
        Some(other) => Err(DenormError::DataInconsistency(format!(
            "expected reference list '{field}' to be a list, found {}",
            json_type_name(other)
        ))),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn doc(id: &str, value: Value) -> Document {
        Document {
            id: id.into(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            data: fields(value),
        }
    }

    #[test]
    fn test_parse_into_typed_struct() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Post {
            #[serde(rename = "_id")]
            id: String,
            post: String,
            #[serde(rename = "commentIds")]
            comment_ids: Vec<String>,
        }

        let post: Post = doc("p1", json!({ "post": "post 1", "commentIds": ["c1"] }))
            .parse()
            .unwrap();
        assert_eq!(
            post,
            Post {
                id: "p1".into(),
                post: "post 1".into(),
                comment_ids: vec!["c1".into()],
            }
        );

        let missing: Result<Post> = doc("p2", json!({ "post": "post 2" })).parse();
        assert!(matches!(missing, Err(DenormError::Json(_))));
    }

    #[test]
    fn test_to_json_flattens_id_timestamps_and_fields() {
        let d = doc("p1", json!({ "post": "post 1" }));
        let value = d.to_json();
        assert_eq!(value["id"], json!("p1"));
        assert_eq!(value["post"], json!("post 1"));
        assert_eq!(value["created_at"], json!(d.created_at.to_rfc3339()));
        assert_eq!(value["modified_at"], json!(d.modified_at.to_rfc3339()));
        assert_eq!(value.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_ensure_list_field_initializes_and_is_idempotent() {
        let mut data = fields(json!({ "name": "a" }));
        ensure_list_field(&mut data, "postIds").unwrap();
        let once = data.clone();
        ensure_list_field(&mut data, "postIds").unwrap();
        assert_eq!(data, once);
        assert_eq!(data["postIds"], json!([]));
    }

    #[test]
    fn test_ensure_list_field_keeps_existing_list() {
        let mut data = fields(json!({ "postIds": ["p1"] }));
        ensure_list_field(&mut data, "postIds").unwrap();
        assert_eq!(data["postIds"], json!(["p1"]));
    }

    #[test]
    fn test_ensure_list_field_rejects_scalar() {
        let mut data = fields(json!({ "postIds": "p1" }));
        let err = ensure_list_field(&mut data, "postIds").unwrap_err();
        assert!(matches!(err, DenormError::DataInconsistency(_)));
    }

    #[test]
    fn test_ensure_list_cache_field_initializes_and_is_idempotent() {
        let mut data = fields(json!({}));
        ensure_list_cache_field(&mut data, "postCache").unwrap();
        let once = data.clone();
        ensure_list_cache_field(&mut data, "postCache").unwrap();
        assert_eq!(data, once);
        assert_eq!(data["postCache"], json!({ "instances": [] }));
    }

    #[test]
    fn test_ensure_list_cache_field_rejects_bad_shapes() {
        let mut missing = fields(json!({ "postCache": { "other": [] } }));
        assert!(matches!(
            ensure_list_cache_field(&mut missing, "postCache"),
            Err(DenormError::DataInconsistency(_))
        ));

        let mut not_list = fields(json!({ "postCache": { "instances": {} } }));
        assert!(matches!(
            ensure_list_cache_field(&mut not_list, "postCache"),
            Err(DenormError::DataInconsistency(_))
        ));
    }

    #[test]
    fn test_patch_set_and_unset() {
        let mut data = fields(json!({ "a": 1, "b": 2 }));
        Patch::new()
            .set("c", json!(3))
            .unset("a")
            .apply(&mut data);
        assert_eq!(Value::Object(data), json!({ "b": 2, "c": 3 }));
    }

    #[test]
    fn test_patch_from_object_null_unsets() {
        let patch = Patch::from_object(json!({ "postId": null, "text": "x" })).unwrap();
        assert_eq!(patch.touched_fields(), vec!["postId", "text"]);

        let mut data = fields(json!({ "postId": "p1", "text": "old" }));
        patch.apply(&mut data);
        assert_eq!(Value::Object(data), json!({ "text": "x" }));
    }

    #[test]
    fn test_patch_from_object_rejects_id() {
        assert!(Patch::from_object(json!({ "_id": "x" })).is_err());
        assert!(Patch::from_object(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_changed_fields() {
        let before = fields(json!({ "a": 1, "b": 2, "c": 3 }));
        let after = fields(json!({ "a": 1, "b": 5, "d": 4 }));
        assert_eq!(changed_fields(&before, &after), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_selector_matches() {
        let d = doc("c1", json!({ "postId": "p1", "tagIds": ["t1", "t2"] }));
        assert!(Selector::all().matches(&d));
        assert!(Selector::all().eq("postId", json!("p1")).matches(&d));
        assert!(!Selector::all().eq("postId", json!("p2")).matches(&d));
        assert!(Selector::all().contains("tagIds", json!("t2")).matches(&d));
        assert!(!Selector::all().contains("postId", json!("p1")).matches(&d));
        assert!(Selector::all().eq(ID_FIELD, json!("c1")).matches(&d));
    }

    #[test]
    fn test_reference_accessors() {
        let data = fields(json!({ "postId": "", "authorId": "a1", "tagIds": ["t1"], "bad": 3 }));
        assert_eq!(reference_id(&data, "postId").unwrap(), None);
        assert_eq!(reference_id(&data, "missing").unwrap(), None);
        assert_eq!(reference_id(&data, "authorId").unwrap(), Some("a1".into()));
        assert!(reference_id(&data, "bad").is_err());

        assert_eq!(reference_ids(&data, "tagIds").unwrap(), vec!["t1"]);
        assert!(reference_ids(&data, "missing").unwrap().is_empty());
        assert!(reference_ids(&data, "authorId").is_err());
    }

    #[test]
    fn test_snapshot_includes_id() {
        let d = doc("a1", json!({ "name": "author 1" }));
        assert_eq!(
            Value::Object(d.snapshot()),
            json!({ "_id": "a1", "name": "author 1" })
        );
    }
}
