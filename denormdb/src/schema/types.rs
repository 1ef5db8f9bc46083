use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub settings: StoreSettings,
    #[serde(default)]
    pub collections: HashMap<String, CollectionDefinition>,
}

/// Store-wide switches, read from the `settings:` block of schema.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Mark generated cache fields as hidden from auto-generated forms.
    #[serde(default)]
    pub forms_integration: bool,
    /// Run every write and its cascade inside one SQLite savepoint.
    #[serde(default = "default_true")]
    pub transactional_cascades: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            forms_integration: false,
            transactional_cascades: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Definition of a single collection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDefinition {
    #[serde(default)]
    pub fields: HashMap<String, FieldDefinition>,
    #[serde(default)]
    pub additional_properties: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub readonly: bool,
    /// Default delete policy for relationships declared in this collection.
    #[serde(default)]
    pub on_delete: Option<OnDeletePolicy>,
    #[serde(default)]
    pub id: Option<IdConfig>,
}

impl CollectionDefinition {
    /// Strategy used for ids of documents inserted without an explicit `_id`.
    pub fn auto_id(&self) -> AutoIdStrategy {
        self.id
            .as_ref()
            .and_then(|c| c.auto.clone())
            .unwrap_or(AutoIdStrategy::Ulid)
    }
}

/// Configuration for document ID generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    Ulid,
    Uuid,
    Nanoid,
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Left unset on reference fields, the schema transformer assigns it.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
    /// Item type name for lists (`string`, `number`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    /// Content of an object field is not validated.
    #[serde(default)]
    pub blackbox: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denormalize: Option<DenormalizeDeclaration>,
    /// Free-form metadata (labels, form hints) carried along untouched.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

/// Field type enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Datetime,
    List,
    Object,
    Ref,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::List => "list",
            FieldType::Object => "object",
            FieldType::Ref => "ref",
        }
    }
}

/// A relationship declaration as written under a field's `denormalize:` key.
///
/// Everything is optional at this level so that a missing `relation` or
/// `related_collection` surfaces as a configuration error from the schema
/// transformer instead of a YAML parse error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DenormalizeDeclaration {
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub related_collection: Option<String>,
    #[serde(default)]
    pub related_reference_property: Option<String>,
    #[serde(default)]
    pub pick_properties: Option<Vec<String>>,
    #[serde(default)]
    pub omit_properties: Option<Vec<String>>,
    #[serde(default)]
    pub extend_cache_field_by: Option<serde_yaml::Value>,
    #[serde(default)]
    pub on_delete: Option<OnDeletePolicy>,
}

impl DenormalizeDeclaration {
    /// The declaration's own policy, then the collection default. Without
    /// either, a single reference rejects the delete and an id list drops
    /// the deleted id.
    pub fn effective_on_delete(
        &self,
        collection_default: Option<&OnDeletePolicy>,
        holds_list: bool,
    ) -> OnDeletePolicy {
        self.on_delete
            .or_else(|| collection_default.copied())
            .unwrap_or(if holds_list {
                OnDeletePolicy::Nullify
            } else {
                OnDeletePolicy::Error
            })
    }
}

/// What happens to referencing documents when their related document is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDeletePolicy {
    Error,
    Nullify,
    Cascade,
}
