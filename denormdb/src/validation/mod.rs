use crate::document::{json_type_name, Fields};
use crate::error::{DenormError, Result};
use crate::schema::{CollectionDefinition, FieldDefinition, FieldType};
use serde_json::Value;

/// Result of validating a document
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validate a document's fields against its (expanded) collection definition.
/// In strict collections issues are errors, otherwise they are warnings.
pub fn validate_document(collection: &CollectionDefinition, data: &Fields) -> ValidationResult {
    let mut result = ValidationResult {
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let mut names: Vec<&String> = collection.fields.keys().collect();
    names.sort();

    for field_name in names {
        let field_def = &collection.fields[field_name];
        let value = data.get(field_name.as_str());

        if field_def.required && matches!(value, None | Some(Value::Null)) {
            if field_def.default.is_none() {
                add_issue(
                    &mut result,
                    collection.strict,
                    format!("Required field '{field_name}' is missing"),
                );
            }
            continue;
        }

        if let Some(val) = value {
            if !val.is_null() {
                validate_field_value(field_name, field_def, val, collection.strict, &mut result);
            }
        }
    }

    if !collection.additional_properties {
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        for key in keys {
            if !collection.fields.contains_key(key) {
                add_issue(
                    &mut result,
                    collection.strict,
                    format!("Unexpected field '{key}' (additional_properties is false)"),
                );
            }
        }
    }

    result
}

/// Fill in declared defaults for absent or null fields.
pub fn apply_defaults(collection: &CollectionDefinition, data: &mut Fields) -> Result<()> {
    for (field_name, field_def) in &collection.fields {
        let has_value = data
            .get(field_name.as_str())
            .map(|v| !v.is_null())
            .unwrap_or(false);

        if !has_value {
            if let Some(default) = &field_def.default {
                data.insert(field_name.clone(), serde_json::to_value(default)?);
            }
        }
    }
    Ok(())
}

fn validate_field_value(
    field_name: &str,
    field_def: &FieldDefinition,
    value: &Value,
    strict: bool,
    result: &mut ValidationResult,
) {
    // An untyped field accepts anything.
    let Some(field_type) = &field_def.field_type else {
        return;
    };

    let expected_ok = match field_type {
        FieldType::String | FieldType::Ref | FieldType::Date | FieldType::Datetime => {
            value.is_string()
        }
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::List => value.is_array(),
        FieldType::Object => value.is_object(),
    };
    if !expected_ok {
        add_issue(
            result,
            strict,
            format!(
                "Field '{field_name}' expected {}, got {}",
                field_type.as_str(),
                json_type_name(value)
            ),
        );
        return;
    }

    if let (Some(enum_values), Some(s)) = (&field_def.enum_values, value.as_str()) {
        if !enum_values.iter().any(|allowed| allowed == s) {
            add_issue(
                result,
                strict,
                format!("Field '{field_name}' value '{s}' is not in enum: {enum_values:?}"),
            );
        }
    }

    if let (Some(items), Some(values)) = (field_def.items.as_deref(), value.as_array()) {
        for (i, item) in values.iter().enumerate() {
            if !item_matches(items, item) {
                add_issue(
                    result,
                    strict,
                    format!(
                        "Field '{field_name}[{i}]' expected {items}, got {}",
                        json_type_name(item)
                    ),
                );
            }
        }
    }
}

fn item_matches(items: &str, value: &Value) -> bool {
    match items {
        "string" | "ref" | "date" | "datetime" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "list" => value.is_array(),
        _ => true,
    }
}

fn add_issue(result: &mut ValidationResult, strict: bool, message: String) {
    if strict {
        result.errors.push(message);
    } else {
        result.warnings.push(message);
    }
}

/// Apply defaults and validate. Returns an error if strict validation fails,
/// otherwise the warnings.
pub fn validate_and_prepare(collection: &CollectionDefinition, data: &mut Fields) -> Result<Vec<String>> {
    apply_defaults(collection, data)?;
    let result = validate_document(collection, data);

    if !result.is_ok() {
        return Err(DenormError::Validation(format!(
            "Document validation failed:\n  - {}",
            result.errors.join("\n  - ")
        )));
    }

    Ok(result.warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema_str, SchemaDefinition, SchemaTransformer};
    use serde_json::json;

    fn test_schema() -> SchemaDefinition {
        let mut schema = parse_schema_str(
            r#"
collections:
  authors:
    fields:
      name: { type: string, required: true }
      role: { type: string, enum: [admin, member, guest], default: member }
      postIds:
        denormalize:
          relation: has_many
          related_collection: posts
          related_reference_property: authorId
    strict: true

  posts:
    fields:
      post: { type: string, required: true }
      tags: { type: list, items: string }
      authorId:
        denormalize:
          relation: has_one
          related_collection: authors
          related_reference_property: postIds
    strict: true

  events:
    fields:
      type: { type: string, required: true }
      payload: { type: object }
    additional_properties: true
    strict: false
"#,
        )
        .unwrap();
        SchemaTransformer::new(false).expand(&mut schema).unwrap();
        schema
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_author() {
        let schema = test_schema();
        let data = fields(json!({ "name": "Alice", "role": "admin", "postIds": ["p1"] }));
        let result = validate_document(&schema.collections["authors"], &data);
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_cache_fields_accept_any_object() {
        let schema = test_schema();
        let data = fields(json!({
            "post": "post 1",
            "authorId": "a1",
            "authorCache": { "_id": "a1", "nested": { "deep": [1, 2] } }
        }));
        let result = validate_document(&schema.collections["posts"], &data);
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_required_field() {
        let schema = test_schema();
        let result = validate_document(&schema.collections["authors"], &fields(json!({})));
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.contains("name")));
    }

    #[test]
    fn test_invalid_enum_value() {
        let schema = test_schema();
        let data = fields(json!({ "name": "Alice", "role": "superadmin" }));
        let result = validate_document(&schema.collections["authors"], &data);
        assert!(result.errors.iter().any(|e| e.contains("superadmin")));
    }

    #[test]
    fn test_reference_type_mismatch() {
        let schema = test_schema();
        let data = fields(json!({ "post": "post 1", "authorId": ["a1"] }));
        let result = validate_document(&schema.collections["posts"], &data);
        assert!(result.errors.iter().any(|e| e.contains("authorId")));

        let data = fields(json!({ "name": "Alice", "postIds": ["p1", 2] }));
        let result = validate_document(&schema.collections["authors"], &data);
        assert!(result.errors.iter().any(|e| e.contains("postIds[1]")));
    }

    #[test]
    fn test_additional_properties_rejected() {
        let schema = test_schema();
        let data = fields(json!({ "name": "Alice", "extra_field": "oops" }));
        let result = validate_document(&schema.collections["authors"], &data);
        assert!(result.errors.iter().any(|e| e.contains("extra_field")));
    }

    #[test]
    fn test_non_strict_mode_warnings() {
        let schema = test_schema();
        let data = fields(json!({ "type": 123, "extra": "data" }));
        let result = validate_document(&schema.collections["events"], &data);
        assert!(result.is_ok());
        assert!(result.has_warnings());
    }

    #[test]
    fn test_validate_and_prepare_applies_defaults() {
        let schema = test_schema();
        let mut data = fields(json!({ "name": "Alice" }));
        let warnings = validate_and_prepare(&schema.collections["authors"], &mut data).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(data["role"], json!("member"));
    }

    #[test]
    fn test_validate_and_prepare_rejects_in_strict_mode() {
        let schema = test_schema();
        let mut data = fields(json!({ "post": 5 }));
        let err = validate_and_prepare(&schema.collections["posts"], &mut data).unwrap_err();
        assert!(matches!(err, DenormError::Validation(_)));
    }
}
