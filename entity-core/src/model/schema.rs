//! Model metadata: field types, model definitions and value validation

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Values;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Text,
    Number,
    Integer,
    Boolean,
    Date,
    Datetime,
    Enum,
    Json,
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefCardinality {
    #[default]
    One,
    Many,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values of an `enum` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_cardinality: Option<RefCardinality>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            name: name.into(),
            title: None,
            field_type,
            required: false,
            options: None,
            ref_model: None,
            ref_cardinality: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options(mut self, options: Vec<Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn reference(
        name: impl Into<String>,
        ref_model: impl Into<String>,
        cardinality: RefCardinality,
    ) -> Self {
        FieldDefinition {
            ref_model: Some(ref_model.into()),
            ref_cardinality: Some(cardinality),
            ..Self::new(name, FieldType::Reference)
        }
    }

    pub fn is_reference(&self) -> bool {
        self.field_type == FieldType::Reference && self.ref_model.is_some()
    }

    /// Describe why `value` does not fit this field, if it does not
    fn type_error(&self, value: &Value) -> Option<String> {
        let ok = match self.field_type {
            FieldType::String | FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            FieldType::Boolean => value.is_boolean(),
            FieldType::Date => value.as_str().is_some_and(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                    || DateTime::parse_from_rfc3339(s).is_ok()
            }),
            FieldType::Datetime => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            FieldType::Enum => {
                return match &self.options {
                    Some(options) if !options.contains(value) => {
                        Some(format!("must be one of {}", Value::Array(options.clone())))
                    }
                    _ => None,
                };
            }
            FieldType::Json => true,
            FieldType::Reference => match self.ref_cardinality.unwrap_or_default() {
                RefCardinality::One => value.is_string(),
                RefCardinality::Many => value
                    .as_array()
                    .is_some_and(|ids| ids.iter().all(Value::is_string)),
            },
        };
        if ok {
            None
        } else {
            Some(format!("expected a value of type {:?}", self.field_type).to_lowercase())
        }
    }
}

/// A named schema describing entity objects of one kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl EntityModel {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        EntityModel {
            name: name.into(),
            title: None,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    /// Check required fields, value types, enum options and unknown keys
    pub fn validate(&self, values: &Values) -> ValidationReport {
        let mut errors = Vec::new();

        for field in &self.fields {
            match values.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(FieldError::new(&field.name, "is required"));
                    }
                }
                Some(value) => {
                    if let Some(message) = field.type_error(value) {
                        errors.push(FieldError::new(&field.name, message));
                    }
                }
            }
        }

        for key in values.keys() {
            if self.field(key).is_none() {
                errors.push(FieldError::new(key, "is not a field of this model"));
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldError {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

/// Model and view metadata used to bootstrap the UI layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct PlainConfig {
    #[serde(default)]
    pub models: Vec<EntityModel>,
    /// View layouts, carried opaquely
    #[serde(default)]
    pub views: Vec<Value>,
}

impl PlainConfig {
    pub fn model(&self, name: &str) -> Option<&EntityModel> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> EntityModel {
        EntityModel::new(
            "product",
            vec![
                FieldDefinition::new("name", FieldType::String).required(),
                FieldDefinition::new("stock", FieldType::Integer),
                FieldDefinition::new("status", FieldType::Enum)
                    .with_options(vec![json!("active"), json!("inactive")]),
                FieldDefinition::new("releasedOn", FieldType::Date),
                FieldDefinition::reference("tags", "tag", RefCardinality::Many),
            ],
        )
    }

    fn values(v: Value) -> Values {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_values() {
        let report = product().validate(&values(json!({
            "name": "Lamp",
            "stock": 3,
            "status": "active",
            "releasedOn": "2024-05-01",
            "tags": ["t1", "t2"]
        })));
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_each_problem_is_reported() {
        let report = product().validate(&values(json!({
            "stock": 2.5,
            "status": "archived",
            "colour": "red"
        })));
        assert!(!report.valid);
        let fields: Vec<_> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "stock", "status", "colour"]);
        assert_eq!(report.errors[0].message, "is required");
    }

    #[test]
    fn test_reference_fields() {
        let model = product();
        let refs: Vec<_> = model.reference_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(refs, vec!["tags"]);
    }

    #[test]
    fn test_field_type_wire_name() {
        let field: FieldDefinition = serde_json::from_value(json!({
            "name": "owner",
            "type": "reference",
            "refModel": "user",
            "refCardinality": "one"
        }))
        .unwrap();
        assert!(field.is_reference());
        assert!(!field.required);
    }
}
