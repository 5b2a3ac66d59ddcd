use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ObjectId, ReferenceId};

/// Field name -> value bag of one object
pub type Values = serde_json::Map<String, Value>;

/// Timestamps as they appear on the wire and in filter lookups
pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One record of a dynamically-typed model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityObject {
    pub id: ObjectId,
    pub model_name: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub values: Values,
}

impl EntityObject {
    /// Fresh object with a new id and both timestamps set to now
    pub fn new(model_name: impl Into<String>, values: Values) -> Self {
        let now = Utc::now();
        EntityObject {
            id: ObjectId::new(),
            model_name: model_name.into(),
            is_deleted: false,
            created_at: Some(now),
            updated_at: Some(now),
            values,
        }
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Object-level property exposed to filters and sorting
    pub fn metadata(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.to_string())),
            "modelName" => Some(Value::String(self.model_name.clone())),
            "isDeleted" => Some(Value::Bool(self.is_deleted)),
            "createdAt" => self.created_at.as_ref().map(|t| Value::String(timestamp(t))),
            "updatedAt" => self.updated_at.as_ref().map(|t| Value::String(timestamp(t))),
            _ => None,
        }
    }
}

/// Source side of a set of edges: everything but the target id
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceScope {
    pub from_model_name: String,
    pub from_field_name: String,
    pub from_object_id: ObjectId,
    pub to_model_name: String,
}

impl ReferenceScope {
    pub fn new(
        from_model_name: impl Into<String>,
        from_field_name: impl Into<String>,
        from_object_id: ObjectId,
        to_model_name: impl Into<String>,
    ) -> Self {
        ReferenceScope {
            from_model_name: from_model_name.into(),
            from_field_name: from_field_name.into(),
            from_object_id,
            to_model_name: to_model_name.into(),
        }
    }
}

/// A directed, named edge between two entity objects
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityObjectReference {
    pub id: ReferenceId,
    pub from_model_name: String,
    pub from_field_name: String,
    pub from_object_id: ObjectId,
    pub to_model_name: String,
    pub to_object_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityObjectReference {
    pub fn new(scope: &ReferenceScope, to_object_id: ObjectId) -> Self {
        let now = Utc::now();
        EntityObjectReference {
            id: ReferenceId::new(),
            from_model_name: scope.from_model_name.clone(),
            from_field_name: scope.from_field_name.clone(),
            from_object_id: scope.from_object_id.clone(),
            to_model_name: scope.to_model_name.clone(),
            to_object_id,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn in_scope(&self, scope: &ReferenceScope) -> bool {
        self.from_model_name == scope.from_model_name
            && self.from_field_name == scope.from_field_name
            && self.from_object_id == scope.from_object_id
            && self.to_model_name == scope.to_model_name
    }

    /// True when either end of the edge is the given object
    pub fn touches(&self, model_name: &str, id: &ObjectId) -> bool {
        (self.from_model_name == model_name && &self.from_object_id == id)
            || (self.to_model_name == model_name && &self.to_object_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_are_camel_case() {
        let object = EntityObject::new("product", json!({"name": "Lamp"}).as_object().unwrap().clone());
        let json = serde_json::to_value(&object).unwrap();
        assert_eq!(json["modelName"], "product");
        assert_eq!(json["isDeleted"], false);
        assert!(json["createdAt"].is_string());
        assert_eq!(json["values"]["name"], "Lamp");
    }

    #[test]
    fn test_metadata_lookup() {
        let object = EntityObject::new("product", Values::new());
        assert_eq!(object.metadata("modelName"), Some(json!("product")));
        assert_eq!(object.metadata("id"), Some(json!(object.id.as_str())));
        let updated = object.metadata("updatedAt").unwrap();
        assert!(updated.as_str().unwrap().ends_with('Z'));
        assert!(object.metadata("price").is_none());
    }

    #[test]
    fn test_reference_scope_matching() {
        let from = ObjectId::from_string("o1");
        let scope = ReferenceScope::new("order", "items", from.clone(), "product");
        let edge = EntityObjectReference::new(&scope, ObjectId::from_string("p1"));
        assert!(edge.in_scope(&scope));
        assert!(edge.touches("product", &ObjectId::from_string("p1")));
        assert!(edge.touches("order", &from));
        assert!(!edge.touches("product", &from));
    }
}
