//! Boolean filter trees over entity objects

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::IsNull => "isNull",
            Operator::IsNotNull => "isNotNull",
            Operator::Between => "between",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "contains" => Operator::Contains,
            "startsWith" => Operator::StartsWith,
            "endsWith" => Operator::EndsWith,
            "in" => Operator::In,
            "notIn" => Operator::NotIn,
            "isNull" => Operator::IsNull,
            "isNotNull" => Operator::IsNotNull,
            "between" => Operator::Between,
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown operator '{}'",
                    other
                )));
            }
        })
    }
}

/// Leaf node: `field operator value [value2]`
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value2: Option<Value>,
}

impl Condition {
    fn check(self) -> Result<Self> {
        if self.field.is_empty() {
            return Err(EngineError::Validation(
                "condition field must not be empty".to_string(),
            ));
        }
        match self.operator {
            Operator::In | Operator::NotIn if !self.value.is_array() => {
                Err(EngineError::Validation(format!(
                    "operator '{}' on '{}' needs an array value",
                    self.operator, self.field
                )))
            }
            Operator::Between if self.value2.is_none() => Err(EngineError::Validation(format!(
                "operator 'between' on '{}' needs value2",
                self.field
            ))),
            _ => Ok(self),
        }
    }
}

/// Composite node; every clause that is present must hold.
///
/// `and` holds when all children match (empty: true), `or` when any child
/// matches (empty: false) and `not` when no child matches, i.e. NOR over
/// its array.
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct Composite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<QueryItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<QueryItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not: Option<Vec<QueryItem>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryItem {
    Condition(Condition),
    Composite(Composite),
}

const LEAF_KEYS: [&str; 4] = ["field", "operator", "value", "value2"];
const COMPOSITE_KEYS: [&str; 3] = ["and", "or", "not"];

impl QueryItem {
    /// Validated leaf condition
    pub fn condition(field: impl Into<String>, operator: Operator, value: Value) -> Result<Self> {
        Condition {
            field: field.into(),
            operator,
            value,
            value2: None,
        }
        .check()
        .map(QueryItem::Condition)
    }

    pub fn between(field: impl Into<String>, low: Value, high: Value) -> Self {
        QueryItem::Condition(Condition {
            field: field.into(),
            operator: Operator::Between,
            value: low,
            value2: Some(high),
        })
    }

    pub fn and(items: Vec<QueryItem>) -> Self {
        QueryItem::Composite(Composite {
            and: Some(items),
            ..Default::default()
        })
    }

    pub fn or(items: Vec<QueryItem>) -> Self {
        QueryItem::Composite(Composite {
            or: Some(items),
            ..Default::default()
        })
    }

    pub fn not(items: Vec<QueryItem>) -> Self {
        QueryItem::Composite(Composite {
            not: Some(items),
            ..Default::default()
        })
    }

    /// Parse and validate a JSON filter tree.
    ///
    /// Nodes mixing leaf and composite keys, or carrying neither, fail with
    /// `Validation`; unknown operators fail with `InvalidArgument`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let node = value.as_object().ok_or_else(|| {
            EngineError::Validation(format!("filter node must be an object, got {}", value))
        })?;

        let is_leaf = LEAF_KEYS.iter().any(|k| node.contains_key(*k));
        let is_composite = COMPOSITE_KEYS.iter().any(|k| node.contains_key(*k));
        match (is_leaf, is_composite) {
            (true, true) => Err(EngineError::Validation(
                "filter node mixes condition and composite properties".to_string(),
            )),
            (false, false) => Err(EngineError::Validation(
                "filter node has neither condition nor composite properties".to_string(),
            )),
            (true, false) => Self::leaf_from(node),
            (false, true) => Ok(QueryItem::Composite(Composite {
                and: Self::children_from(node, "and")?,
                or: Self::children_from(node, "or")?,
                not: Self::children_from(node, "not")?,
            })),
        }
    }

    fn leaf_from(node: &Map<String, Value>) -> Result<Self> {
        let field = node
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("condition needs a string 'field'".to_string()))?;
        let operator = node
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Validation(format!("condition on '{}' needs an 'operator'", field))
            })?
            .parse::<Operator>()?;

        Condition {
            field: field.to_string(),
            operator,
            value: node.get("value").cloned().unwrap_or(Value::Null),
            value2: node.get("value2").cloned(),
        }
        .check()
        .map(QueryItem::Condition)
    }

    fn children_from(node: &Map<String, Value>, key: &str) -> Result<Option<Vec<QueryItem>>> {
        match node.get(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(QueryItem::from_value)
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(other) => Err(EngineError::Validation(format!(
                "'{}' must be an array of filter nodes, got {}",
                key, other
            ))),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            QueryItem::Condition(_) => 1,
            QueryItem::Composite(c) => {
                1 + [&c.and, &c.or, &c.not]
                    .into_iter()
                    .flatten()
                    .flatten()
                    .map(QueryItem::depth)
                    .max()
                    .unwrap_or(0)
            }
        }
    }
}

impl Serialize for QueryItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            QueryItem::Condition(c) => c.serialize(serializer),
            QueryItem::Composite(c) => c.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for QueryItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        QueryItem::from_value(&value).map_err(D::Error::custom)
    }
}
