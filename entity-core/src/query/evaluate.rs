//! Matching filter trees against objects and ordering JSON values

use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;

use super::filter::{Composite, Condition, Operator, QueryItem};
use crate::model::EntityObject;

/// Resolve a field on an object.
///
/// Looks in `values` first, then descends dotted paths into nested objects,
/// then falls back to object-level metadata (`id`, `modelName`, ...).
pub fn lookup<'a>(object: &'a EntityObject, field: &str) -> Option<Cow<'a, Value>> {
    if let Some(value) = object.values.get(field) {
        return Some(Cow::Borrowed(value));
    }
    if field.contains('.') {
        let mut parts = field.split('.');
        let mut current = parts.next().and_then(|head| object.values.get(head));
        for part in parts {
            current = match current {
                Some(Value::Object(map)) => map.get(part),
                Some(Value::Array(items)) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
        }
        if let Some(value) = current {
            return Some(Cow::Borrowed(value));
        }
    }
    object.metadata(field).map(Cow::Owned)
}

/// Numeric view of a value; numeric strings count
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Equality with numeric normalization when either side is a JSON number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    a == b
}

/// Ordering for range operators; `None` when the values are not comparable
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_number() || b.is_number() {
        return as_number(a)?.partial_cmp(&as_number(b)?);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn kind_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(_) => 4,
    }
}

/// Total order used for sorting: missing/null < bool < number < string < other
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (kind_rank(a), kind_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if ra == 4 => x.to_string().cmp(&y.to_string()),
        _ => Ordering::Equal,
    }
}

impl QueryItem {
    pub fn matches(&self, object: &EntityObject) -> bool {
        match self {
            QueryItem::Condition(condition) => condition.matches(object),
            QueryItem::Composite(composite) => composite.matches(object),
        }
    }
}

impl Composite {
    pub fn matches(&self, object: &EntityObject) -> bool {
        self.and
            .as_ref()
            .is_none_or(|items| items.iter().all(|i| i.matches(object)))
            && self
                .or
                .as_ref()
                .is_none_or(|items| items.iter().any(|i| i.matches(object)))
            && self
                .not
                .as_ref()
                .is_none_or(|items| !items.iter().any(|i| i.matches(object)))
    }
}

impl Condition {
    pub fn matches(&self, object: &EntityObject) -> bool {
        let actual = lookup(object, &self.field);
        let actual = actual.as_deref().filter(|v| !v.is_null());

        match self.operator {
            Operator::IsNull => actual.is_none(),
            Operator::IsNotNull => actual.is_some(),
            Operator::Eq => match actual {
                Some(v) => values_equal(v, &self.value),
                None => self.value.is_null(),
            },
            Operator::Ne => match actual {
                Some(v) => !values_equal(v, &self.value),
                None => !self.value.is_null(),
            },
            Operator::Gt => self.compare(actual, |o| o == Ordering::Greater),
            Operator::Gte => self.compare(actual, |o| o != Ordering::Less),
            Operator::Lt => self.compare(actual, |o| o == Ordering::Less),
            Operator::Lte => self.compare(actual, |o| o != Ordering::Greater),
            Operator::Between => {
                let (Some(v), Some(high)) = (actual, self.value2.as_ref()) else {
                    return false;
                };
                compare_values(v, &self.value).is_some_and(|o| o != Ordering::Less)
                    && compare_values(v, high).is_some_and(|o| o != Ordering::Greater)
            }
            Operator::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            Operator::StartsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            Operator::In => actual.is_some_and(|v| self.in_set(v)),
            Operator::NotIn => !actual.is_some_and(|v| self.in_set(v)),
        }
    }

    fn compare(&self, actual: Option<&Value>, accept: impl Fn(Ordering) -> bool) -> bool {
        actual
            .and_then(|v| compare_values(v, &self.value))
            .is_some_and(accept)
    }

    fn in_set(&self, actual: &Value) -> bool {
        self.value
            .as_array()
            .is_some_and(|set| set.iter().any(|candidate| values_equal(actual, candidate)))
    }
}
