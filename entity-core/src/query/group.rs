//! Grouped queries with per-group aggregation

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use super::envelope::{SortBy, SortOrder};
use super::evaluate::{as_number, lookup, sort_cmp};
use super::filter::QueryItem;
use crate::error::{EngineError, Result};
use crate::ids::ObjectId;
use crate::model::{EntityObject, ReferenceScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupFormatType {
    Time,
    Range,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFormat {
    #[serde(rename = "type")]
    pub format_type: GroupFormatType,
    pub pattern: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<GroupFormat>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub without_details: bool,
}

impl GroupSpec {
    pub fn field(field: impl Into<String>) -> Self {
        GroupSpec {
            field: field.into(),
            format: None,
            without_details: false,
        }
    }

    pub fn time(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        GroupSpec {
            format: Some(GroupFormat {
                format_type: GroupFormatType::Time,
                pattern: pattern.into(),
            }),
            ..Self::field(field)
        }
    }

    pub fn range(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        GroupSpec {
            format: Some(GroupFormat {
                format_type: GroupFormatType::Range,
                pattern: pattern.into(),
            }),
            ..Self::field(field)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupKeyInput {
    Field(String),
    Spec(GroupSpec),
}

impl From<GroupKeyInput> for GroupSpec {
    fn from(input: GroupKeyInput) -> Self {
        match input {
            GroupKeyInput::Field(field) => GroupSpec::field(field),
            GroupKeyInput::Spec(spec) => spec,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupByInput {
    One(GroupKeyInput),
    Many(Vec<GroupKeyInput>),
}

/// One key spec, a bare field name, or a list of either
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GroupByInput", into = "Vec<GroupSpec>")]
pub struct GroupBy(pub Vec<GroupSpec>);

impl From<GroupByInput> for GroupBy {
    fn from(input: GroupByInput) -> Self {
        match input {
            GroupByInput::One(key) => GroupBy(vec![key.into()]),
            GroupByInput::Many(keys) => GroupBy(keys.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<GroupBy> for Vec<GroupSpec> {
    fn from(group_by: GroupBy) -> Self {
        group_by.0
    }
}

impl From<GroupSpec> for GroupBy {
    fn from(spec: GroupSpec) -> Self {
        GroupBy(vec![spec])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub field: String,
    pub function: AggregateFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregationSpec {
    pub fn new(field: impl Into<String>, function: AggregateFunction) -> Self {
        AggregationSpec {
            field: field.into(),
            function,
            alias: None,
        }
    }

    /// Result key: the alias, or `{field}_{function}`
    pub fn key(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.field, self.function.as_str()))
    }

    /// Aggregate over the group; nulls and missing values are skipped
    fn apply(&self, objects: &[EntityObject]) -> Result<Value> {
        let present = objects
            .iter()
            .filter_map(|o| lookup(o, &self.field))
            .filter(|v| !v.is_null());

        if self.function == AggregateFunction::Count {
            return Ok(Value::from(present.count()));
        }

        let numbers = present
            .map(|v| {
                as_number(&v).ok_or_else(|| {
                    EngineError::Type(format!(
                        "cannot {} non-numeric value {} of field '{}'",
                        self.function.as_str(),
                        v,
                        self.field
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok(match self.function {
            AggregateFunction::Sum => number_value(numbers.iter().sum()),
            AggregateFunction::Avg if numbers.is_empty() => Value::Null,
            AggregateFunction::Avg => number_value(numbers.iter().sum::<f64>() / numbers.len() as f64),
            AggregateFunction::Min => numbers.into_iter().reduce(f64::min).map_or(Value::Null, number_value),
            AggregateFunction::Max => numbers.into_iter().reduce(f64::max).map_or(Value::Null, number_value),
            AggregateFunction::Count => Value::Null,
        })
    }
}

/// Integral results are emitted as JSON integers
fn number_value(n: f64) -> Value {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() < EXACT {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedQuery {
    pub group_by: GroupBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ReferenceScope>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationSpec>,
    /// Sort of groups by key fields, aggregation keys or `count`; key ascending by default
    #[serde(default, skip_serializing_if = "SortBy::is_empty")]
    pub group_sort_by: SortBy,
    /// Sort of objects inside each group; `updatedAt desc` by default
    #[serde(default, skip_serializing_if = "SortBy::is_empty")]
    pub object_sort_by: SortBy,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub without_details: bool,
}

impl GroupedQuery {
    pub fn new(group_by: impl Into<GroupBy>) -> Self {
        GroupedQuery {
            group_by: group_by.into(),
            filter: None,
            references: None,
            aggregations: Vec::new(),
            group_sort_by: SortBy::default(),
            object_sort_by: SortBy::default(),
            without_details: false,
        }
    }

    pub fn with_filter(mut self, filter: QueryItem) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationSpec) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn with_group_sort(mut self, sort_by: SortBy) -> Self {
        self.group_sort_by = sort_by;
        self
    }

    pub fn without_details(mut self) -> Self {
        self.without_details = true;
        self
    }

    fn omit_objects(&self) -> bool {
        self.without_details || self.group_by.0.iter().any(|spec| spec.without_details)
    }

    /// Partition, aggregate and sort.
    ///
    /// `reachable` carries the target ids of `references` when set.
    pub fn execute(
        &self,
        objects: Vec<EntityObject>,
        reachable: Option<&HashSet<ObjectId>>,
    ) -> Result<GroupedResult> {
        if self.group_by.0.is_empty() {
            return Err(EngineError::InvalidArgument(
                "groupBy needs at least one field".to_string(),
            ));
        }
        let keyers = self
            .group_by
            .0
            .iter()
            .map(GroupKeyer::new)
            .collect::<Result<Vec<_>>>()?;

        let selected: Vec<EntityObject> = objects
            .into_iter()
            .filter(|o| !o.is_deleted)
            .filter(|o| reachable.is_none_or(|ids| ids.contains(&o.id)))
            .filter(|o| self.filter.as_ref().is_none_or(|f| f.matches(o)))
            .collect();
        let total_count = selected.len();

        // Partition in first-seen order
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut partitions: Vec<(Map<String, Value>, Vec<EntityObject>)> = Vec::new();
        for object in selected {
            let mut key = Map::new();
            for keyer in &keyers {
                key.insert(keyer.spec.field.clone(), keyer.key_of(&object));
            }
            let identity = Value::Object(key.clone()).to_string();
            match index.get(&identity) {
                Some(&i) => partitions[i].1.push(object),
                None => {
                    index.insert(identity, partitions.len());
                    partitions.push((key, vec![object]));
                }
            }
        }

        let object_sort = if self.object_sort_by.is_empty() {
            SortBy::new().then("updatedAt", SortOrder::Desc)
        } else {
            self.object_sort_by.clone()
        };
        let omit = self.omit_objects();

        let mut groups = Vec::with_capacity(partitions.len());
        for (key, mut members) in partitions {
            let aggregations = if self.aggregations.is_empty() {
                None
            } else {
                let mut results = Map::new();
                for aggregation in &self.aggregations {
                    results.insert(aggregation.key(), aggregation.apply(&members)?);
                }
                Some(results)
            };
            let count = members.len();
            let objects = if omit {
                Vec::new()
            } else {
                object_sort.sort(&mut members);
                members
            };
            groups.push(Group {
                key,
                count,
                objects,
                aggregations,
            });
        }

        let group_sort = if self.group_sort_by.is_empty() {
            self.group_by
                .0
                .iter()
                .fold(SortBy::new(), |sort, spec| sort.then(spec.field.clone(), SortOrder::Asc))
        } else {
            self.group_sort_by.clone()
        };
        groups.sort_by(|a, b| compare_groups(&group_sort, a, b));

        Ok(GroupedResult {
            groups,
            total_count,
        })
    }
}

fn group_field<'a>(group: &'a Group, field: &str) -> Option<&'a Value> {
    group
        .key
        .get(field)
        .or_else(|| group.aggregations.as_ref().and_then(|a| a.get(field)))
}

fn compare_groups(sort: &SortBy, a: &Group, b: &Group) -> Ordering {
    for (field, order) in &sort.0 {
        let ordering = if field == "count" && !a.key.contains_key("count") {
            a.count.cmp(&b.count)
        } else {
            sort_cmp(group_field(a, field), group_field(b, field))
        };
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub key: Map<String, Value>,
    pub count: usize,
    pub objects: Vec<EntityObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedResult {
    pub groups: Vec<Group>,
    pub total_count: usize,
}

/// Bucket of a range-formatted key
struct RangeBuckets {
    bounds: Vec<(f64, String)>,
}

impl RangeBuckets {
    fn parse(pattern: &str) -> Result<Self> {
        let mut bounds = pattern
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>()
                    .map(|n| (n, s.to_string()))
                    .map_err(|_| EngineError::InvalidArgument(format!("range bound '{}' is not a number", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        if bounds.is_empty() {
            return Err(EngineError::InvalidArgument(
                "range pattern needs at least one bound".to_string(),
            ));
        }
        bounds.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(RangeBuckets { bounds })
    }

    fn label(&self, n: f64) -> String {
        let (first, first_label) = &self.bounds[0];
        if n < *first {
            return format!("<{}", first_label);
        }
        for pair in self.bounds.windows(2) {
            let (low, low_label) = &pair[0];
            let (high, high_label) = &pair[1];
            if n >= *low && n < *high {
                return format!("{}-{}", low_label, high_label);
            }
        }
        let (_, last_label) = &self.bounds[self.bounds.len() - 1];
        format!(">={}", last_label)
    }
}

/// Translate `YYYY MM DD HH mm ss` tokens into chrono specifiers
fn chrono_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    pattern
        .replace("YYYY", "%Y")
        .replace("MM", "%m")
        .replace("DD", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S")
}

/// Chrono pattern for a time group key; unknown specifiers are rejected
fn time_pattern(pattern: &str) -> Result<String> {
    let pattern = chrono_pattern(pattern);
    if StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error)) {
        return Err(EngineError::InvalidArgument(format!(
            "invalid time group pattern '{}'",
            pattern
        )));
    }
    Ok(pattern)
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|t| t.and_utc())
            })
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|t| t.and_utc())
            }),
        // Epoch milliseconds
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

enum KeyFormat {
    Raw,
    Time(String),
    Range(RangeBuckets),
}

struct GroupKeyer<'a> {
    spec: &'a GroupSpec,
    format: KeyFormat,
}

impl<'a> GroupKeyer<'a> {
    fn new(spec: &'a GroupSpec) -> Result<Self> {
        let format = match &spec.format {
            None => KeyFormat::Raw,
            Some(GroupFormat {
                format_type: GroupFormatType::Time,
                pattern,
            }) => KeyFormat::Time(time_pattern(pattern)?),
            Some(GroupFormat {
                format_type: GroupFormatType::Range,
                pattern,
            }) => KeyFormat::Range(RangeBuckets::parse(pattern)?),
        };
        Ok(GroupKeyer { spec, format })
    }

    /// Unformattable values land in the `null` group
    fn key_of(&self, object: &EntityObject) -> Value {
        let Some(value) = lookup(object, &self.spec.field) else {
            return Value::Null;
        };
        match &self.format {
            KeyFormat::Raw => value.into_owned(),
            KeyFormat::Time(pattern) => {
                let Some(t) = parse_datetime(&value) else {
                    return Value::Null;
                };
                let mut key = String::new();
                match write!(key, "{}", t.format(pattern)) {
                    Ok(()) => Value::String(key),
                    Err(_) => Value::Null,
                }
            }
            KeyFormat::Range(buckets) => as_number(&value)
                .map(|n| Value::String(buckets.label(n)))
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operator;
    use serde_json::json;

    fn object(values: Value) -> EntityObject {
        EntityObject::new("order", values.as_object().cloned().unwrap())
    }

    fn orders() -> Vec<EntityObject> {
        vec![
            object(json!({"category": "tools", "amount": 5, "placedAt": "2024-03-01T10:00:00Z"})),
            object(json!({"category": "books", "amount": 12, "placedAt": "2024-03-01T18:30:00Z"})),
            object(json!({"category": "tools", "amount": 40, "placedAt": "2024-03-02T09:00:00Z"})),
            object(json!({"category": "books", "amount": 7, "placedAt": "2024-03-03T12:00:00Z"})),
            object(json!({"category": "tools", "amount": 150, "placedAt": "2024-03-03T23:59:59Z"})),
        ]
    }

    #[test]
    fn test_group_by_category() {
        let query: GroupedQuery = serde_json::from_value(json!({"groupBy": "category"})).unwrap();
        let result = query.execute(orders(), None).unwrap();

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups.iter().map(|g| g.count).sum::<usize>(), 5);
        assert_eq!(result.total_count, 5);
        // Key ascending by default
        assert_eq!(result.groups[0].key["category"], "books");
        let members: usize = result.groups.iter().map(|g| g.objects.len()).sum();
        assert_eq!(members, 5);
    }

    #[test]
    fn test_time_buckets() {
        let query = GroupedQuery::new(GroupSpec::time("placedAt", "YYYY-MM-DD"));
        let result = query.execute(orders(), None).unwrap();
        let keys: Vec<_> = result.groups.iter().map(|g| g.key["placedAt"].clone()).collect();
        assert_eq!(keys, vec![json!("2024-03-01"), json!("2024-03-02"), json!("2024-03-03")]);

        let query = GroupedQuery::new(GroupSpec::time("placedAt", "%Y-%m"));
        assert_eq!(query.execute(orders(), None).unwrap().groups.len(), 1);
    }

    #[test]
    fn test_range_buckets() {
        let query = GroupedQuery::new(GroupSpec::range("amount", "10,100"));
        let result = query.execute(orders(), None).unwrap();
        let counts: HashMap<String, usize> = result
            .groups
            .iter()
            .map(|g| (g.key["amount"].as_str().unwrap().to_string(), g.count))
            .collect();
        assert_eq!(counts["<10"], 2);
        assert_eq!(counts["10-100"], 2);
        assert_eq!(counts[">=100"], 1);
    }

    #[test]
    fn test_aggregations() {
        let query = GroupedQuery::new(GroupSpec::field("category"))
            .with_aggregation(AggregationSpec::new("amount", AggregateFunction::Sum))
            .with_aggregation(AggregationSpec::new("amount", AggregateFunction::Avg))
            .with_aggregation(AggregationSpec {
                alias: Some("largest".to_string()),
                ..AggregationSpec::new("amount", AggregateFunction::Max)
            })
            .with_aggregation(AggregationSpec::new("note", AggregateFunction::Count));
        let result = query.execute(orders(), None).unwrap();

        let tools = result.groups.iter().find(|g| g.key["category"] == "tools").unwrap();
        let aggregations = tools.aggregations.as_ref().unwrap();
        assert_eq!(aggregations["amount_sum"], json!(195));
        assert_eq!(aggregations["amount_avg"], json!(65));
        assert_eq!(aggregations["largest"], json!(150));
        assert_eq!(aggregations["note_count"], json!(0));
    }

    #[test]
    fn test_unknown_time_specifier_is_rejected() {
        for pattern in ["%Q", "%Y-%"] {
            let err = GroupedQuery::new(GroupSpec::time("placedAt", pattern))
                .execute(orders(), None)
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "{}", pattern);
        }
    }

    #[test]
    fn test_non_numeric_aggregation_is_type_error() {
        let query = GroupedQuery::new(GroupSpec::field("category"))
            .with_aggregation(AggregationSpec::new("category", AggregateFunction::Sum));
        let err = query.execute(orders(), None).unwrap_err();
        assert!(matches!(err, EngineError::Type(_)));
    }

    #[test]
    fn test_without_details_keeps_counts() {
        let query = GroupedQuery::new(GroupSpec::field("category"))
            .with_aggregation(AggregationSpec::new("amount", AggregateFunction::Min))
            .without_details();
        let result = query.execute(orders(), None).unwrap();
        assert!(result.groups.iter().all(|g| g.objects.is_empty()));
        assert_eq!(result.groups.iter().map(|g| g.count).sum::<usize>(), 5);
        assert!(result.groups.iter().all(|g| g.aggregations.is_some()));
    }

    #[test]
    fn test_group_sort_by_count_and_filter() {
        let query = GroupedQuery::new(GroupSpec::field("category"))
            .with_filter(QueryItem::condition("amount", Operator::Gte, json!(8)).unwrap())
            .with_group_sort(SortBy::new().then("count", SortOrder::Desc));
        let result = query.execute(orders(), None).unwrap();
        assert_eq!(result.total_count, 3);
        assert_eq!(result.groups[0].key["category"], "tools");
        assert_eq!(result.groups[0].count, 2);
        assert_eq!(result.groups[1].count, 1);
    }

    #[test]
    fn test_objects_sorted_by_updated_at_desc() {
        let mut objects = orders();
        for (i, object) in objects.iter_mut().enumerate() {
            object.updated_at = DateTime::from_timestamp(1_700_000_000 + i as i64, 0);
        }
        let result = GroupedQuery::new(GroupSpec::field("category"))
            .execute(objects, None)
            .unwrap();
        let tools = result.groups.iter().find(|g| g.key["category"] == "tools").unwrap();
        let amounts: Vec<_> = tools.objects.iter().map(|o| o.values["amount"].clone()).collect();
        assert_eq!(amounts, vec![json!(150), json!(40), json!(5)]);
    }

    #[test]
    fn test_multi_key_group_by_parses_array() {
        let query: GroupedQuery = serde_json::from_value(json!({
            "groupBy": ["category", {"field": "amount", "format": {"type": "range", "pattern": "10"}}]
        }))
        .unwrap();
        let result = query.execute(orders(), None).unwrap();
        assert_eq!(result.groups.len(), 4);
        assert!(result.groups.iter().all(|g| g.key.len() == 2));
    }
}
