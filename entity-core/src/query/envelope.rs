//! Query envelope: filter, multi-key sort, reference narrowing, pagination

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use super::evaluate::{lookup, sort_cmp};
use super::filter::QueryItem;
use crate::error::{EngineError, Result};
use crate::ids::ObjectId;
use crate::model::{EntityObject, ReferenceScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Ordered `field -> order` pairs; the first key has the highest priority
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SortBy(pub Vec<(String, SortOrder)>);

impl SortBy {
    pub fn new() -> Self {
        SortBy(Vec::new())
    }

    pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.0.push((field.into(), order));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare two objects key by key; later keys break ties of earlier ones
    pub fn compare(&self, a: &EntityObject, b: &EntityObject) -> Ordering {
        for (field, order) in &self.0 {
            let left = lookup(a, field);
            let right = lookup(b, field);
            let ordering = sort_cmp(left.as_deref(), right.as_deref());
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

    /// Stable sort in place
    pub fn sort(&self, objects: &mut [EntityObject]) {
        if !self.is_empty() {
            objects.sort_by(|a, b| self.compare(a, b));
        }
    }
}

impl Serialize for SortBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (field, order) in &self.0 {
            map.serialize_entry(field, order)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SortByVisitor;

        impl<'de> Visitor<'de> for SortByVisitor {
            type Value = SortBy;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field name to \"asc\" or \"desc\"")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<SortBy, A::Error> {
                let mut keys = Vec::new();
                while let Some((field, order)) = access.next_entry::<String, SortOrder>()? {
                    keys.push((field, order));
                }
                Ok(SortBy(keys))
            }
        }

        deserializer.deserialize_map(SortByVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    /// 1-based page size; no pagination when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i64>,
    /// 1-based page index, defaults to 1 when only `pageSize` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_index: Option<i64>,
    #[serde(default, skip_serializing_if = "SortBy::is_empty")]
    pub sort_by: SortBy,
    /// Narrow to objects reachable through one named edge of a fixed object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ReferenceScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryItem>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: QueryItem) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_page(mut self, page_index: i64, page_size: i64) -> Self {
        self.page_index = Some(page_index);
        self.page_size = Some(page_size);
        self
    }

    pub fn with_references(mut self, scope: ReferenceScope) -> Self {
        self.references = Some(scope);
        self
    }

    /// `(offset, limit)` of the requested page, `None` for everything
    pub fn window(&self) -> Result<Option<(usize, usize)>> {
        if self.page_size.is_none() && self.page_index.is_none() {
            return Ok(None);
        }
        let size = self.page_size.ok_or_else(|| {
            EngineError::InvalidArgument("pageIndex given without pageSize".to_string())
        })?;
        let index = self.page_index.unwrap_or(1);
        if size <= 0 {
            return Err(EngineError::InvalidArgument(format!(
                "pageSize must be positive, got {}",
                size
            )));
        }
        if index < 1 {
            return Err(EngineError::InvalidArgument(format!(
                "pageIndex must be at least 1, got {}",
                index
            )));
        }
        let size = usize::try_from(size)
            .map_err(|_| EngineError::InvalidArgument("pageSize too large".to_string()))?;
        let index = usize::try_from(index - 1)
            .map_err(|_| EngineError::InvalidArgument("pageIndex too large".to_string()))?;
        Ok(Some((index.saturating_mul(size), size)))
    }

    /// Filter and reference narrowing without sorting or paging
    pub fn select(
        &self,
        objects: Vec<EntityObject>,
        reachable: Option<&HashSet<ObjectId>>,
    ) -> Vec<EntityObject> {
        objects
            .into_iter()
            .filter(|o| !o.is_deleted)
            .filter(|o| reachable.is_none_or(|ids| ids.contains(&o.id)))
            .filter(|o| self.filter.as_ref().is_none_or(|f| f.matches(o)))
            .collect()
    }

    /// Filter, narrow, stable-sort and slice.
    ///
    /// `reachable` carries the target ids of `references` when set.
    pub fn execute(
        &self,
        objects: Vec<EntityObject>,
        reachable: Option<&HashSet<ObjectId>>,
    ) -> Result<Page<EntityObject>> {
        let window = self.window()?;
        let mut selected = self.select(objects, reachable);
        self.sort_by.sort(&mut selected);

        let count = selected.len();
        let data = match window {
            Some((offset, limit)) => selected.into_iter().skip(offset).take(limit).collect(),
            None => selected,
        };
        Ok(Page { data, count })
    }
}

/// One page of results plus the filtered total before pagination
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub count: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            count: self.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operator;
    use serde_json::json;

    fn product(name: &str, price: i64, category: &str) -> EntityObject {
        EntityObject::new(
            "product",
            json!({"name": name, "price": price, "category": category})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn catalog() -> Vec<EntityObject> {
        vec![
            product("d", 30, "b"),
            product("a", 10, "a"),
            product("c", 20, "a"),
            product("b", 10, "b"),
            product("e", 20, "b"),
        ]
    }

    fn names(page: &Page<EntityObject>) -> Vec<&str> {
        page.data
            .iter()
            .map(|o| o.values["name"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_sort_by_keeps_key_order() {
        let sort: SortBy = serde_json::from_str(r#"{"price": "desc", "name": "asc"}"#).unwrap();
        assert_eq!(sort.0[0], ("price".to_string(), SortOrder::Desc));
        assert_eq!(serde_json::to_string(&sort).unwrap(), r#"{"price":"desc","name":"asc"}"#);

        let page = EntityQuery::new().with_sort(sort).execute(catalog(), None).unwrap();
        assert_eq!(names(&page), vec!["d", "c", "e", "a", "b"]);
    }

    #[test]
    fn test_sort_is_stable() {
        let sort = SortBy::new().then("category", SortOrder::Asc);
        let page = EntityQuery::new().with_sort(sort).execute(catalog(), None).unwrap();
        assert_eq!(names(&page), vec!["a", "c", "d", "b", "e"]);
    }

    #[test]
    fn test_pages_partition_the_sorted_set() {
        let sort = SortBy::new().then("name", SortOrder::Asc);
        let all = EntityQuery::new().with_sort(sort.clone()).execute(catalog(), None).unwrap();

        let mut collected = Vec::new();
        for index in 1..=3 {
            let page = EntityQuery::new()
                .with_sort(sort.clone())
                .with_page(index, 2)
                .execute(catalog(), None)
                .unwrap();
            assert_eq!(page.count, 5);
            collected.extend(page.data);
        }
        assert_eq!(collected.len(), 5);
        let collected_ids: Vec<_> = collected.iter().map(|o| o.values["name"].clone()).collect();
        let all_ids: Vec<_> = all.data.iter().map(|o| o.values["name"].clone()).collect();
        assert_eq!(collected_ids, all_ids);
    }

    #[test]
    fn test_invalid_pagination() {
        for (index, size) in [(0, 10), (1, 0), (-1, 5), (1, -3)] {
            let err = EntityQuery::new()
                .with_page(index, size)
                .execute(catalog(), None)
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "{} {}", index, size);
        }
    }

    #[test]
    fn test_filter_applies_before_pagination() {
        let query = EntityQuery::new()
            .with_filter(QueryItem::condition("category", Operator::Eq, json!("b")).unwrap())
            .with_sort(SortBy::new().then("price", SortOrder::Asc))
            .with_page(1, 2);
        let page = query.execute(catalog(), None).unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(names(&page), vec!["b", "e"]);
    }

    #[test]
    fn test_reference_narrowing() {
        let objects = catalog();
        let reachable: HashSet<ObjectId> = [objects[1].id.clone(), objects[4].id.clone()].into();
        let page = EntityQuery::new().execute(objects, Some(&reachable)).unwrap();
        assert_eq!(names(&page), vec!["a", "e"]);
    }

    #[test]
    fn test_query_wire_shape() {
        let query: EntityQuery = serde_json::from_value(json!({
            "pageSize": 10,
            "pageIndex": 2,
            "sortBy": {"updatedAt": "desc"},
            "references": {
                "fromModelName": "order",
                "fromFieldName": "items",
                "fromObjectId": "o1",
                "toModelName": "product"
            },
            "filter": {"field": "price", "operator": "gt", "value": 0}
        }))
        .unwrap();
        assert_eq!(query.window().unwrap(), Some((10, 10)));
        assert_eq!(query.references.unwrap().from_field_name, "items");
    }
}
