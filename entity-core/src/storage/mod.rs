//! Data-source contract over entity objects, reference edges and model metadata
//!
//! Backends implement three small stores:
//!
//! - `ObjectStore` - object CRUD scoped by model name
//! - `ReferenceStore` - directed named edges between objects
//! - `ConfigStore` - model/view metadata
//!
//! Everything composed on top of them (filtered reads, trees, grouped reads,
//! reference expansion, validation) lives in `EntityDataSource`, which every
//! type implementing the three stores gets for free.
//!
//! Two implementations are available:
//!
//! - `MemoryDataSource` - In-memory storage (default, no persistence)
//! - `SqliteDataSource` - SQLite-backed storage (requires `sqlite` feature)

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryDataSource;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDataSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{EngineError, Result};
use crate::ids::ObjectId;
use crate::model::{
    EntityObject, EntityObjectReference, FieldDefinition, PlainConfig, ReferenceScope,
    ValidationReport, Values,
};
use crate::query::{EntityQuery, GroupedQuery, GroupedResult, Page, lookup};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Flag the object as deleted; edges are kept
    #[default]
    Soft,
    /// Remove the object and every edge touching it
    Hard,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Soft-deleted objects are reported as missing
    async fn find_one(&self, model_name: &str, id: &ObjectId) -> Result<Option<EntityObject>>;

    /// Every live object of a model, oldest first
    async fn scan(&self, model_name: &str) -> Result<Vec<EntityObject>>;

    async fn create(&self, model_name: &str, values: Values) -> Result<EntityObject>;

    /// Replace the values of an existing object
    async fn update(&self, object: &EntityObject) -> Result<bool>;

    /// Merge `values` into an existing object
    async fn update_values(&self, model_name: &str, id: &ObjectId, values: Values) -> Result<bool>;

    async fn delete(&self, model_name: &str, id: &ObjectId, mode: DeleteMode) -> Result<bool>;

    async fn delete_many(
        &self,
        model_name: &str,
        ids: &[ObjectId],
        mode: DeleteMode,
    ) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.delete(model_name, id, mode).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Create one edge; an existing identical edge is returned unchanged
    async fn create_reference(
        &self,
        scope: &ReferenceScope,
        to_object_id: &ObjectId,
    ) -> Result<EntityObjectReference>;

    /// Best-effort batch create, returning the number of new edges
    async fn create_references(&self, scope: &ReferenceScope, to_ids: &[ObjectId]) -> Result<usize> {
        let mut seen: HashSet<ObjectId> = self
            .find_references(scope)
            .await?
            .into_iter()
            .map(|r| r.to_object_id)
            .collect();

        let mut created = 0;
        for to_id in to_ids {
            if !seen.insert(to_id.clone()) {
                continue;
            }
            match self.create_reference(scope, to_id).await {
                Ok(_) => created += 1,
                Err(e) => tracing::warn!(
                    from = %scope.from_object_id,
                    to = %to_id,
                    "Failed to create reference: {}",
                    e
                ),
            }
        }
        Ok(created)
    }

    /// Deleting a missing edge is not an error and returns false
    async fn delete_reference(&self, scope: &ReferenceScope, to_object_id: &ObjectId) -> Result<bool>;

    async fn delete_references(&self, scope: &ReferenceScope, to_ids: &[ObjectId]) -> Result<usize> {
        let mut deleted = 0;
        for to_id in to_ids {
            if self.delete_reference(scope, to_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Edges of one scope, oldest first
    async fn find_references(&self, scope: &ReferenceScope) -> Result<Vec<EntityObjectReference>>;

    async fn find_references_count(&self, scope: &ReferenceScope) -> Result<usize> {
        Ok(self.find_references(scope).await?.len())
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn find_plain_config(&self) -> Result<PlainConfig>;

    async fn save_plain_config(&self, config: &PlainConfig) -> Result<()>;
}

/// One node of a parent-linked hierarchy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub object: EntityObject,
    pub children: Vec<TreeNode>,
}

/// An object with the targets of its reference fields attached
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectWithReferences {
    #[serde(flatten)]
    pub object: EntityObject,
    /// Reference field name -> target objects
    pub references: BTreeMap<String, Vec<EntityObject>>,
}

/// Reads and checks composed from the three stores
#[async_trait]
pub trait EntityDataSource: ObjectStore + ReferenceStore + ConfigStore {
    /// Target ids of a reference selector
    async fn reachable_ids(&self, scope: Option<&ReferenceScope>) -> Result<Option<HashSet<ObjectId>>> {
        match scope {
            None => Ok(None),
            Some(scope) => Ok(Some(
                self.find_references(scope)
                    .await?
                    .into_iter()
                    .map(|r| r.to_object_id)
                    .collect(),
            )),
        }
    }

    async fn find_many(&self, model_name: &str, query: &EntityQuery) -> Result<Page<EntityObject>> {
        query.window()?;
        let reachable = self.reachable_ids(query.references.as_ref()).await?;
        let objects = self.scan(model_name).await?;
        query.execute(objects, reachable.as_ref())
    }

    /// Filtered total, ignoring pagination
    async fn find_count(&self, model_name: &str, query: &EntityQuery) -> Result<usize> {
        let reachable = self.reachable_ids(query.references.as_ref()).await?;
        let objects = self.scan(model_name).await?;
        Ok(query.select(objects, reachable.as_ref()).len())
    }

    /// Assemble the filtered, sorted objects into a forest.
    ///
    /// Roots are objects whose `parent_field` is empty or names an object
    /// outside the result. Cycles are cut so every object appears once.
    async fn find_tree_objects(
        &self,
        model_name: &str,
        parent_field: &str,
        query: &EntityQuery,
    ) -> Result<Vec<TreeNode>> {
        let reachable = self.reachable_ids(query.references.as_ref()).await?;
        let mut objects = query.select(self.scan(model_name).await?, reachable.as_ref());
        query.sort_by.sort(&mut objects);
        Ok(build_forest(objects, parent_field))
    }

    async fn find_one_with_references(
        &self,
        model_name: &str,
        id: &ObjectId,
        fields: &[String],
    ) -> Result<Option<ObjectWithReferences>> {
        let config = self.find_plain_config().await?;
        let ref_fields = reference_fields(&config, model_name, fields)?;
        match self.find_one(model_name, id).await? {
            Some(object) => Ok(Some(self.attach_references(object, &ref_fields).await?)),
            None => Ok(None),
        }
    }

    async fn find_many_with_references(
        &self,
        model_name: &str,
        query: &EntityQuery,
        fields: &[String],
    ) -> Result<Page<ObjectWithReferences>> {
        let config = self.find_plain_config().await?;
        let ref_fields = reference_fields(&config, model_name, fields)?;
        let page = self.find_many(model_name, query).await?;

        let mut data = Vec::with_capacity(page.data.len());
        for object in page.data {
            data.push(self.attach_references(object, &ref_fields).await?);
        }
        Ok(Page {
            data,
            count: page.count,
        })
    }

    async fn attach_references(
        &self,
        object: EntityObject,
        ref_fields: &[FieldDefinition],
    ) -> Result<ObjectWithReferences> {
        let mut references = BTreeMap::new();
        for field in ref_fields {
            let Some(to_model) = field.ref_model.as_deref() else {
                continue;
            };
            let scope = ReferenceScope::new(
                object.model_name.clone(),
                field.name.clone(),
                object.id.clone(),
                to_model,
            );
            let mut targets = Vec::new();
            for edge in self.find_references(&scope).await? {
                if let Some(target) = self.find_one(to_model, &edge.to_object_id).await? {
                    targets.push(target);
                }
            }
            references.insert(field.name.clone(), targets);
        }
        Ok(ObjectWithReferences { object, references })
    }

    async fn find_grouped_objects(
        &self,
        model_name: &str,
        query: &GroupedQuery,
    ) -> Result<GroupedResult> {
        let reachable = self.reachable_ids(query.references.as_ref()).await?;
        let objects = self.scan(model_name).await?;
        query.execute(objects, reachable.as_ref())
    }

    async fn validate(&self, model_name: &str, values: &Values) -> Result<ValidationReport> {
        let config = self.find_plain_config().await?;
        let model = config
            .model(model_name)
            .ok_or_else(|| EngineError::NotFound(format!("model '{}'", model_name)))?;
        Ok(model.validate(values))
    }
}

impl<T> EntityDataSource for T where T: ObjectStore + ReferenceStore + ConfigStore {}

/// Resolve requested reference fields; all of the model's when none are named
fn reference_fields(
    config: &PlainConfig,
    model_name: &str,
    fields: &[String],
) -> Result<Vec<FieldDefinition>> {
    let model = config.model(model_name);
    if fields.is_empty() {
        return Ok(model
            .map(|m| m.reference_fields().cloned().collect())
            .unwrap_or_default());
    }
    fields
        .iter()
        .map(|name| {
            model
                .and_then(|m| m.field(name))
                .filter(|f| f.is_reference())
                .cloned()
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "'{}' is not a reference field of model '{}'",
                        name, model_name
                    ))
                })
        })
        .collect()
}

fn parent_id(object: &EntityObject, parent_field: &str) -> Option<ObjectId> {
    match &*lookup(object, parent_field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(ObjectId::from_string(s.clone())),
        _ => None,
    }
}

fn build_forest(objects: Vec<EntityObject>, parent_field: &str) -> Vec<TreeNode> {
    let index: HashMap<ObjectId, usize> = objects
        .iter()
        .enumerate()
        .map(|(i, o)| (o.id.clone(), i))
        .collect();

    let mut roots = Vec::new();
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, object) in objects.iter().enumerate() {
        match parent_id(object, parent_field).and_then(|p| index.get(&p).copied()) {
            Some(parent) if parent != i => children.entry(parent).or_default().push(i),
            _ => roots.push(i),
        }
    }

    let mut slots: Vec<Option<EntityObject>> = objects.into_iter().map(Some).collect();
    let mut forest: Vec<TreeNode> = roots
        .into_iter()
        .filter_map(|i| take_subtree(i, &mut slots, &children))
        .collect();

    // Whatever is left hangs off a cycle; its first member becomes a root
    for i in 0..slots.len() {
        if let Some(node) = take_subtree(i, &mut slots, &children) {
            forest.push(node);
        }
    }
    forest
}

fn take_subtree(
    i: usize,
    slots: &mut [Option<EntityObject>],
    children: &HashMap<usize, Vec<usize>>,
) -> Option<TreeNode> {
    let object = slots[i].take()?;
    let kids = children
        .get(&i)
        .map(|kids| {
            kids.iter()
                .filter_map(|&k| take_subtree(k, slots, children))
                .collect()
        })
        .unwrap_or_default();
    Some(TreeNode {
        object,
        children: kids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityModel, FieldType, RefCardinality};
    use crate::query::{AggregateFunction, AggregationSpec, GroupSpec, Operator, QueryItem, SortBy, SortOrder};
    use serde_json::json;

    fn values(v: serde_json::Value) -> Values {
        v.as_object().cloned().unwrap()
    }

    fn config() -> PlainConfig {
        PlainConfig {
            models: vec![
                EntityModel::new(
                    "order",
                    vec![
                        FieldDefinition::new("title", FieldType::String).required(),
                        FieldDefinition::reference("items", "product", RefCardinality::Many),
                    ],
                ),
                EntityModel::new(
                    "product",
                    vec![
                        FieldDefinition::new("name", FieldType::String).required(),
                        FieldDefinition::new("stock", FieldType::Integer),
                    ],
                ),
            ],
            views: vec![],
        }
    }

    async fn seeded() -> MemoryDataSource {
        let source = MemoryDataSource::new();
        source.save_plain_config(&config()).await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_find_many_pages_cover_the_set() {
        let source = seeded().await;
        for i in 0..7 {
            source
                .create("product", values(json!({"name": format!("p{}", i), "stock": i})))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for page_index in 1..=3 {
            let query = EntityQuery::new()
                .with_sort(SortBy::new().then("stock", SortOrder::Desc))
                .with_page(page_index, 3);
            let page = source.find_many("product", &query).await.unwrap();
            assert_eq!(page.count, 7);
            seen.extend(page.data.into_iter().map(|o| o.values["stock"].as_i64().unwrap()));
        }
        assert_eq!(seen, vec![6, 5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_invalid_page_is_rejected() {
        let source = seeded().await;
        let query = EntityQuery::new().with_page(0, 10);
        let err = source.find_many("product", &query).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_references_narrow_results() {
        let source = seeded().await;
        let order = source.create("order", values(json!({"title": "A"}))).await.unwrap();
        let lamp = source.create("product", values(json!({"name": "lamp", "stock": 0}))).await.unwrap();
        let desk = source.create("product", values(json!({"name": "desk", "stock": 3}))).await.unwrap();
        source.create("product", values(json!({"name": "chair", "stock": 0}))).await.unwrap();

        let scope = ReferenceScope::new("order", "items", order.id.clone(), "product");
        let created = source
            .create_references(&scope, &[lamp.id.clone(), desk.id.clone(), lamp.id.clone()])
            .await
            .unwrap();
        assert_eq!(created, 2);
        assert_eq!(source.find_references_count(&scope).await.unwrap(), 2);

        let query = EntityQuery::new()
            .with_references(scope.clone())
            .with_filter(QueryItem::condition("stock", Operator::Lte, json!(0)).unwrap());
        let page = source.find_many("product", &query).await.unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.data[0].id, lamp.id);
        assert_eq!(source.find_count("product", &query).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_with_references_attaches_targets() {
        let source = seeded().await;
        let order = source.create("order", values(json!({"title": "A"}))).await.unwrap();
        let lamp = source.create("product", values(json!({"name": "lamp"}))).await.unwrap();
        let scope = ReferenceScope::new("order", "items", order.id.clone(), "product");
        source.create_reference(&scope, &lamp.id).await.unwrap();

        let found = source
            .find_one_with_references("order", &order.id, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.references["items"].len(), 1);
        assert_eq!(found.references["items"][0].values["name"], "lamp");

        let page = source
            .find_many_with_references("order", &EntityQuery::new(), &["items".to_string()])
            .await
            .unwrap();
        assert_eq!(page.data[0].references["items"][0].id, lamp.id);

        let err = source
            .find_one_with_references("order", &order.id, &["title".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_tree_breaks_cycles() {
        let source = seeded().await;
        let root = source.create("folder", values(json!({"name": "root"}))).await.unwrap();
        let child = source
            .create("folder", values(json!({"name": "child", "parentId": root.id.as_str()})))
            .await
            .unwrap();
        source
            .create("folder", values(json!({"name": "leaf", "parentId": child.id.as_str()})))
            .await
            .unwrap();
        // Two folders pointing at each other
        let a = source.create("folder", values(json!({"name": "a"}))).await.unwrap();
        let b = source
            .create("folder", values(json!({"name": "b", "parentId": a.id.as_str()})))
            .await
            .unwrap();
        source
            .update_values("folder", &a.id, values(json!({"parentId": b.id.as_str()})))
            .await
            .unwrap();

        let forest = source
            .find_tree_objects("folder", "parentId", &EntityQuery::new())
            .await
            .unwrap();

        fn count(nodes: &[TreeNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        assert_eq!(count(&forest), 5);
        assert_eq!(forest[0].object.id, root.id);
        assert_eq!(forest[0].children[0].children[0].object.values["name"], "leaf");
        assert_eq!(forest.len(), 2);
    }

    #[tokio::test]
    async fn test_grouped_objects() {
        let source = seeded().await;
        for (category, price) in [("a", 1), ("b", 2), ("a", 3), ("b", 4), ("b", 5)] {
            source
                .create("product", values(json!({"category": category, "price": price})))
                .await
                .unwrap();
        }
        let query = GroupedQuery::new(GroupSpec::field("category"))
            .with_aggregation(AggregationSpec::new("price", AggregateFunction::Sum));
        let result = source.find_grouped_objects("product", &query).await.unwrap();
        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups.iter().map(|g| g.count).sum::<usize>(), 5);
        assert_eq!(result.groups[1].aggregations.as_ref().unwrap()["price_sum"], json!(11));
    }

    #[tokio::test]
    async fn test_validate_against_model() {
        let source = seeded().await;
        let report = source
            .validate("product", &values(json!({"stock": "many", "color": "red"})))
            .await
            .unwrap();
        assert!(!report.valid);
        let fields: Vec<_> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"stock"));
        assert!(fields.contains(&"color"));

        let err = source.validate("unknown", &Values::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
