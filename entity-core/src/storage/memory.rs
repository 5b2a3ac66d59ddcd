//! In-memory data source for tests and ephemeral servers

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ConfigStore, DeleteMode, ObjectStore, ReferenceStore};
use crate::error::Result;
use crate::ids::ObjectId;
use crate::model::{EntityObject, EntityObjectReference, PlainConfig, ReferenceScope, Values};

#[derive(Debug, Default)]
struct Tables {
    /// model name -> objects in creation order
    objects: HashMap<String, Vec<EntityObject>>,
    references: Vec<EntityObjectReference>,
    config: PlainConfig,
}

impl Tables {
    fn live_mut(&mut self, model_name: &str, id: &ObjectId) -> Option<&mut EntityObject> {
        self.objects
            .get_mut(model_name)?
            .iter_mut()
            .find(|o| &o.id == id && !o.is_deleted)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDataSource {
    tables: RwLock<Tables>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PlainConfig) -> Self {
        MemoryDataSource {
            tables: RwLock::new(Tables {
                config,
                ..Tables::default()
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryDataSource {
    async fn find_one(&self, model_name: &str, id: &ObjectId) -> Result<Option<EntityObject>> {
        let tables = self.tables.read().await;
        Ok(tables
            .objects
            .get(model_name)
            .and_then(|objects| objects.iter().find(|o| &o.id == id && !o.is_deleted))
            .cloned())
    }

    async fn scan(&self, model_name: &str) -> Result<Vec<EntityObject>> {
        let tables = self.tables.read().await;
        Ok(tables
            .objects
            .get(model_name)
            .map(|objects| objects.iter().filter(|o| !o.is_deleted).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, model_name: &str, values: Values) -> Result<EntityObject> {
        let object = EntityObject::new(model_name, values);
        let mut tables = self.tables.write().await;
        tables
            .objects
            .entry(model_name.to_string())
            .or_default()
            .push(object.clone());
        Ok(object)
    }

    async fn update(&self, object: &EntityObject) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.live_mut(&object.model_name, &object.id) {
            Some(stored) => {
                stored.values = object.values.clone();
                stored.updated_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_values(&self, model_name: &str, id: &ObjectId, values: Values) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.live_mut(model_name, id) {
            Some(stored) => {
                stored.values.extend(values);
                stored.updated_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, model_name: &str, id: &ObjectId, mode: DeleteMode) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match mode {
            DeleteMode::Soft => match tables.live_mut(model_name, id) {
                Some(stored) => {
                    stored.is_deleted = true;
                    stored.updated_at = Some(Utc::now());
                    Ok(true)
                }
                None => Ok(false),
            },
            DeleteMode::Hard => {
                let Some(objects) = tables.objects.get_mut(model_name) else {
                    return Ok(false);
                };
                let before = objects.len();
                objects.retain(|o| &o.id != id);
                if objects.len() == before {
                    return Ok(false);
                }
                tables.references.retain(|r| !r.touches(model_name, id));
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl ReferenceStore for MemoryDataSource {
    async fn create_reference(
        &self,
        scope: &ReferenceScope,
        to_object_id: &ObjectId,
    ) -> Result<EntityObjectReference> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .references
            .iter()
            .find(|r| r.in_scope(scope) && &r.to_object_id == to_object_id)
        {
            return Ok(existing.clone());
        }
        let reference = EntityObjectReference::new(scope, to_object_id.clone());
        tables.references.push(reference.clone());
        Ok(reference)
    }

    async fn delete_reference(&self, scope: &ReferenceScope, to_object_id: &ObjectId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.references.len();
        tables
            .references
            .retain(|r| !(r.in_scope(scope) && &r.to_object_id == to_object_id));
        Ok(tables.references.len() < before)
    }

    async fn find_references(&self, scope: &ReferenceScope) -> Result<Vec<EntityObjectReference>> {
        let tables = self.tables.read().await;
        Ok(tables
            .references
            .iter()
            .filter(|r| r.in_scope(scope))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConfigStore for MemoryDataSource {
    async fn find_plain_config(&self) -> Result<PlainConfig> {
        Ok(self.tables.read().await.config.clone())
    }

    async fn save_plain_config(&self, config: &PlainConfig) -> Result<()> {
        self.tables.write().await.config = config.clone();
        Ok(())
    }
}
