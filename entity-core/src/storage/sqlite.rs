//! SQLite-backed data source
//!
//! One connection shared behind a mutex. Object values are stored as a JSON
//! column and filtered in process with the same evaluator as the memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ConfigStore, DeleteMode, ObjectStore, ReferenceStore};
use crate::error::Result;
use crate::ids::{ObjectId, ReferenceId};
use crate::model::{EntityObject, EntityObjectReference, PlainConfig, ReferenceScope, Values};

/// Initialize objects, references and config tables
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            id TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            values_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_objects_model ON objects(model_name, is_deleted);

        -- Directed named edges; one row per distinct 5-tuple
        CREATE TABLE IF NOT EXISTS object_references (
            id TEXT PRIMARY KEY,
            from_model_name TEXT NOT NULL,
            from_field_name TEXT NOT NULL,
            from_object_id TEXT NOT NULL,
            to_model_name TEXT NOT NULL,
            to_object_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(from_model_name, from_field_name, from_object_id, to_model_name, to_object_id)
        );

        CREATE INDEX IF NOT EXISTS idx_object_references_to
            ON object_references(to_model_name, to_object_id);

        CREATE TABLE IF NOT EXISTS plain_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            body TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn read_object(row: &Row) -> rusqlite::Result<EntityObject> {
    let values_json: String = row.get(5)?;
    let values: Values = serde_json::from_str(&values_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(EntityObject {
        id: ObjectId::from_string(row.get::<_, String>(0)?),
        model_name: row.get(1)?,
        is_deleted: row.get::<_, i64>(2)? != 0,
        created_at: from_millis(row.get(3)?),
        updated_at: from_millis(row.get(4)?),
        values,
    })
}

fn read_reference(row: &Row) -> rusqlite::Result<EntityObjectReference> {
    Ok(EntityObjectReference {
        id: ReferenceId::from_string(row.get::<_, String>(0)?),
        from_model_name: row.get(1)?,
        from_field_name: row.get(2)?,
        from_object_id: ObjectId::from_string(row.get::<_, String>(3)?),
        to_model_name: row.get(4)?,
        to_object_id: ObjectId::from_string(row.get::<_, String>(5)?),
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

const OBJECT_COLUMNS: &str = "id, model_name, is_deleted, created_at, updated_at, values_json";
const REFERENCE_COLUMNS: &str = "id, from_model_name, from_field_name, from_object_id, to_model_name, to_object_id, created_at, updated_at";

/// Shared SQLite connection
///
/// Create one source and share it via `Arc` across handlers.
pub struct SqliteDataSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataSource {
    /// Open or create a SQLite database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_live(conn: &Connection, model_name: &str, id: &ObjectId) -> Result<Option<EntityObject>> {
    let object = conn
        .query_row(
            &format!(
                "SELECT {} FROM objects WHERE id = ?1 AND model_name = ?2 AND is_deleted = 0",
                OBJECT_COLUMNS
            ),
            params![id.as_str(), model_name],
            read_object,
        )
        .optional()?;
    Ok(object)
}

fn write_values(conn: &Connection, model_name: &str, id: &ObjectId, values: &Values) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE objects SET values_json = ?1, updated_at = ?2
         WHERE id = ?3 AND model_name = ?4 AND is_deleted = 0",
        params![
            serde_json::to_string(values)?,
            Utc::now().timestamp_millis(),
            id.as_str(),
            model_name
        ],
    )?;
    Ok(changed > 0)
}

#[async_trait]
impl ObjectStore for SqliteDataSource {
    async fn find_one(&self, model_name: &str, id: &ObjectId) -> Result<Option<EntityObject>> {
        find_live(&self.conn(), model_name, id)
    }

    async fn scan(&self, model_name: &str) -> Result<Vec<EntityObject>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM objects WHERE model_name = ?1 AND is_deleted = 0 ORDER BY rowid",
            OBJECT_COLUMNS
        ))?;
        let objects = stmt
            .query_map(params![model_name], read_object)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(objects)
    }

    async fn create(&self, model_name: &str, values: Values) -> Result<EntityObject> {
        let object = EntityObject::new(model_name, values);
        let now = object.created_at.unwrap_or_else(Utc::now).timestamp_millis();
        self.conn().execute(
            "INSERT INTO objects (id, model_name, is_deleted, created_at, updated_at, values_json)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)",
            params![
                object.id.as_str(),
                model_name,
                now,
                now,
                serde_json::to_string(&object.values)?
            ],
        )?;
        Ok(object)
    }

    async fn update(&self, object: &EntityObject) -> Result<bool> {
        write_values(&self.conn(), &object.model_name, &object.id, &object.values)
    }

    async fn update_values(&self, model_name: &str, id: &ObjectId, values: Values) -> Result<bool> {
        let conn = self.conn();
        let Some(mut object) = find_live(&conn, model_name, id)? else {
            return Ok(false);
        };
        object.values.extend(values);
        write_values(&conn, model_name, id, &object.values)
    }

    async fn delete(&self, model_name: &str, id: &ObjectId, mode: DeleteMode) -> Result<bool> {
        let mut conn = self.conn();
        match mode {
            DeleteMode::Soft => {
                let changed = conn.execute(
                    "UPDATE objects SET is_deleted = 1, updated_at = ?1
                     WHERE id = ?2 AND model_name = ?3 AND is_deleted = 0",
                    params![Utc::now().timestamp_millis(), id.as_str(), model_name],
                )?;
                Ok(changed > 0)
            }
            DeleteMode::Hard => {
                // Object and its edges go together or not at all
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "DELETE FROM objects WHERE id = ?1 AND model_name = ?2",
                    params![id.as_str(), model_name],
                )?;
                if changed == 0 {
                    return Ok(false);
                }
                tx.execute(
                    "DELETE FROM object_references
                     WHERE (from_model_name = ?1 AND from_object_id = ?2)
                        OR (to_model_name = ?1 AND to_object_id = ?2)",
                    params![model_name, id.as_str()],
                )?;
                tx.commit()?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl ReferenceStore for SqliteDataSource {
    async fn create_reference(
        &self,
        scope: &ReferenceScope,
        to_object_id: &ObjectId,
    ) -> Result<EntityObjectReference> {
        let conn = self.conn();
        let reference = EntityObjectReference::new(scope, to_object_id.clone());
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR IGNORE INTO object_references
             (id, from_model_name, from_field_name, from_object_id, to_model_name, to_object_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reference.id.as_str(),
                scope.from_model_name,
                scope.from_field_name,
                scope.from_object_id.as_str(),
                scope.to_model_name,
                to_object_id.as_str(),
                now,
                now
            ],
        )?;
        let stored = conn.query_row(
            &format!(
                "SELECT {} FROM object_references
                 WHERE from_model_name = ?1 AND from_field_name = ?2 AND from_object_id = ?3
                   AND to_model_name = ?4 AND to_object_id = ?5",
                REFERENCE_COLUMNS
            ),
            params![
                scope.from_model_name,
                scope.from_field_name,
                scope.from_object_id.as_str(),
                scope.to_model_name,
                to_object_id.as_str()
            ],
            read_reference,
        )?;
        Ok(stored)
    }

    async fn delete_reference(&self, scope: &ReferenceScope, to_object_id: &ObjectId) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM object_references
             WHERE from_model_name = ?1 AND from_field_name = ?2 AND from_object_id = ?3
               AND to_model_name = ?4 AND to_object_id = ?5",
            params![
                scope.from_model_name,
                scope.from_field_name,
                scope.from_object_id.as_str(),
                scope.to_model_name,
                to_object_id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    async fn find_references(&self, scope: &ReferenceScope) -> Result<Vec<EntityObjectReference>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM object_references
             WHERE from_model_name = ?1 AND from_field_name = ?2 AND from_object_id = ?3
               AND to_model_name = ?4
             ORDER BY rowid",
            REFERENCE_COLUMNS
        ))?;
        let references = stmt
            .query_map(
                params![
                    scope.from_model_name,
                    scope.from_field_name,
                    scope.from_object_id.as_str(),
                    scope.to_model_name
                ],
                read_reference,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(references)
    }

    async fn find_references_count(&self, scope: &ReferenceScope) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM object_references
             WHERE from_model_name = ?1 AND from_field_name = ?2 AND from_object_id = ?3
               AND to_model_name = ?4",
            params![
                scope.from_model_name,
                scope.from_field_name,
                scope.from_object_id.as_str(),
                scope.to_model_name
            ],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl ConfigStore for SqliteDataSource {
    async fn find_plain_config(&self) -> Result<PlainConfig> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM plain_config WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(PlainConfig::default()),
        }
    }

    async fn save_plain_config(&self, config: &PlainConfig) -> Result<()> {
        self.conn().execute(
            "INSERT INTO plain_config (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![serde_json::to_string(config)?],
        )?;
        Ok(())
    }
}
