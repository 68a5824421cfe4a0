//! Popolo JSON import routine + entity store.
//!
//! The importer walks every supported collection of a Popolo document, asks an
//! [`IdentityResolver`] whether each record already exists locally, creates or
//! updates the entity row, and reports every processed entity to the
//! registered [`ImportObserver`]s.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use popolo_sources_core::{
    Collection, CoreError, EntityRef, ExternalIdentifier, DEFAULT_ID_PREFIX,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "popolo-sources-import";

/// Entity tables plus the identifier table the resolver joins against.
pub const ENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS popolo_area (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS popolo_organization (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS popolo_post (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS popolo_person (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS popolo_membership (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS popolo_identifier (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    identifier TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS popolo_identifier_lookup_idx
    ON popolo_identifier(content_type, scheme, identifier);
"#;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed Popolo document: {0}")]
    MalformedDocument(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(
        "unexpectedly found more than 1 objects matching {popolo_source}, collection '{collection}' \
         and ID '{external_id}' - found {count} instead"
    )]
    AmbiguousIdentifier {
        popolo_source: String,
        collection: Collection,
        external_id: String,
        count: usize,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::MalformedDocument(err.to_string())
    }
}

/// Identity-resolution strategy: map a document record onto an existing entity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<EntityRef>, ImportError>;
}

/// Sink for per-entity import events.
///
/// Observers are awaited one after another in registration order; an error
/// aborts the import.
#[async_trait]
pub trait ImportObserver: Send {
    async fn notify(
        &mut self,
        conn: &mut SqliteConnection,
        collection: Collection,
        entity: EntityRef,
        created: bool,
        record: &JsonValue,
    ) -> Result<(), ImportError>;

    async fn notify_deleted(
        &mut self,
        _conn: &mut SqliteConnection,
        _collection: Collection,
        _entity: EntityRef,
    ) -> Result<(), ImportError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub processed: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub collections: BTreeMap<Collection, CollectionCounts>,
}

impl ImportReport {
    fn record(&mut self, collection: Collection, created: bool) {
        let counts = self.collections.entry(collection).or_default();
        counts.processed += 1;
        if created {
            counts.created += 1;
        }
    }

    pub fn processed(&self) -> usize {
        self.collections.values().map(|c| c.processed).sum()
    }

    pub fn created(&self) -> usize {
        self.collections.values().map(|c| c.created).sum()
    }
}

/// Row-level access to the five entity tables and their identifiers.
pub struct EntityStore;

impl EntityStore {
    pub async fn insert(
        conn: &mut SqliteConnection,
        collection: Collection,
        name: Option<&str>,
        record: &JsonValue,
    ) -> Result<EntityRef, ImportError> {
        let sql = format!("INSERT INTO {} (name, data) VALUES (?, ?)", collection.table());
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(record.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(EntityRef::new(collection, result.last_insert_rowid()))
    }

    pub async fn update(
        conn: &mut SqliteConnection,
        entity: EntityRef,
        name: Option<&str>,
        record: &JsonValue,
    ) -> Result<(), ImportError> {
        let sql = format!(
            "UPDATE {} SET name = ?, data = ? WHERE id = ?",
            entity.collection.table()
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(record.to_string())
            .bind(entity.id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn add_identifier(
        conn: &mut SqliteConnection,
        entity: EntityRef,
        scheme: &str,
        identifier: &str,
    ) -> Result<(), ImportError> {
        sqlx::query(
            "INSERT INTO popolo_identifier (content_type, object_id, scheme, identifier) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(entity.collection.tag())
        .bind(entity.id)
        .bind(scheme)
        .bind(identifier)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn identifiers_of(
        conn: &mut SqliteConnection,
        entity: EntityRef,
    ) -> Result<Vec<ExternalIdentifier>, ImportError> {
        let rows = sqlx::query(
            "SELECT scheme, identifier FROM popolo_identifier \
             WHERE content_type = ? AND object_id = ? ORDER BY id",
        )
        .bind(entity.collection.tag())
        .bind(entity.id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter()
            .map(|row| -> Result<ExternalIdentifier, ImportError> {
                Ok(ExternalIdentifier {
                    scheme: row.try_get("scheme")?,
                    identifier: row.try_get("identifier")?,
                })
            })
            .collect()
    }

    pub async fn name_of(
        conn: &mut SqliteConnection,
        entity: EntityRef,
    ) -> Result<Option<String>, ImportError> {
        let sql = format!("SELECT name FROM {} WHERE id = ?", entity.collection.table());
        let name: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(entity.id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(name.flatten())
    }

    pub async fn count(
        conn: &mut SqliteConnection,
        collection: Collection,
    ) -> Result<i64, ImportError> {
        let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
        Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
    }
}

pub fn parse_document(bytes: &[u8]) -> Result<JsonValue, ImportError> {
    let document: JsonValue = serde_json::from_slice(bytes)?;
    validate_document(&document)?;
    Ok(document)
}

/// Shape checks done before any row is written.
pub fn validate_document(document: &JsonValue) -> Result<(), ImportError> {
    let Some(root) = document.as_object() else {
        return Err(ImportError::MalformedDocument(
            "document root must be a JSON object".into(),
        ));
    };
    for collection in Collection::ALL {
        let Some(records) = root.get(collection.document_key()) else {
            continue;
        };
        let Some(records) = records.as_array() else {
            return Err(ImportError::MalformedDocument(format!(
                "'{}' must be an array",
                collection.document_key()
            )));
        };
        let mut seen = HashSet::new();
        for (index, record) in records.iter().enumerate() {
            let external_id = record_id(collection, index, record)?;
            if !seen.insert(external_id) {
                return Err(ImportError::MalformedDocument(format!(
                    "duplicate id '{external_id}' in '{}'",
                    collection.document_key()
                )));
            }
        }
    }
    Ok(())
}

fn record_id(collection: Collection, index: usize, record: &JsonValue) -> Result<&str, ImportError> {
    record
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            ImportError::MalformedDocument(format!(
                "{}[{index}] has no string 'id'",
                collection.document_key()
            ))
        })
}

fn collection_records(document: &JsonValue, collection: Collection) -> &[JsonValue] {
    document
        .get(collection.document_key())
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Memberships usually carry a label or role rather than a name.
pub fn display_name(record: &JsonValue) -> Option<&str> {
    ["name", "label", "role"]
        .into_iter()
        .find_map(|key| record.get(key).and_then(JsonValue::as_str))
}

#[derive(Debug, Clone)]
pub struct PopoloImporter {
    id_prefix: String,
}

impl Default for PopoloImporter {
    fn default() -> Self {
        Self::new(DEFAULT_ID_PREFIX)
    }
}

impl PopoloImporter {
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: id_prefix.into(),
        }
    }

    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    pub async fn import_document(
        &self,
        conn: &mut SqliteConnection,
        document: &JsonValue,
        resolver: &dyn IdentityResolver,
        observers: &mut [&mut dyn ImportObserver],
    ) -> Result<ImportReport, ImportError> {
        validate_document(document)?;
        let mut report = ImportReport::default();

        for collection in Collection::ALL {
            for (index, record) in collection_records(document, collection).iter().enumerate() {
                let external_id = record_id(collection, index, record)?;
                let name = display_name(record);

                let existing = resolver
                    .resolve(&mut *conn, collection.tag(), external_id)
                    .await?;
                let (entity, created) = match existing {
                    Some(entity) => {
                        EntityStore::update(&mut *conn, entity, name, record).await?;
                        (entity, false)
                    }
                    None => {
                        let entity = EntityStore::insert(&mut *conn, collection, name, record).await?;
                        EntityStore::add_identifier(
                            &mut *conn,
                            entity,
                            &collection.scheme(&self.id_prefix),
                            external_id,
                        )
                        .await?;
                        (entity, true)
                    }
                };
                debug!(%entity, external_id, created, "imported record");

                for observer in observers.iter_mut() {
                    observer
                        .notify(&mut *conn, collection, entity, created, record)
                        .await?;
                }
                report.record(collection, created);
            }
        }

        info!(
            processed = report.processed(),
            created = report.created(),
            "popolo document imported"
        );
        Ok(report)
    }
}
