//! Per-source reconciliation of Popolo data against the local link ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use popolo_sources_core::{
    validate_source_url, Collection, CoreError, EntityRef, Link, Source, DEFAULT_ID_PREFIX,
};
use popolo_sources_import::{
    parse_document, IdentityResolver, ImportError, ImportObserver, PopoloImporter, ENTITY_SCHEMA,
};
use popolo_sources_storage::{
    DocumentFetcher, FetchError, HttpClientConfig, HttpFetcher, SnapshotArchive,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "popolo-sources-sync";

/// SQLite caps bound parameters per statement; soft-deletes are chunked below it.
const MARK_DELETED_CHUNK: usize = 500;

/// How long a cycle queues for the write lock held by another engine.
const LOCK_WAIT: Duration = Duration::from_secs(30);

pub const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS popolo_source (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS popolo_sources_link (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    source_id INTEGER NOT NULL REFERENCES popolo_source(id),
    deleted_from_source INTEGER NOT NULL DEFAULT 0,
    UNIQUE (content_type, object_id, source_id)
);

CREATE INDEX IF NOT EXISTS popolo_sources_link_source_idx
    ON popolo_sources_link(source_id, content_type, deleted_from_source);
"#;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("source {0} not found")]
    SourceNotFound(String),
    #[error("a source for {0} already exists")]
    SourceExists(String),
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("archiving snapshot: {0:#}")]
    Archive(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub id_prefix: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://popolo-sources.db?mode=rwc".to_string()),
            user_agent: std::env::var("POPOLO_SOURCES_USER_AGENT")
                .unwrap_or_else(|_| "popolo-sources/0.1".to_string()),
            http_timeout_secs: std::env::var("POPOLO_SOURCES_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            archive_dir: std::env::var("POPOLO_SOURCES_ARCHIVE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            id_prefix: std::env::var("POPOLO_SOURCES_ID_PREFIX")
                .unwrap_or_else(|_| DEFAULT_ID_PREFIX.to_string()),
        }
    }

    pub fn http_fetcher(&self) -> anyhow::Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
    }

    pub fn archive(&self) -> Option<SnapshotArchive> {
        self.archive_dir.clone().map(SnapshotArchive::new)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerDb {
    pool: SqlitePool,
}

impl LedgerDb {
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(LOCK_WAIT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        Self::with_schema(pool).await
    }

    /// Private in-memory database; one connection so every caller sees the same data.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_schema(pool).await
    }

    async fn with_schema(pool: SqlitePool) -> Result<Self, SyncError> {
        sqlx::raw_sql(ENTITY_SCHEMA).execute(&pool).await?;
        sqlx::raw_sql(LEDGER_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, SyncError> {
        Ok(self.pool.acquire().await?)
    }
}

pub struct SourceStore;

impl SourceStore {
    pub async fn create(conn: &mut SqliteConnection, url: &str) -> Result<Source, SyncError> {
        validate_source_url(url)?;
        if Self::find_by_url(&mut *conn, url).await?.is_some() {
            return Err(SyncError::SourceExists(url.to_string()));
        }
        let result = sqlx::query("INSERT INTO popolo_source (url) VALUES (?)")
            .bind(url)
            .execute(&mut *conn)
            .await?;
        let source = Source {
            id: result.last_insert_rowid(),
            url: url.to_string(),
        };
        info!(source_id = source.id, url, "created popolo source");
        Ok(source)
    }

    pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Source>, SyncError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, url FROM popolo_source WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(|(id, url)| Source { id, url }))
    }

    pub async fn find_by_url(
        conn: &mut SqliteConnection,
        url: &str,
    ) -> Result<Option<Source>, SyncError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, url FROM popolo_source WHERE url = ?")
                .bind(url)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(|(id, url)| Source { id, url }))
    }

    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Source>, SyncError> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM popolo_source ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(|(id, url)| Source { id, url }).collect())
    }

    pub async fn set_url(
        conn: &mut SqliteConnection,
        id: i64,
        url: &str,
    ) -> Result<Source, SyncError> {
        validate_source_url(url)?;
        let result = sqlx::query("UPDATE popolo_source SET url = ? WHERE id = ?")
            .bind(url)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::SourceNotFound(id.to_string()));
        }
        Ok(Source {
            id,
            url: url.to_string(),
        })
    }
}

/// The link ledger: which source produced which entity, with a soft-delete flag.
pub struct LinkLedger;

impl LinkLedger {
    pub async fn upsert(
        conn: &mut SqliteConnection,
        entity: EntityRef,
        source_id: i64,
        deleted_from_source: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO popolo_sources_link (content_type, object_id, source_id, deleted_from_source) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (content_type, object_id, source_id) \
             DO UPDATE SET deleted_from_source = excluded.deleted_from_source",
        )
        .bind(entity.collection.tag())
        .bind(entity.id)
        .bind(source_id)
        .bind(deleted_from_source)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn linked_ids(
        conn: &mut SqliteConnection,
        source_id: i64,
        collection: Collection,
        deleted_from_source: bool,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT object_id FROM popolo_sources_link \
             WHERE source_id = ? AND content_type = ? AND deleted_from_source = ? \
             ORDER BY object_id",
        )
        .bind(source_id)
        .bind(collection.tag())
        .bind(deleted_from_source)
        .fetch_all(&mut *conn)
        .await
    }

    pub async fn linked_entities(
        conn: &mut SqliteConnection,
        source_id: i64,
        deleted_from_source: bool,
    ) -> Result<BTreeSet<EntityRef>, sqlx::Error> {
        let mut entities = BTreeSet::new();
        for collection in Collection::ALL {
            let ids = Self::linked_ids(&mut *conn, source_id, collection, deleted_from_source).await?;
            entities.extend(ids.into_iter().map(|id| EntityRef::new(collection, id)));
        }
        Ok(entities)
    }

    pub async fn mark_deleted(
        conn: &mut SqliteConnection,
        source_id: i64,
        collection: Collection,
        ids: &BTreeSet<i64>,
    ) -> Result<u64, sqlx::Error> {
        let ids: Vec<i64> = ids.iter().copied().collect();
        let mut affected = 0;
        for chunk in ids.chunks(MARK_DELETED_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE popolo_sources_link SET deleted_from_source = 1 WHERE source_id = ",
            );
            qb.push_bind(source_id);
            qb.push(" AND content_type = ");
            qb.push_bind(collection.tag());
            qb.push(" AND object_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            affected += qb.build().execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    pub async fn links_for_source(
        conn: &mut SqliteConnection,
        source_id: i64,
    ) -> Result<Vec<Link>, SyncError> {
        let rows = sqlx::query(
            "SELECT id, content_type, object_id, deleted_from_source FROM popolo_sources_link \
             WHERE source_id = ? ORDER BY id",
        )
        .bind(source_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter()
            .map(|row| -> Result<Link, SyncError> {
                let content_type: String = row.try_get("content_type")?;
                Ok(Link {
                    id: row.try_get("id")?,
                    entity: EntityRef::new(content_type.parse()?, row.try_get("object_id")?),
                    source_id,
                    deleted_from_source: row.try_get("deleted_from_source")?,
                })
            })
            .collect()
    }
}

/// Resolves document ids only among entities already linked to one source.
#[derive(Debug, Clone)]
pub struct SourceScopedResolver {
    source: Source,
    id_prefix: String,
}

impl SourceScopedResolver {
    pub fn new(source: Source, id_prefix: impl Into<String>) -> Self {
        Self {
            source,
            id_prefix: id_prefix.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for SourceScopedResolver {
    async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<EntityRef>, ImportError> {
        let collection: Collection = collection.parse()?;

        // Either flag state matches: a reappearing entity must be found, not recreated.
        let sql = format!(
            "SELECT DISTINCT e.id FROM {table} e \
             JOIN popolo_identifier i ON i.object_id = e.id AND i.content_type = ? \
             JOIN popolo_sources_link l ON l.object_id = e.id AND l.content_type = ? \
             WHERE i.scheme = ? AND i.identifier = ? AND l.source_id = ? \
             ORDER BY e.id",
            table = collection.table()
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(collection.tag())
            .bind(collection.tag())
            .bind(collection.scheme(&self.id_prefix))
            .bind(external_id)
            .bind(self.source.id)
            .fetch_all(&mut *conn)
            .await?;

        match ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(EntityRef::new(collection, *id))),
            _ => Err(ImportError::AmbiguousIdentifier {
                popolo_source: self.source.to_string(),
                collection,
                external_id: external_id.to_string(),
                count: ids.len(),
            }),
        }
    }
}

/// Upserts a live link for every imported entity, undeleting reappearing ones.
#[derive(Debug, Clone)]
pub struct LinkCreator {
    source_id: i64,
}

impl LinkCreator {
    pub fn new(source_id: i64) -> Self {
        Self { source_id }
    }
}

#[async_trait]
impl ImportObserver for LinkCreator {
    async fn notify(
        &mut self,
        conn: &mut SqliteConnection,
        _collection: Collection,
        entity: EntityRef,
        _created: bool,
        _record: &JsonValue,
    ) -> Result<(), ImportError> {
        LinkLedger::upsert(conn, entity, self.source_id, false).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CurrentObjectsTracker {
    seen: BTreeSet<EntityRef>,
}

impl CurrentObjectsTracker {
    pub fn seen(&self) -> &BTreeSet<EntityRef> {
        &self.seen
    }

    pub fn into_seen(self) -> BTreeSet<EntityRef> {
        self.seen
    }
}

#[async_trait]
impl ImportObserver for CurrentObjectsTracker {
    async fn notify(
        &mut self,
        _conn: &mut SqliteConnection,
        _collection: Collection,
        entity: EntityRef,
        _created: bool,
        _record: &JsonValue,
    ) -> Result<(), ImportError> {
        self.seen.insert(entity);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub run_id: Uuid,
    pub source_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub created: usize,
    pub undeleted: usize,
    pub previously_live: usize,
    pub previously_deleted: usize,
    pub disappeared: usize,
    pub snapshot_sha256: String,
    /// Where the document came from after redirects.
    pub fetched_url: String,
}

/// Drives update cycles for one source. Each cycle imports inside a single
/// transaction and soft-deletes links of entities absent from the fetch.
pub struct SourceUpdater {
    db: LedgerDb,
    source: Source,
    fetcher: Arc<dyn DocumentFetcher>,
    importer: PopoloImporter,
    archive: Option<SnapshotArchive>,
    observers: Vec<Box<dyn ImportObserver>>,
}

impl SourceUpdater {
    pub fn new(db: LedgerDb, source: Source, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        let link_creator = LinkCreator::new(source.id);
        Self {
            db,
            source,
            fetcher,
            importer: PopoloImporter::default(),
            archive: None,
            observers: vec![Box::new(link_creator)],
        }
    }

    pub fn with_id_prefix(mut self, id_prefix: impl Into<String>) -> Self {
        self.importer = PopoloImporter::new(id_prefix);
        self
    }

    pub fn with_archive(mut self, archive: Option<SnapshotArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn ImportObserver>) {
        self.observers.push(observer);
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    fn resolver(&self) -> SourceScopedResolver {
        SourceScopedResolver::new(self.source.clone(), self.importer.id_prefix())
    }

    pub async fn existing_entity(
        &self,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<EntityRef>, SyncError> {
        let mut conn = self.db.acquire().await?;
        Ok(self
            .resolver()
            .resolve(&mut conn, collection, external_id)
            .await?)
    }

    pub async fn update_from_source(&mut self) -> Result<UpdateSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("update_from_source", %run_id, source_id = self.source.id);
        self.run_cycle(run_id).instrument(span).await
    }

    async fn run_cycle(&mut self, run_id: Uuid) -> Result<UpdateSummary, SyncError> {
        let started_at = Utc::now();
        self.reload_source().await?;
        let source_id = self.source.id;

        let fetched = self
            .fetcher
            .fetch(&self.source.url)
            .await
            .map_err(|source| SyncError::Fetch {
                url: self.source.url.clone(),
                source,
            })?;
        let snapshot_sha256 = SnapshotArchive::sha256_hex(&fetched.body);
        debug!(
            status = fetched.status,
            final_url = %fetched.final_url,
            bytes = fetched.body.len(),
            sha256 = %snapshot_sha256,
            "source document received"
        );
        if let Some(archive) = &self.archive {
            let archived = archive
                .archive(source_id, started_at, &fetched.body)
                .await
                .map_err(SyncError::Archive)?;
            debug!(
                path = %archived.path.display(),
                reused = archived.reused,
                "archived source snapshot"
            );
        }
        let document = parse_document(&fetched.body)?;

        // Take the write lock up front; a deferred upgrade fails with SQLITE_BUSY
        // when another engine writes to the same file mid-cycle.
        let mut tx = self.db.pool().begin_with("BEGIN IMMEDIATE").await?;
        let previously_live = LinkLedger::linked_entities(&mut tx, source_id, false).await?;
        let previously_deleted = LinkLedger::linked_entities(&mut tx, source_id, true).await?;

        let resolver = self.resolver();
        let mut tracker = CurrentObjectsTracker::default();
        let report = {
            let mut sinks: Vec<&mut dyn ImportObserver> = self
                .observers
                .iter_mut()
                .map(|observer| observer.as_mut() as &mut dyn ImportObserver)
                .collect();
            sinks.push(&mut tracker);
            self.importer
                .import_document(&mut tx, &document, &resolver, &mut sinks)
                .await?
        };
        let seen = tracker.into_seen();

        let disappeared: BTreeSet<EntityRef> =
            previously_live.difference(&seen).copied().collect();
        let undeleted = seen.intersection(&previously_deleted).count();

        let mut by_collection: BTreeMap<Collection, BTreeSet<i64>> = BTreeMap::new();
        for entity in &disappeared {
            by_collection
                .entry(entity.collection)
                .or_default()
                .insert(entity.id);
        }
        for (collection, ids) in &by_collection {
            let flagged = LinkLedger::mark_deleted(&mut tx, source_id, *collection, ids).await?;
            info!(%collection, count = flagged, "marked links deleted from source");
        }
        for (collection, ids) in &by_collection {
            for id in ids {
                let entity = EntityRef::new(*collection, *id);
                for observer in self.observers.iter_mut() {
                    observer.notify_deleted(&mut tx, *collection, entity).await?;
                }
            }
        }

        tx.commit().await?;

        let summary = UpdateSummary {
            run_id,
            source_id,
            started_at,
            finished_at: Utc::now(),
            processed: report.processed(),
            created: report.created(),
            undeleted,
            previously_live: previously_live.len(),
            previously_deleted: previously_deleted.len(),
            disappeared: disappeared.len(),
            snapshot_sha256,
            fetched_url: fetched.final_url,
        };
        info!(
            processed = summary.processed,
            created = summary.created,
            undeleted = summary.undeleted,
            disappeared = summary.disappeared,
            "update from source complete"
        );
        Ok(summary)
    }

    async fn reload_source(&mut self) -> Result<(), SyncError> {
        let mut conn = self.db.acquire().await?;
        self.source = SourceStore::get(&mut conn, self.source.id)
            .await?
            .ok_or_else(|| SyncError::SourceNotFound(self.source.id.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popolo_sources_import::EntityStore;
    use serde_json::json;

    async fn person(conn: &mut SqliteConnection, name: &str, external_id: &str) -> EntityRef {
        let entity = EntityStore::insert(conn, Collection::Person, Some(name), &json!({"name": name}))
            .await
            .expect("insert person");
        EntityStore::add_identifier(conn, entity, "popit-person", external_id)
            .await
            .expect("identifier");
        entity
    }

    #[tokio::test]
    async fn upsert_keeps_one_link_per_entity_and_source() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let source = SourceStore::create(&mut conn, "http://example.com/popolo.json")
            .await
            .expect("source");
        let joe = person(&mut conn, "Joe Bloggs", "j1").await;

        LinkLedger::upsert(&mut conn, joe, source.id, true).await.expect("first");
        LinkLedger::upsert(&mut conn, joe, source.id, false).await.expect("second");
        LinkLedger::upsert(&mut conn, joe, source.id, false).await.expect("third");

        let links = LinkLedger::links_for_source(&mut conn, source.id)
            .await
            .expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].entity, joe);
        assert!(!links[0].deleted_from_source);
    }

    #[tokio::test]
    async fn mark_deleted_only_touches_the_given_source_and_ids() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let a = SourceStore::create(&mut conn, "http://example.com/a.json").await.expect("a");
        let b = SourceStore::create(&mut conn, "http://example.com/b.json").await.expect("b");
        let alice = person(&mut conn, "Alice", "a1b2").await;
        let bob = person(&mut conn, "Bob", "b1c2").await;
        for entity in [alice, bob] {
            LinkLedger::upsert(&mut conn, entity, a.id, false).await.expect("link a");
            LinkLedger::upsert(&mut conn, entity, b.id, false).await.expect("link b");
        }

        let flagged = LinkLedger::mark_deleted(
            &mut conn,
            a.id,
            Collection::Person,
            &BTreeSet::from([bob.id]),
        )
        .await
        .expect("mark");
        assert_eq!(flagged, 1);

        assert_eq!(
            LinkLedger::linked_entities(&mut conn, a.id, true).await.expect("deleted a"),
            BTreeSet::from([bob])
        );
        assert_eq!(
            LinkLedger::linked_entities(&mut conn, a.id, false).await.expect("live a"),
            BTreeSet::from([alice])
        );
        assert!(LinkLedger::linked_entities(&mut conn, b.id, true)
            .await
            .expect("deleted b")
            .is_empty());
        assert_eq!(
            LinkLedger::mark_deleted(&mut conn, a.id, Collection::Person, &BTreeSet::new())
                .await
                .expect("empty"),
            0
        );
    }

    #[tokio::test]
    async fn source_store_creates_lists_and_rejects_duplicates() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let foo = SourceStore::create(&mut conn, "http://example.com/foo.json").await.expect("foo");
        let bar = SourceStore::create(&mut conn, "http://example.com/bar.json").await.expect("bar");

        assert!(matches!(
            SourceStore::create(&mut conn, "http://example.com/foo.json").await,
            Err(SyncError::SourceExists(_))
        ));
        assert!(matches!(
            SourceStore::create(&mut conn, "not a url").await,
            Err(SyncError::Core(CoreError::InvalidSourceUrl { .. }))
        ));
        assert_eq!(
            SourceStore::list(&mut conn).await.expect("list"),
            vec![foo.clone(), bar.clone()]
        );
        assert_eq!(
            SourceStore::find_by_url(&mut conn, "http://example.com/bar.json")
                .await
                .expect("find"),
            Some(bar)
        );

        let moved = SourceStore::set_url(&mut conn, foo.id, "http://example.com/moved.json")
            .await
            .expect("set_url");
        assert_eq!(moved.id, foo.id);
        assert_eq!(SourceStore::get(&mut conn, foo.id).await.expect("get"), Some(moved));
        assert!(matches!(
            SourceStore::set_url(&mut conn, 999, "http://example.com/x.json").await,
            Err(SyncError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolver_is_scoped_to_the_current_source() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let a = SourceStore::create(&mut conn, "http://example.com/a.json").await.expect("a");
        let b = SourceStore::create(&mut conn, "http://example.com/b.json").await.expect("b");
        let alice = person(&mut conn, "Alice", "a1b2").await;
        LinkLedger::upsert(&mut conn, alice, a.id, true).await.expect("deleted link");

        let resolver_a = SourceScopedResolver::new(a, DEFAULT_ID_PREFIX);
        let resolver_b = SourceScopedResolver::new(b, DEFAULT_ID_PREFIX);
        assert_eq!(
            resolver_a.resolve(&mut conn, "person", "a1b2").await.expect("a"),
            Some(alice)
        );
        assert_eq!(resolver_b.resolve(&mut conn, "person", "a1b2").await.expect("b"), None);
        assert_eq!(resolver_a.resolve(&mut conn, "person", "zzzz").await.expect("miss"), None);
        assert_eq!(
            resolver_a.resolve(&mut conn, "organization", "a1b2").await.expect("other"),
            None
        );
    }

    #[tokio::test]
    async fn resolver_reports_ambiguous_identifiers() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let source = SourceStore::create(&mut conn, "http://example.com/single-person.json")
            .await
            .expect("source");
        let alice = person(&mut conn, "Alice", "a1b2").await;
        let bob = person(&mut conn, "Bob", "a1b2").await;
        for entity in [alice, bob] {
            LinkLedger::upsert(&mut conn, entity, source.id, false).await.expect("link");
        }

        let err = SourceScopedResolver::new(source.clone(), DEFAULT_ID_PREFIX)
            .resolve(&mut conn, "person", "a1b2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::AmbiguousIdentifier { count: 2, collection: Collection::Person, .. }
        ));
        assert_eq!(
            err.to_string(),
            format!(
                "unexpectedly found more than 1 objects matching {source}, collection 'person' \
                 and ID 'a1b2' - found 2 instead"
            )
        );
    }

    #[tokio::test]
    async fn resolver_rejects_unknown_collections() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let source = SourceStore::create(&mut conn, "http://example.com/a.json").await.expect("a");
        let err = SourceScopedResolver::new(source, DEFAULT_ID_PREFIX)
            .resolve(&mut conn, "not-a-collection", "y1z2")
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            ImportError::Core(CoreError::UnknownCollection(tag)) if tag == "not-a-collection"
        ));
        assert_eq!(err.to_string(), "unknown collection 'not-a-collection'");
    }

    #[tokio::test]
    async fn tracker_records_each_entity_once() {
        let db = LedgerDb::in_memory().await.expect("db");
        let mut conn = db.acquire().await.expect("conn");
        let mut tracker = CurrentObjectsTracker::default();
        let entity = EntityRef::new(Collection::Post, 4);
        for _ in 0..2 {
            tracker
                .notify(&mut conn, Collection::Post, entity, false, &json!({}))
                .await
                .expect("notify");
        }
        tracker
            .notify_deleted(&mut conn, Collection::Post, entity)
            .await
            .expect("notify_deleted");
        assert_eq!(tracker.seen(), &BTreeSet::from([entity]));
    }
}
