//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database holding the
//! persistent geocoding cache and the history of pipeline runs. Canonical
//! project records are not stored here; they are exported as JSON.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use prospector_shared::{GeocodeHit, ProspectorError, Result};
use serde::Serialize;
use uuid::Uuid;

fn storage_err(e: impl std::fmt::Display) -> ProspectorError {
    ProspectorError::Storage(e.to_string())
}

/// One row of the `runs` table.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub cancelled: bool,
    pub metrics: Option<serde_json::Value>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProspectorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ProspectorError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Geocode cache
    // -----------------------------------------------------------------------

    /// Look up a cached geocoding result.
    ///
    /// `Ok(None)` means the key was never cached; `Ok(Some(None))` means a
    /// previous lookup for the key found nothing.
    pub async fn get_geocode(&self, key: &str) -> Result<Option<Option<GeocodeHit>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM geocode_cache WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let payload = row.get::<Option<String>>(0).map_err(storage_err)?;
        match payload {
            None => Ok(Some(None)),
            Some(json) => {
                let hit = serde_json::from_str(&json).map_err(|e| {
                    ProspectorError::Storage(format!("corrupt geocode cache entry {key}: {e}"))
                })?;
                Ok(Some(Some(hit)))
            }
        }
    }

    /// Store a geocoding result (or a miss). Last writer wins.
    pub async fn put_geocode(&self, key: &str, hit: Option<&GeocodeHit>) -> Result<()> {
        let payload = hit
            .map(serde_json::to_string)
            .transpose()
            .map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO geocode_cache (key, payload, cached_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, cached_at = excluded.cached_at",
                params![key, payload, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Remove a cached entry. Returns whether a row was deleted.
    pub async fn evict_geocode(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM geocode_cache WHERE key = ?1", params![key])
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Drop every cached miss so failed lookups are retried next run.
    pub async fn evict_geocode_misses(&self) -> Result<u64> {
        self.conn
            .execute("DELETE FROM geocode_cache WHERE payload IS NULL", params![])
            .await
            .map_err(storage_err)
    }

    pub async fn count_geocode(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM geocode_cache", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<u64>(0).map_err(storage_err),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run. Returns the new run id.
    pub async fn insert_run(&self) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at) VALUES (?1, ?2)",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Mark a run finished and attach its metrics snapshot.
    pub async fn finish_run(&self, run_id: &str, metrics_json: &str, cancelled: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE runs SET finished_at = ?1, metrics_json = ?2, cancelled = ?3 WHERE id = ?4",
                params![now.as_str(), metrics_json, cancelled as i64, run_id],
            )
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(ProspectorError::not_found(format!("run {run_id}")));
        }
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, cancelled, metrics_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let metrics = row
                .get::<Option<String>>(4)
                .map_err(storage_err)?
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(storage_err)?;
            runs.push(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<Option<String>>(2).map_err(storage_err)?,
                cancelled: row.get::<i64>(3).map_err(storage_err)? != 0,
                metrics,
            });
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospector_shared::GeoAddress;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("prospector_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn queensland_hit() -> GeocodeHit {
        GeocodeHit {
            latitude: Some(-20.123456789),
            longitude: Some(146.987654321),
            address: GeoAddress {
                state: Some("Queensland".into()),
                country: Some("Australia".into()),
                iso_region_code: Some("AU-QLD".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("prospector_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn geocode_hit_miss_and_evict() {
        let storage = test_storage().await;
        assert!(storage.get_geocode("rev:1,2").await.expect("get").is_none());

        let hit = queensland_hit();
        storage.put_geocode("rev:1,2", Some(&hit)).await.expect("put hit");
        storage.put_geocode("fwd:nowhere", None).await.expect("put miss");

        let cached = storage.get_geocode("rev:1,2").await.expect("get");
        assert_eq!(cached, Some(Some(hit)));
        let miss = storage.get_geocode("fwd:nowhere").await.expect("get");
        assert_eq!(miss, Some(None));
        assert_eq!(storage.count_geocode().await.expect("count"), 2);

        assert!(storage.evict_geocode("rev:1,2").await.expect("evict"));
        assert!(!storage.evict_geocode("rev:1,2").await.expect("evict again"));
        assert_eq!(storage.evict_geocode_misses().await.expect("purge"), 1);
        assert_eq!(storage.count_geocode().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn put_geocode_overwrites() {
        let storage = test_storage().await;
        storage.put_geocode("k", None).await.expect("miss");
        storage
            .put_geocode("k", Some(&queensland_hit()))
            .await
            .expect("hit");
        let cached = storage.get_geocode("k").await.expect("get");
        assert!(matches!(cached, Some(Some(_))));
    }

    #[tokio::test]
    async fn run_history() {
        let storage = test_storage().await;
        let run_id = storage.insert_run().await.expect("insert run");
        storage
            .finish_run(&run_id, r#"{"completed": 2, "failed": 0}"#, false)
            .await
            .expect("finish run");

        let runs = storage.list_runs(10).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert!(runs[0].finished_at.is_some());
        assert!(!runs[0].cancelled);
        assert_eq!(runs[0].metrics.as_ref().and_then(|m| m["completed"].as_u64()), Some(2));

        let missing = storage.finish_run("nope", "{}", true).await;
        assert!(matches!(missing, Err(ProspectorError::NotFound(_))));
    }
}
