//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the Source Record
//! store, the Queue Item store, and per-entity trigger state (cooldown
//! timestamps and block-until).
//!
//! **Access rules:**
//! - Workers and the CLI: read-write via [`Storage::open`]. Several handles
//!   (one per worker process) may open the same file; writers wait on each
//!   other through the connection's busy timeout.
//! - Reporting: read-only via [`Storage::open_readonly`]

mod migrations;
mod queue;
mod sources;
mod triggers;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use dealflow_shared::{DealflowError, Result};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

pub use queue::ClaimResult;

/// How long a writer waits for a competing writer's lock before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database.
///
/// Every operation takes the connection lock for its whole duration, so a
/// transaction never picks up statements issued by other tasks sharing the
/// handle.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DealflowError::io(parent, e))?;
            }
        }

        let storage = Self::connect(path, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        // PRAGMA returns a row; drain it through `query`.
        let mut rows = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
            .await
            .map_err(db_err)?;
        while let Ok(Some(_)) = rows.next().await {}

        Ok(Self {
            db,
            conn: Mutex::new(conn),
            readonly,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DealflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DealflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

/// Map a libSQL error into the storage error variant.
pub(crate) fn db_err(e: libsql::Error) -> DealflowError {
    DealflowError::Storage(e.to_string())
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DealflowError::Storage(format!("invalid date '{s}': {e}")))
}

/// Read a required text column.
pub(crate) fn text(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

/// Read a nullable text column.
pub(crate) fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        Storage::open(&temp_db_path()).await.expect("open test db")
    }

    pub fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dealflow_test_{}.db", Uuid::now_v7()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db_path();
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = early + chrono::Duration::microseconds(1500);
        assert!(ts(early) < ts(later));
        assert_eq!(ts(early).len(), ts(later).len());
        assert_eq!(parse_ts(&ts(later)).unwrap(), later);
    }
}
