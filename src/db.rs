use crate::models::{ActivityRecord, StoredActivity};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Durable append-only sink for activity records.
pub trait ActivityStore: Send + Sync {
    /// Appends `record` to `collection` and returns the new record id.
    fn add(&self, collection: &str, record: &ActivityRecord) -> Result<i64, StoreError>;
}

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Opens (or creates) the SQLite database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager)?;
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS activity_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            category TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_records_collection
            ON activity_records (collection, id);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Retrieves the last `limit` records of a collection, newest first.
    pub fn last_records(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<StoredActivity>, StoreError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, category, timestamp FROM activity_records
             WHERE collection = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![collection, limit as i64], |row| {
            Ok(StoredActivity {
                id: row.get(0)?,
                category: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }

    pub fn last_record(&self, collection: &str) -> Result<Option<StoredActivity>, StoreError> {
        Ok(self.last_records(collection, 1)?.into_iter().next())
    }
}

impl ActivityStore for DatabaseService {
    fn add(&self, collection: &str, record: &ActivityRecord) -> Result<i64, StoreError> {
        let timestamp = record.timestamp.format(&Rfc3339)?;
        let conn = self.pool.get()?;

        conn.execute(
            "INSERT INTO activity_records (collection, category, timestamp) VALUES (?1, ?2, ?3)",
            params![collection, record.category, timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
