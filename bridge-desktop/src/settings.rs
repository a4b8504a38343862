//! Settings Storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SettingsStore,
};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePool, Row};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, error};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        value_type TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

/// SQLite-backed settings store implementation
///
/// Every value is stored as text together with its type tag. The queue
/// documents are large JSON strings written under a single key each, so an
/// upsert replaces the whole document atomically.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    /// Create a new settings store with the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // SQLite URLs use forward slashes on every platform
        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid DB path: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        Self::create_table(&pool).await?;
        debug!(path = ?db_path, "Initialized settings store");

        Ok(Self { pool })
    }

    /// Create an in-memory settings store (for testing)
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to connect to DB: {}", e)))?;

        Self::create_table(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_table(pool: &SqlitePool) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    /// Set a value with type information
    async fn set_value(&self, key: &str, value: &str, value_type: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, value_type, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(value_type)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Failed to set setting: {}", e)))?;

        debug!(key = key, value_type = value_type, "Stored setting");
        Ok(())
    }

    /// Get a value and verify its type
    async fn get_value(&self, key: &str, expected_type: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, value_type FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to get setting: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: String = row.get(0);
        let value_type: String = row.get(1);

        if value_type != expected_type {
            error!(
                key = key,
                expected = expected_type,
                actual = %value_type,
                "Type mismatch"
            );
            return Err(BridgeError::OperationFailed(format!(
                "Type mismatch: expected {}, got {}",
                expected_type, value_type
            )));
        }

        Ok(Some(value))
    }

    async fn get_parsed<T>(&self, key: &str, expected_type: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_value(key, expected_type).await? {
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e| BridgeError::OperationFailed(format!("Parse error: {}", e))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set_value(key, value, "string").await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get_value(key, "string").await
    }

    async fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_value(key, &value.to_string(), "bool").await
    }

    async fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get_parsed(key, "bool").await
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set_value(key, &value.to_string(), "i64").await
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.get_parsed(key, "i64").await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::OperationFailed(format!("Failed to delete setting: {}", e))
            })?;

        debug!(key = key, "Deleted setting");
        Ok(())
    }

    async fn has_key(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to check key: {}", e)))?;

        Ok(row.is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM settings ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to list keys: {}", e)))?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}
