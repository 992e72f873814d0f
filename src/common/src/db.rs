//! Database connection and schema helpers.

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;

use crate::Config;

/// Pipeline schema. Every statement is idempotent.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_pipeline.sql");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Query failed: {0}")]
    QueryError(String),
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database connection is healthy.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the pipeline tables and constraints if they are missing.
    pub async fn apply_schema(&self) -> Result<(), DbError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::QueryError(format!("schema: {}", e)))?;
        info!("Schema applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_uniqueness_keys() {
        assert!(SCHEMA_SQL.contains("UNIQUE (item_id, source_id, snapshot_time)"));
        assert!(SCHEMA_SQL.contains("PRIMARY KEY (item_id, metric_date)"));
        assert!(SCHEMA_SQL.contains("PRIMARY KEY (item_id, signal_date, signal_type)"));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_db_connection() {
        dotenvy::dotenv().ok();
        let config = Config::from_env().expect("Config should load");

        let db = Database::connect(&config).await;
        assert!(db.is_ok(), "Should connect to database");

        let db = db.unwrap();
        assert!(db.health_check().await.is_ok(), "Health check should pass");
        assert!(db.apply_schema().await.is_ok(), "Schema should apply twice");
        assert!(db.apply_schema().await.is_ok(), "Schema should apply twice");
    }
}
