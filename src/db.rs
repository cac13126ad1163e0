use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};

/// Handle to the relational assignment store.
///
/// Cloning is cheap — clones share the same underlying pool.
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: Pool<MySql>,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to MySQL database")?;

        Ok(Self { pool })
    }
}
