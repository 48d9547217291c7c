pub mod queries;
pub mod schema;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::LedgerResult;

pub use queries::Queries;

/// Handle on the chain store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Database { pool })
    }

    /// Private in-memory database with the schema applied.
    ///
    /// A single connection is kept open for the pool's lifetime; SQLite
    /// gives every `:memory:` connection its own database.
    pub async fn new_in_memory() -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let database = Database { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::raw_sql(schema::AUDIT_RECORDS_SCHEMA)
            .execute(&self.pool)
            .await?;
        info!("Audit ledger schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
