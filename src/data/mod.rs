//! Storage layer: repository traits and both backends.

pub mod repository {
    pub use crate::repository::*;
}

pub mod json_store {
    pub use crate::json_store::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}

use crate::config::Config;
use crate::db::Database;
use crate::db_storage::PgStore;
use crate::json_store::JsonStore;
use crate::repository::Repositories;
use std::sync::Arc;

/// Open the configured backend: PostgreSQL when a database URL is set,
/// JSON files under `data_dir` otherwise.
pub async fn open_repositories(config: &Config) -> anyhow::Result<Repositories> {
    match &config.database_url {
        Some(url) => {
            let db = Database::new(url).await?;
            db.ensure_schema().await?;
            tracing::info!("Database connection pool established");
            Ok(Repositories::from_store(Arc::new(PgStore::new(db.pool))))
        }
        None => {
            tokio::fs::create_dir_all(&config.data_dir).await?;
            tracing::info!("Using JSON store in {}", config.data_dir.display());
            Ok(Repositories::from_store(Arc::new(JsonStore::new(
                &config.data_dir,
            ))))
        }
    }
}
