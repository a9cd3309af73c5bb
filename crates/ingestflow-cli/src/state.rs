//! Application state shared by the CLI commands.
//!
//! Holds the data directory, the opened database pool and the engine
//! configuration loaded from `config.toml`.

use std::path::PathBuf;

use anyhow::Context;
use ingestflow_infra::config::load_engine_config;
use ingestflow_infra::sqlite::pool::{DatabasePool, data_dir, default_database_url};
use ingestflow_infra::sqlite::run::SqliteRunRepository;
use ingestflow_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    pub config: EngineConfig,
}

impl AppState {
    /// Resolve the data directory, load the config and open the database.
    pub async fn init(database_url: Option<&str>) -> anyhow::Result<Self> {
        let data_dir = data_dir();

        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url
            .map(str::to_string)
            .unwrap_or_else(default_database_url);
        let db_pool = DatabasePool::connect(&db_url, &config.database)
            .await
            .with_context(|| format!("Failed to open database {db_url}"))?;
        tracing::debug!(data_dir = %data_dir.display(), database = %db_url, "application state ready");

        Ok(Self {
            data_dir,
            db_pool,
            config,
        })
    }

    pub fn run_repository(&self) -> SqliteRunRepository {
        SqliteRunRepository::new(self.db_pool.clone())
    }

    /// Default directory the fixture client reads from.
    pub fn fixtures_dir(&self) -> PathBuf {
        self.data_dir.join("fixtures")
    }
}
