//! SQLite-backed ingestion engine.
//!
//! Pins [`WorkflowOrchestrator`] to the SQLite table store and run
//! repository. Both share one [`DatabasePool`], so target tables and the
//! run/audit tables live in the same database file.

use std::sync::Arc;

use ingestflow_core::ingest::client::DataSourceClient;
use ingestflow_core::ingest::orchestrator::WorkflowOrchestrator;
use ingestflow_types::config::{Dialect, EngineConfig};

use crate::sqlite::pool::DatabasePool;
use crate::sqlite::run::SqliteRunRepository;
use crate::sqlite::table_store::SqliteTableStore;

/// Orchestrator pinned to the SQLite implementations.
pub type SqliteEngine<C> = WorkflowOrchestrator<SqliteTableStore, SqliteRunRepository, C>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dialect {0:?} has no bundled store; only sqlite can be executed")]
    UnsupportedDialect(Dialect),
}

/// Build an engine over an already opened pool.
pub fn build_engine<C: DataSourceClient>(
    pool: DatabasePool,
    client: Arc<C>,
    config: EngineConfig,
) -> Result<SqliteEngine<C>, EngineError> {
    if config.dialect != Dialect::Sqlite {
        return Err(EngineError::UnsupportedDialect(config.dialect));
    }
    Ok(WorkflowOrchestrator::new(
        SqliteTableStore::new(pool.clone()),
        SqliteRunRepository::new(pool),
        client,
        config,
    ))
}

/// Open (and migrate) the database at `database_url`, then build an engine.
pub async fn open_engine<C: DataSourceClient>(
    database_url: &str,
    client: Arc<C>,
    config: EngineConfig,
) -> Result<SqliteEngine<C>, EngineError> {
    let pool = DatabasePool::connect(database_url, &config.database).await?;
    tracing::debug!(database_url, "database opened");
    build_engine(pool, client, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ingestflow_core::ingest::client::ClientError;
    use ingestflow_core::ingest::definition::parse_definition_yaml;
    use ingestflow_core::ingest::orchestrator::{SkipReason, StepOutcome};
    use ingestflow_core::repository::run::RunRepository;
    use ingestflow_types::run::{LogStatus, RunStatus};
    use ingestflow_types::schema::Record;
    use ingestflow_types::workflow::{IngestTask, WorkflowDefinition};
    use serde_json::{Value, json};
    use sqlx::Row;
    use tokio_util::sync::CancellationToken;

    use crate::fixture::FixtureClient;

    /// Fixture client that fails every request for one `ts_code`.
    struct FlakyClient {
        inner: FixtureClient,
        failing_code: &'static str,
    }

    impl DataSourceClient for FlakyClient {
        async fn invoke(&self, api_code: &str, params: &Record) -> Result<Vec<Record>, ClientError> {
            if params.get("ts_code") == Some(&json!(self.failing_code)) {
                return Err(ClientError::Request("upstream rejected the request".to_string()));
            }
            self.inner.invoke(api_code, params).await
        }
    }

    struct Harness {
        pool: DatabasePool,
        fixtures: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
            std::mem::forget(dir);
            Self {
                pool: DatabasePool::new(&url).await.unwrap(),
                fixtures: tempfile::tempdir().unwrap(),
            }
        }

        fn fixture(&self, api_code: &str, rows: Value) {
            std::fs::write(
                self.fixtures.path().join(format!("{api_code}.json")),
                rows.to_string(),
            )
            .unwrap();
        }

        fn engine(&self) -> SqliteEngine<FixtureClient> {
            let client = Arc::new(FixtureClient::new(self.fixtures.path()));
            build_engine(self.pool.clone(), client, EngineConfig::default()).unwrap()
        }

        async fn count(&self, table: &str) -> i64 {
            sqlx::query(&format!("SELECT COUNT(*) AS n FROM \"{table}\""))
                .fetch_one(&self.pool.reader)
                .await
                .unwrap()
                .get("n")
        }

        async fn close_of(&self, table: &str, ts_code: &str) -> f64 {
            sqlx::query(&format!("SELECT close FROM \"{table}\" WHERE ts_code = ?"))
                .bind(ts_code)
                .fetch_one(&self.pool.reader)
                .await
                .unwrap()
                .get("close")
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn task() -> IngestTask {
        IngestTask {
            task_id: 7,
            task_name: "nightly".to_string(),
            workflow_id: 1,
            default_table_name: None,
            task_params: Record::new(),
            download_date: "20240102".to_string(),
            config_id: None,
            output: Default::default(),
        }
    }

    const CHAINED: &str = r#"
workflow:
  id: 1
  name: daily
  steps:
    - step_name: start
      step_order: 0
      node_type: start
    - step_name: stocks
      step_order: 1
      source_api_id: 1
      write_mode: upsert
      target_table_name: stock_basic
    - step_name: quotes
      step_order: 2
      source_api_id: 2
      loop_mode: true
      write_mode: delete_insert
      unique_key_fields: [ts_code, trade_date]
      step_params:
        ts_code: { type: loop, source: stocks.ts_code }
        trade_date: today
    - step_name: end
      step_order: 3
      node_type: end
api_configs:
  - id: 1
    api_name: Stock list
    api_code: stock_basic
    primary_key_fields: [ts_code]
  - id: 2
    api_name: Daily quotes
    api_code: daily
"#;

    fn chained() -> WorkflowDefinition {
        parse_definition_yaml(CHAINED).unwrap()
    }

    fn seed_chained(h: &Harness) {
        h.fixture(
            "stock_basic",
            json!([
                {"ts_code": "000001.SZ", "name": "Ping An"},
                {"ts_code": "600000.SH", "name": "SPDB"}
            ]),
        );
        h.fixture(
            "daily",
            json!([
                {"ts_code": "000001.SZ", "trade_date": "20240102", "close": 9.4},
                {"ts_code": "600000.SH", "trade_date": "20240102", "close": 7.1},
                {"ts_code": "600000.SH", "trade_date": "20231229", "close": 7.0}
            ]),
        );
    }

    #[tokio::test]
    async fn chained_workflow_loads_both_tables() {
        let h = Harness::new().await;
        seed_chained(&h);
        let engine = h.engine();

        let report = engine
            .run_task(&chained(), &task(), today(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(report.run.progress, 100);
        assert_eq!(report.run.total_records, 4);
        assert_eq!(report.run.success_records, 4);
        assert_eq!(report.steps.len(), 4);
        assert!(matches!(report.steps[0].outcome, StepOutcome::Skipped(SkipReason::NoOp)));
        assert_eq!(report.steps[2].combinations, 2);

        assert_eq!(h.count("stock_basic").await, 2);
        // Only rows for the resolved trade_date are requested.
        assert_eq!(h.count("ingest_daily").await, 2);

        let persisted = engine.runs().get_run(&report.run.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Success);
        assert!(persisted.end_time >= persisted.start_time);
    }

    #[tokio::test]
    async fn rerunning_a_workflow_is_idempotent() {
        let h = Harness::new().await;
        seed_chained(&h);
        let engine = h.engine();
        let cancel = CancellationToken::new();

        engine.run_task(&chained(), &task(), today(), &cancel).await.unwrap();
        h.fixture(
            "daily",
            json!([
                {"ts_code": "000001.SZ", "trade_date": "20240102", "close": 9.9},
                {"ts_code": "600000.SH", "trade_date": "20240102", "close": 7.5}
            ]),
        );
        let report = engine.run_task(&chained(), &task(), today(), &cancel).await.unwrap();

        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(h.count("stock_basic").await, 2);
        assert_eq!(h.count("ingest_daily").await, 2);
        assert_eq!(h.close_of("ingest_daily", "000001.SZ").await, 9.9);
        assert_eq!(h.close_of("ingest_daily", "600000.SH").await, 7.5);
    }

    #[tokio::test]
    async fn loop_writes_one_summary_entry() {
        let h = Harness::new().await;
        seed_chained(&h);
        let engine = h.engine();

        let report = engine
            .run_task(&chained(), &task(), today(), &CancellationToken::new())
            .await
            .unwrap();
        let logs = engine.runs().list_logs(&report.run.id).await.unwrap();
        let labels: Vec<&str> = logs.iter().map(|l| l.label.as_str()).collect();

        assert_eq!(labels, vec!["nightly[stocks]", "nightly[quotes][loop summary]"]);
        let summary = &logs[1];
        assert_eq!(summary.status, LogStatus::Success);
        assert_eq!(summary.record_count, 2);
        let body: Value = serde_json::from_str(summary.error_message.as_deref().unwrap()).unwrap();
        assert_eq!(body["type"], "loop_summary");
        assert_eq!(body["total_combinations"], 2);
        assert_eq!(body["success_count"], 2);
    }

    #[tokio::test]
    async fn failing_combination_keeps_sibling_rows() {
        let h = Harness::new().await;
        seed_chained(&h);
        let client = Arc::new(FlakyClient {
            inner: FixtureClient::new(h.fixtures.path()),
            failing_code: "000001.SZ",
        });
        let engine = build_engine(h.pool.clone(), client, EngineConfig::default()).unwrap();

        let report = engine
            .run_task(&chained(), &task(), today(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.run.fail_records, 1);
        let message = report.run.error_message.as_deref().unwrap();
        assert!(message.contains("step 'quotes' failed for 1 of 2 combinations"), "{message}");
        assert!(matches!(report.steps[2].outcome, StepOutcome::Executed { failed: true }));

        // The sibling combination committed; the failed one left nothing behind.
        assert_eq!(h.count("ingest_daily").await, 1);
        assert_eq!(h.close_of("ingest_daily", "600000.SH").await, 7.1);

        let logs = engine.runs().list_logs(&report.run.id).await.unwrap();
        let failures: Vec<_> = logs.iter().filter(|l| l.status == LogStatus::Fail).collect();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].label, "nightly[quotes][combo 1]");
        assert_eq!(failures[1].label, "nightly[quotes][loop summary]");
    }

    #[tokio::test]
    async fn insert_ignore_skips_existing_rows() {
        let h = Harness::new().await;
        h.fixture(
            "trade_cal",
            json!([
                {"exchange": "SSE", "cal_date": "20240102", "is_open": 1},
                {"exchange": "SSE", "cal_date": "20240103", "is_open": 1}
            ]),
        );
        let definition = parse_definition_yaml(
            r#"
workflow:
  id: 2
  name: calendar
  steps:
    - step_name: cal
      step_order: 1
      source_api_id: 5
      write_mode: insert_ignore
      unique_key_fields: [exchange, cal_date]
api_configs:
  - id: 5
    api_name: Trading calendar
    api_code: trade_cal
"#,
        )
        .unwrap();
        let engine = h.engine();
        let cancel = CancellationToken::new();

        let first = engine.run_task(&definition, &task(), today(), &cancel).await.unwrap();
        assert_eq!(first.run.total_records, 2);

        h.fixture(
            "trade_cal",
            json!([
                {"exchange": "SSE", "cal_date": "20240103", "is_open": 0},
                {"exchange": "SSE", "cal_date": "20240104", "is_open": 1}
            ]),
        );
        let second = engine.run_task(&definition, &task(), today(), &cancel).await.unwrap();

        assert_eq!(second.run.status, RunStatus::Success);
        assert_eq!(second.run.total_records, 1);
        assert_eq!(h.count("ingest_trade_cal").await, 3);
        let is_open: i64 = sqlx::query("SELECT is_open FROM ingest_trade_cal WHERE cal_date = '20240103'")
            .fetch_one(&h.pool.reader)
            .await
            .unwrap()
            .get("is_open");
        assert_eq!(is_open, 1);
    }

    #[tokio::test]
    async fn previous_step_placeholder_follows_last_step() {
        let h = Harness::new().await;
        h.fixture("index_basic", json!([{"index_code": "000300.SH"}, {"index_code": "000905.SH"}]));
        h.fixture(
            "index_weight",
            json!([
                {"index_code": "000300.SH", "con_code": "600519.SH", "weight": 5.1},
                {"index_code": "000905.SH", "con_code": "002049.SZ", "weight": 0.6}
            ]),
        );
        let definition = parse_definition_yaml(
            r#"
workflow:
  id: 3
  name: weights
  steps:
    - step_name: indexes
      step_order: 1
      source_api_id: 1
    - step_name: weights
      step_order: 2
      source_api_id: 2
      loop_mode: true
      step_params:
        index_code: { type: loop, source: previous_step.index_code }
api_configs:
  - id: 1
    api_name: Index list
    api_code: index_basic
  - id: 2
    api_name: Index weights
    api_code: index_weight
"#,
        )
        .unwrap();
        let engine = h.engine();

        let report = engine
            .run_task(&definition, &task(), today(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(report.steps[1].combinations, 2);
        assert_eq!(h.count("ingest_index_weight").await, 2);
    }

    const CALENDAR: &str = r#"
workflow:
  id: 2
  name: calendar
  steps:
    - step_name: cal
      step_order: 1
      source_api_id: 5
      write_mode: upsert
      unique_key_fields: [id]
api_configs:
  - id: 5
    api_name: Trading calendar
    api_code: trade_cal
    default_write_mode: upsert
  - id: 6
    api_name: Stock list
    api_code: stock_basic
    primary_key_fields: [ts_code]
    default_write_mode: upsert
"#;

    async fn table_exists(h: &Harness, table: &str) -> bool {
        sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&h.pool.reader)
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn upsert_with_null_keys_is_idempotent() {
        let h = Harness::new().await;
        h.fixture("trade_cal", json!([{"id": null, "val": "x"}, {"id": 1, "val": "y"}]));
        let definition = parse_definition_yaml(CALENDAR).unwrap();
        let engine = h.engine();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let report = engine.run_task(&definition, &task(), today(), &cancel).await.unwrap();
            assert_eq!(report.run.status, RunStatus::Success);
            assert_eq!(h.count("ingest_trade_cal").await, 2);
        }
    }

    #[tokio::test]
    async fn task_with_config_id_downloads_one_api() {
        let h = Harness::new().await;
        h.fixture("trade_cal", json!([{"id": 1, "val": "x"}]));
        h.fixture("stock_basic", json!([{"ts_code": "000001.SZ"}, {"ts_code": "600000.SH"}]));
        let definition = parse_definition_yaml(CALENDAR).unwrap();
        let mut task = task();
        task.config_id = Some(6);

        let engine = h.engine();
        let cancel = CancellationToken::new();
        let report = engine.run(&definition, &task, today(), &cancel).await.unwrap();

        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(report.run.total_records, 2);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].step_name, "stock_basic");
        assert_eq!(h.count("ingest_stock_basic").await, 2);
        assert!(!table_exists(&h, "ingest_trade_cal").await);

        let report = engine.run(&definition, &task, today(), &cancel).await.unwrap();
        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(h.count("ingest_stock_basic").await, 2);
    }

    #[tokio::test]
    async fn batches_are_exported_next_to_the_database_write() {
        let h = Harness::new().await;
        h.fixture("trade_cal", json!([{"id": 1, "val": "x"}, {"id": 2, "val": "y"}]));
        let definition = parse_definition_yaml(CALENDAR).unwrap();
        let exports = tempfile::tempdir().unwrap();
        let mut task = task();
        task.output.save_path = Some(exports.path().join("out"));

        let engine = h.engine();
        let report = engine
            .run(&definition, &task, today(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(h.count("ingest_trade_cal").await, 2);

        let logs = engine.runs().list_logs(&report.run.id).await.unwrap();
        let path = std::path::PathBuf::from(logs[0].file_path.as_deref().unwrap());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("trade_cal_1_20240102_"), "{name}");
        assert!(name.ends_with(".csv"), "{name}");
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.trim_start_matches('\u{feff}').starts_with("id,val"));
    }

    #[tokio::test]
    async fn export_only_task_leaves_database_untouched() {
        let h = Harness::new().await;
        h.fixture("stock_basic", json!([{"ts_code": "000001.SZ"}, {"ts_code": "600000.SH"}]));
        let definition = parse_definition_yaml(CALENDAR).unwrap();
        let exports = tempfile::tempdir().unwrap();
        let mut task = task();
        task.config_id = Some(6);
        task.output.save_to_db = false;
        task.output.save_path = Some(exports.path().to_path_buf());
        task.output.save_format = ingestflow_types::workflow::SaveFormat::Json;

        let engine = h.engine();
        let report = engine
            .run(&definition, &task, today(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(report.run.total_records, 2);
        assert!(!table_exists(&h, "ingest_stock_basic").await);
        let logs = engine.runs().list_logs(&report.run.id).await.unwrap();
        let exported: Value =
            serde_json::from_slice(&std::fs::read(logs[0].file_path.as_deref().unwrap()).unwrap()).unwrap();
        assert_eq!(exported.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_sqlite_dialect_is_rejected() {
        let h = Harness::new().await;
        let config = EngineConfig {
            dialect: Dialect::Postgres,
            ..EngineConfig::default()
        };
        let client = Arc::new(FixtureClient::new(h.fixtures.path()));
        let err = build_engine(h.pool.clone(), client, config).err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedDialect(Dialect::Postgres)));
    }
}
