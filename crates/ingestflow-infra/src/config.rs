//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.ingestflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use ingestflow_types::config::EngineConfig;

/// Smallest accepted client timeout.
const MIN_CLIENT_TIMEOUT_SECS: u64 = 1;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with out-of-range values clamped.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

fn normalize(mut config: EngineConfig) -> EngineConfig {
    config.client_timeout_secs = config.client_timeout_secs.max(MIN_CLIENT_TIMEOUT_SECS);
    if config.run_timeout_secs == Some(0) {
        config.run_timeout_secs = None;
    }
    config.text_column_length = config.text_column_length.max(1);
    config.database.reader_connections = config.database.reader_connections.max(1);
    config.database.writer_acquire_timeout_secs = config.database.writer_acquire_timeout_secs.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestflow_types::config::Dialect;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.client_timeout_secs, 60);
        assert_eq!(config.dialect, Dialect::Sqlite);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
client_timeout_secs = 5
run_timeout_secs = 120
loop_summary_detail_limit = 2
halt_on_step_failure = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.client_timeout_secs, 5);
        assert_eq!(config.run_timeout_secs, Some(120));
        assert_eq!(config.loop_summary_detail_limit, 2);
        assert!(config.halt_on_step_failure);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_error_message_len, 5000);
        assert!(!config.halt_on_step_failure);
    }

    #[tokio::test]
    async fn load_engine_config_clamps_zero_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "client_timeout_secs = 0\nrun_timeout_secs = 0\n[database]\nreader_connections = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.client_timeout_secs, 1);
        assert!(config.run_timeout_secs.is_none());
        assert_eq!(config.database.reader_connections, 1);
    }
}
