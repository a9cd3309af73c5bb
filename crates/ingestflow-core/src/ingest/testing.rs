//! In-memory doubles shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use ingestflow_types::error::{RepositoryError, StoreError};
use ingestflow_types::run::{DownloadLog, DownloadRun};
use ingestflow_types::schema::{Record, TableSpec};
use serde_json::Value;
use uuid::Uuid;

use super::client::{ClientError, DataSourceClient};
use crate::repository::run::RunRepository;
use crate::repository::table::{
    ConflictAction, Savepoint, TableStore, TableTransaction, UniqueKeySet, WriteBatch,
};

#[derive(Default)]
pub struct MemoryRuns {
    pub runs: Mutex<Vec<DownloadRun>>,
    pub logs: Mutex<Vec<DownloadLog>>,
}

impl RunRepository for MemoryRuns {
    async fn create_run(&self, run: &DownloadRun) -> Result<(), RepositoryError> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &DownloadRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.lock().unwrap();
        let slot = runs.iter_mut().find(|r| r.id == run.id).ok_or(RepositoryError::NotFound)?;
        *slot = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<DownloadRun>, RepositoryError> {
        Ok(self.runs.lock().unwrap().iter().find(|r| &r.id == id).cloned())
    }

    async fn list_runs(&self, task_id: Option<i64>, limit: u32) -> Result<Vec<DownloadRun>, RepositoryError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|r| task_id.is_none_or(|t| r.task_id == t))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn append_logs(&self, logs: &[DownloadLog]) -> Result<(), RepositoryError> {
        self.logs.lock().unwrap().extend_from_slice(logs);
        Ok(())
    }

    async fn list_logs(&self, run_id: &Uuid) -> Result<Vec<DownloadLog>, RepositoryError> {
        Ok(self.logs.lock().unwrap().iter().filter(|l| &l.run_id == run_id).cloned().collect())
    }
}

/// Client answering from canned responses; unknown api codes return no rows.
#[derive(Default)]
pub struct ScriptedClient {
    pub responses: HashMap<String, Vec<Record>>,
    pub failing: HashSet<String>,
    pub calls: Mutex<Vec<(String, Record)>>,
}

impl ScriptedClient {
    pub fn respond(mut self, api_code: &str, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        self.responses.insert(api_code.to_string(), rows);
        self
    }

    pub fn fail(mut self, api_code: &str) -> Self {
        self.failing.insert(api_code.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl DataSourceClient for ScriptedClient {
    async fn invoke(&self, api_code: &str, params: &Record) -> Result<Vec<Record>, ClientError> {
        self.calls.lock().unwrap().push((api_code.to_string(), params.clone()));
        if self.failing.contains(api_code) {
            return Err(ClientError::Request(format!("{api_code} is unavailable")));
        }
        Ok(self.responses.get(api_code).cloned().unwrap_or_default())
    }
}

/// A store whose database can never be reached.
pub struct UnreachableStore;

pub enum NoTx {}

impl TableStore for UnreachableStore {
    type Tx = NoTx;

    async fn begin(&self) -> Result<NoTx, StoreError> {
        Err(StoreError::Connection("database is unreachable".to_string()))
    }
}

impl TableTransaction for NoTx {
    async fn savepoint(&mut self) -> Result<Savepoint, StoreError> {
        match *self {}
    }

    async fn release_savepoint(&mut self, _savepoint: Savepoint) -> Result<(), StoreError> {
        match *self {}
    }

    async fn rollback_to_savepoint(&mut self, _savepoint: Savepoint) -> Result<(), StoreError> {
        match *self {}
    }

    async fn commit(self) -> Result<(), StoreError> {
        match self {}
    }

    async fn rollback(self) -> Result<(), StoreError> {
        match self {}
    }

    async fn table_exists(&mut self, _table: &str) -> Result<bool, StoreError> {
        match *self {}
    }

    async fn table_columns(&mut self, _table: &str) -> Result<Vec<String>, StoreError> {
        match *self {}
    }

    async fn unique_key_sets(&mut self, _table: &str) -> Result<Vec<UniqueKeySet>, StoreError> {
        match *self {}
    }

    async fn create_table(&mut self, _spec: &TableSpec) -> Result<(), StoreError> {
        match *self {}
    }

    async fn create_unique_index(
        &mut self,
        _table: &str,
        _index_name: &str,
        _columns: &[String],
    ) -> Result<(), StoreError> {
        match *self {}
    }

    async fn insert_rows(
        &mut self,
        _table: &str,
        _batch: &WriteBatch,
        _conflict: &ConflictAction,
    ) -> Result<u64, StoreError> {
        match *self {}
    }

    async fn delete_by_keys(
        &mut self,
        _table: &str,
        _key_fields: &[String],
        _keys: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        match *self {}
    }
}
