//! ClickHouse backend over its HTTP interface.
//!
//! One `ReplacingMergeTree` table per target, ordered by `event_id`, so a
//! re-inserted id replaces the previous row at merge time and `FINAL`
//! reads see only the latest. That makes `Overwrite` the only conflict
//! policy the engine can express.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};

use crate::backend::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, OnConflict,
    StoredRecord, TargetStream, Writable,
};
use crate::error::{Result, StoreError};
use crate::settings::ClickHouseSettings;
use crate::translate::clickhouse::{self, format_datetime};

const NAME: &str = "clickhouse";

/// A row as written with `FORMAT JSONEachRow`.
#[derive(Serialize)]
struct InsertRow<'a> {
    event_id: String,
    emission_time: String,
    authority: String,
    verb_id: &'a str,
    event: String,
}

#[derive(Deserialize)]
struct EventRow {
    event: String,
}

#[derive(Deserialize)]
struct NameRow {
    name: String,
}

pub struct ClickHouseBackend {
    client: Client,
    settings: ClickHouseSettings,
    profile: BackendProfile,
    known_tables: Mutex<HashSet<Target>>,
}

impl ClickHouseBackend {
    pub fn new(settings: &ClickHouseSettings) -> Result<Self> {
        let profile = settings.profile();
        let client = Client::builder()
            .timeout(profile.timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("clickhouse client: {e}")))?;
        Ok(Self {
            client,
            settings: settings.clone(),
            profile,
            known_tables: Mutex::new(HashSet::new()),
        })
    }

    fn table(&self, target: &Target) -> String {
        format!("`{}`.`{}`", self.settings.database, target)
    }

    fn request(&self, sql: String, params: &BTreeMap<String, String>) -> RequestBuilder {
        let mut query: Vec<(String, &str)> = vec![("database".into(), &self.settings.database)];
        query.extend(params.iter().map(|(k, v)| (format!("param_{k}"), v.as_str())));
        let builder = self
            .client
            .post(self.settings.url.trim_end_matches('/'))
            .query(&query)
            .body(sql);
        match &self.settings.username {
            Some(username) => builder.basic_auth(username, self.settings.password.as_ref()),
            None => builder,
        }
    }

    /// Run a statement and return the response body.
    async fn execute(&self, builder: RequestBuilder, operation: &'static str) -> Result<String> {
        let timeout = self.profile.timeout;
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::from_http(NAME, operation, timeout, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::from_http(NAME, operation, timeout, e))?;
        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(StoreError::Unavailable {
                backend: NAME.to_string(),
                reason: format!("{operation}: HTTP {status}"),
            });
        }
        Err(StoreError::Rejected {
            backend: NAME.to_string(),
            reason: format!("{operation}: HTTP {status}: {}", body.trim()),
        })
    }

    /// Run a read, treating a missing table as an empty target.
    async fn select_events(
        &self,
        sql: String,
        params: &BTreeMap<String, String>,
        operation: &'static str,
    ) -> Result<Vec<StoredRecord>> {
        let body = match self.execute(self.request(sql, params), operation).await {
            Ok(body) => body,
            Err(StoreError::Rejected { reason, .. }) if reason.contains("UNKNOWN_TABLE") => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let row: EventRow = serde_json::from_str(line)?;
                StoredRecord::from_json(&row.event)
            })
            .collect()
    }

    async fn ensure_table(&self, target: &Target) -> Result<()> {
        if self
            .known_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(target)
        {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                event_id String, \
                emission_time DateTime64(9, 'UTC'), \
                authority String, \
                verb_id String, \
                event String, \
                stored_at DateTime64(6, 'UTC') DEFAULT now64(6)\
             ) ENGINE = ReplacingMergeTree ORDER BY event_id",
            self.table(target)
        );
        self.execute(self.request(sql, &BTreeMap::new()), "create table")
            .await?;
        debug!(table = %self.table(target), "ensured table");
        self.known_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.clone());
        Ok(())
    }
}

/// Render ids as a ClickHouse `Array(String)` parameter value.
fn array_param(ids: &[IdentityKey]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{id}'")).collect();
    format!("[{}]", quoted.join(","))
}

#[async_trait]
impl DataBackend for ClickHouseBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, _target: &Target) -> BackendStatus {
        match self
            .execute(self.request("SELECT 1".to_string(), &BTreeMap::new()), "status")
            .await
        {
            Ok(_) => BackendStatus::Ok,
            Err(e) => {
                debug!(error = %e, "clickhouse status check failed");
                BackendStatus::Unreachable
            }
        }
    }

    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> Result<Vec<StoredRecord>> {
        let native = clickhouse::lower(query, size);
        let sql = format!(
            "SELECT event FROM {} FINAL WHERE {} ORDER BY {} LIMIT {} FORMAT JSONEachRow",
            self.table(target),
            native.where_clause,
            native.order_by,
            native.limit
        );
        self.select_events(sql, &native.params, "read").await
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.settings.ids_chunk_size.max(1)) {
            let sql = format!(
                "SELECT event FROM {} FINAL WHERE event_id IN {{ids:Array(String)}} FORMAT JSONEachRow",
                self.table(target)
            );
            let params = BTreeMap::from([("ids".to_string(), array_param(chunk))]);
            records.extend(self.select_events(sql, &params, "read by ids").await?);
        }
        Ok(records)
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }
}

#[async_trait]
impl Writable for ClickHouseBackend {
    fn supports(&self, policy: OnConflict) -> bool {
        policy == OnConflict::Overwrite
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        if !self.supports(policy) {
            return Err(StoreError::UnsupportedConflictPolicy {
                backend: NAME.to_string(),
                policy,
            });
        }
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut keys = HashSet::with_capacity(batch.len());
        let mut body = String::new();
        for statement in batch {
            let record = StoredRecord::from_statement(statement.clone())?;
            if !keys.insert(record.key) {
                return Err(StoreError::BatchRejected {
                    keys: batch.iter().filter_map(Statement::id).collect(),
                    reason: format!("duplicate id {} in batch", record.key),
                });
            }
            let row = InsertRow {
                event_id: record.key.to_string(),
                emission_time: format_datetime(&record.timestamp),
                authority: statement
                    .authority()
                    .map(|a| a.canonical())
                    .unwrap_or_default(),
                verb_id: statement.verb_id().unwrap_or_default(),
                event: serde_json::to_string(statement)?,
            };
            body.push_str(&serde_json::to_string(&row)?);
            body.push('\n');
        }

        self.ensure_table(target).await?;
        let sql = format!(
            "INSERT INTO {} (event_id, emission_time, authority, verb_id, event) \
             SETTINGS async_insert = 1, wait_for_async_insert = 1 FORMAT JSONEachRow\n{body}",
            self.table(target)
        );
        self.execute(self.request(sql, &BTreeMap::new()), "write")
            .await?;
        Ok(BatchOutcome {
            written: batch.len(),
            skipped: 0,
        })
    }
}

#[async_trait]
impl Listable for ClickHouseBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        let params = BTreeMap::from([
            ("db".to_string(), self.settings.database.clone()),
            ("prefix".to_string(), prefix.unwrap_or_default().to_string()),
        ]);
        let sql = "SELECT name FROM system.tables \
                   WHERE database = {db:String} AND startsWith(name, {prefix:String}) \
                   ORDER BY name FORMAT JSONEachRow"
            .to_string();
        let body = self.execute(self.request(sql, &params), "list").await?;

        let names = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<NameRow>(line).map(|row| row.name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let targets = names
            .into_iter()
            .filter_map(|name| Target::new(name).ok())
            .map(Ok);
        Ok(stream::iter(targets).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_param() {
        let a = IdentityKey::parse("3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f").unwrap();
        assert_eq!(array_param(&[a]), "['3b6d3c4e-5f1a-4c8b-9d2e-7a6b5c4d3e2f']");
    }

    #[test]
    fn test_only_overwrite_supported() {
        let backend = ClickHouseBackend::new(&ClickHouseSettings::default()).unwrap();
        assert!(backend.supports(OnConflict::Overwrite));
        assert!(!backend.supports(OnConflict::Ignore));
        assert!(!backend.supports(OnConflict::Fail));
    }

    #[test]
    fn test_table_is_quoted() {
        let backend = ClickHouseBackend::new(&ClickHouseSettings::default()).unwrap();
        let target = Target::new("tenant-a.events").unwrap();
        assert_eq!(backend.table(&target), "`xapi`.`tenant-a.events`");
    }
}
