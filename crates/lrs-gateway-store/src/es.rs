//! Elasticsearch backend over its HTTP API.
//!
//! One index per target, documents indexed under the statement id. Reads
//! go through `_search` with `search_after` paging inside a point in time,
//! writes through `_bulk`.
//!
//! Each record read carries `{"pit": <id>, "sort": [...]}` as its native
//! position, so the next chunk of the same stream searches the same
//! snapshot. An expired point in time is reopened and paging resumes from
//! the sort values.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target, ValidationError};

use crate::backend::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, OnConflict,
    StoredRecord, TargetStream, Writable,
};
use crate::error::{Result, StoreError};
use crate::settings::EsSettings;
use crate::translate::es;

const NAME: &str = "es";

/// Mapping applied to indices this backend creates.
fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "timestamp": { "type": "date_nanos" },
                "stored": { "type": "date_nanos" }
            }
        }
    })
}

pub struct EsBackend {
    client: Client,
    base_url: String,
    settings: EsSettings,
    profile: BackendProfile,
    /// Indices known to exist.
    known_indices: Mutex<HashSet<Target>>,
}

impl EsBackend {
    pub fn new(settings: &EsSettings) -> Result<Self> {
        let profile = settings.profile();
        let client = Client::builder()
            .timeout(profile.timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("es client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.hosts.trim_end_matches('/').to_string(),
            settings: settings.clone(),
            profile,
            known_indices: Mutex::new(HashSet::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.settings.username {
            Some(username) => builder.basic_auth(username, self.settings.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, operation: &'static str) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| StoreError::from_http(NAME, operation, self.profile.timeout, e))
    }

    /// Decode a JSON body, turning error statuses into store errors.
    async fn json(&self, response: Response, operation: &'static str) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| StoreError::from_http(NAME, operation, self.profile.timeout, e));
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, operation, body))
    }

    /// Open a point in time on `index`; `None` when the index does not exist.
    async fn open_pit(&self, index: &str) -> Result<Option<String>> {
        let response = self
            .send(
                self.request(Method::POST, &format!("/{index}/_pit"))
                    .query(&[("keep_alive", &self.settings.point_in_time_keep_alive)]),
                "open point in time",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.json(response, "open point in time").await?;
        match body.get("id").and_then(Value::as_str) {
            Some(id) => Ok(Some(id.to_string())),
            None => Err(StoreError::InvalidData("point in time response without id".into())),
        }
    }

    /// Search inside a point in time; `None` when it has expired.
    async fn search_pit(&self, query: &ReadQuery, size: usize, pit: &str) -> Result<Option<Value>> {
        let mut body = es::lower(query, size);
        body["pit"] = json!({
            "id": pit,
            "keep_alive": self.settings.point_in_time_keep_alive,
        });
        let response = self
            .send(self.request(Method::POST, "/_search").json(&body), "read")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.json(response, "read").await.map(Some)
    }

    async fn close_pit(&self, pit: &str) {
        let closed = match self
            .send(
                self.request(Method::DELETE, "/_pit").json(&json!({ "id": pit })),
                "close point in time",
            )
            .await
        {
            Ok(response) => self.json(response, "close point in time").await.map(drop),
            Err(e) => Err(e),
        };
        // The keep-alive reclaims it anyway.
        if let Err(e) = closed {
            debug!(error = %e, "point in time not closed");
        }
    }

    async fn ensure_index(&self, target: &Target) -> Result<()> {
        let index = index_name(target)?;
        if self
            .known_indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(target)
        {
            return Ok(());
        }

        let response = self
            .send(
                self.request(Method::PUT, &format!("/{index}")).json(&index_mapping()),
                "create index",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if !body.contains("resource_already_exists_exception") {
                return Err(status_error(status, "create index", body));
            }
        } else {
            debug!(index = %target, "created index");
        }

        self.known_indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.clone());
        Ok(())
    }
}

/// Index name for a target. Elasticsearch refuses uppercase names and
/// names starting with `_`.
fn index_name(target: &Target) -> Result<&str> {
    let name = target.as_str();
    if !name.starts_with('_') && !name.chars().any(|c| c.is_ascii_uppercase()) {
        Ok(name)
    } else {
        Err(ValidationError::InvalidTarget(name.to_string()).into())
    }
}

/// Point in time id carried by a resume position.
fn cursor_pit(query: &ReadQuery) -> Option<String> {
    query
        .after
        .as_ref()?
        .native
        .as_ref()?
        .get("pit")?
        .as_str()
        .map(str::to_string)
}

fn status_error(status: StatusCode, operation: &str, body: String) -> StoreError {
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
        StoreError::Unavailable {
            backend: NAME.to_string(),
            reason: format!("{operation}: HTTP {status}"),
        }
    } else {
        StoreError::Rejected {
            backend: NAME.to_string(),
            reason: format!("{operation}: HTTP {status}: {body}"),
        }
    }
}

fn record_from_source(source: Value, sort: Option<Value>) -> Result<StoredRecord> {
    Ok(StoredRecord::from_statement(Statement::from_value(source)?)?.with_native(sort))
}

#[async_trait]
impl DataBackend for EsBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, _target: &Target) -> BackendStatus {
        let health = match self
            .send(self.request(Method::GET, "/_cluster/health"), "status")
            .await
        {
            Ok(response) => self.json(response, "status").await,
            Err(e) => Err(e),
        };
        match health {
            Ok(body) => match body.get("status").and_then(Value::as_str) {
                Some("green") => BackendStatus::Ok,
                Some("yellow") => BackendStatus::Degraded,
                other => {
                    warn!(status = ?other, "elasticsearch cluster is not healthy");
                    BackendStatus::Unreachable
                }
            },
            Err(e) => {
                warn!(error = %e, "elasticsearch status check failed");
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
        let index = index_name(target)?;
        let reused = cursor_pit(query);
        let mut pit = match &reused {
            Some(pit) => pit.clone(),
            None => match self.open_pit(index).await? {
                Some(pit) => pit,
                None => return Ok(Vec::new()),
            },
        };

        let mut result = self.search_pit(query, size, &pit).await?;
        if result.is_none() && reused.is_some() {
            debug!(index = %target, "point in time expired, reopening");
            pit = match self.open_pit(index).await? {
                Some(pit) => pit,
                None => return Ok(Vec::new()),
            };
            result = self.search_pit(query, size, &pit).await?;
        }
        let mut result = result.ok_or_else(|| {
            StoreError::InvalidData("point in time missing right after opening".into())
        })?;
        // The id may change between searches.
        let pit = result
            .get("pit_id")
            .and_then(Value::as_str)
            .map_or(pit, str::to_string);

        let hits = match result.pointer_mut("/hits/hits").map(Value::take) {
            Some(Value::Array(hits)) => hits,
            _ => return Err(StoreError::InvalidData("search response without hits".into())),
        };
        if hits.len() < size {
            self.close_pit(&pit).await;
        }
        hits.into_iter()
            .map(|mut hit| {
                let sort = hit.get_mut("sort").map(Value::take);
                let native = sort.map(|sort| json!({ "pit": pit, "sort": sort }));
                let source = hit.get_mut("_source").map(Value::take).unwrap_or_default();
                record_from_source(source, native)
            })
            .collect()
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let index = index_name(target)?;
        let ids: Vec<String> = ids.iter().map(IdentityKey::to_string).collect();
        let response = self
            .send(
                self.request(Method::POST, &format!("/{index}/_mget"))
                    .json(&json!({ "ids": ids })),
                "read by ids",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let mut result = self.json(response, "read by ids").await?;

        let docs = match result.get_mut("docs").map(Value::take) {
            Some(Value::Array(docs)) => docs,
            _ => return Ok(Vec::new()),
        };
        docs.into_iter()
            .filter(|doc| doc["found"].as_bool() == Some(true))
            .map(|mut doc| {
                let source = doc.get_mut("_source").map(Value::take).unwrap_or_default();
                record_from_source(source, None)
            })
            .collect()
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }
}

#[async_trait]
impl Writable for EsBackend {
    fn supports(&self, _policy: OnConflict) -> bool {
        true
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        let index = index_name(target)?;
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        self.ensure_index(target).await?;

        let action = match policy {
            OnConflict::Overwrite => "index",
            OnConflict::Fail | OnConflict::Ignore => "create",
        };
        let mut keys = Vec::with_capacity(batch.len());
        let mut ndjson = String::new();
        for statement in batch {
            let key = statement.require_id()?;
            let mut header = serde_json::Map::new();
            header.insert(
                action.to_string(),
                json!({ "_index": index, "_id": key.to_string() }),
            );
            ndjson.push_str(&Value::Object(header).to_string());
            ndjson.push('\n');
            ndjson.push_str(&serde_json::to_string(statement)?);
            ndjson.push('\n');
            keys.push(key);
        }

        let mut request = self
            .request(Method::POST, "/_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(ndjson);
        if let Some(refresh) = &self.settings.refresh {
            request = request.query(&[("refresh", refresh)]);
        }
        let response = self.send(request, "write").await?;
        let result = self.json(response, "write").await?;

        let items = result["items"].as_array().cloned().unwrap_or_default();
        let mut outcome = BatchOutcome::default();
        let mut rejected = Vec::new();
        let mut reason = None;
        for (key, item) in keys.iter().zip(items.iter()) {
            let status = item[action]["status"].as_u64().unwrap_or(500);
            match status {
                200..=299 => outcome.written += 1,
                409 if policy == OnConflict::Ignore => outcome.skipped += 1,
                _ => {
                    rejected.push(*key);
                    reason.get_or_insert_with(|| item[action]["error"].to_string());
                }
            }
        }
        // Items missing from the response were not acknowledged.
        rejected.extend(keys.iter().skip(items.len()).copied());

        debug!(
            index = %target,
            written = outcome.written,
            skipped = outcome.skipped,
            rejected = rejected.len(),
            "bulk write"
        );
        if rejected.is_empty() {
            Ok(outcome)
        } else {
            Err(StoreError::BatchRejected {
                keys: rejected,
                reason: reason.unwrap_or_else(|| "bulk response incomplete".to_string()),
            })
        }
    }
}

#[async_trait]
impl Listable for EsBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        let path = match prefix {
            Some(prefix) => format!("/_cat/indices/{prefix}*"),
            None => "/_cat/indices".to_string(),
        };
        let response = self
            .send(
                self.request(Method::GET, &path)
                    .query(&[("format", "json"), ("h", "index")]),
                "list",
            )
            .await?;
        let rows = self.json(response, "list").await?;

        let mut names: Vec<String> = rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row["index"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();

        let targets = names
            .into_iter()
            .filter_map(|name| Target::new(name).ok())
            .map(Ok);
        Ok(stream::iter(targets).boxed())
    }
}
