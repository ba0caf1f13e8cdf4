//! SQLite backend.
//!
//! rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`. All targets share one `statements` table
//! keyed by `(target, event_id)`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use tracing::debug;

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};

use crate::backend::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, OnConflict,
    StoredRecord, TargetStream, Writable,
};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::settings::SqliteSettings;
use crate::translate::sql::{self, SqlParam};

/// Ids bound per `IN (...)` lookup.
const IDS_PER_QUERY: usize = 500;

/// SQLite-backed statement storage.
///
/// Thread-safe via an internal mutex. Every operation runs on the blocking
/// pool.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    profile: BackendProfile,
}

impl SqliteBackend {
    /// Open (and migrate) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?, SqliteSettings::default().profile())
    }

    /// Open a private in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::with_connection(
            Connection::open_in_memory()?,
            SqliteSettings::default().profile(),
        )
    }

    pub fn from_settings(settings: &SqliteSettings) -> Result<Self> {
        let conn = match &settings.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        Self::with_connection(conn, settings.profile())
    }

    fn with_connection(mut conn: Connection, profile: BackendProfile) -> Result<Self> {
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            profile,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {e}")),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {e}")),
            ))
        })?
    }
}

fn query_events(conn: &Connection, sql: &str, params: Vec<SqlParam>) -> Result<Vec<StoredRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;
    let records = rows
        .map(|event| StoredRecord::from_json(&event?))
        .collect::<Result<Vec<_>>>()?;
    Ok(records)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl DataBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, _target: &Target) -> BackendStatus {
        let probe = self
            .run(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        match probe {
            Ok(_) => BackendStatus::Ok,
            Err(e) => {
                debug!(error = %e, "sqlite status probe failed");
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
        let native = sql::lower(query, size);
        let text = format!(
            "SELECT event FROM statements WHERE target = ? AND ({}) ORDER BY {} LIMIT ?",
            native.where_clause, native.order_by
        );
        let mut params = Vec::with_capacity(native.params.len() + 2);
        params.push(SqlParam::Text(target.to_string()));
        params.extend(native.params);
        params.push(SqlParam::Integer(i64::try_from(native.limit).unwrap_or(i64::MAX)));

        self.run(move |conn| query_events(conn, &text, params)).await
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        let target = target.to_string();
        let ids: Vec<String> = ids.iter().map(IdentityKey::to_string).collect();

        self.run(move |conn| {
            let mut records = Vec::with_capacity(ids.len());
            for chunk in ids.chunks(IDS_PER_QUERY) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let text = format!(
                    "SELECT event FROM statements WHERE target = ? AND event_id IN ({placeholders})"
                );
                let mut params = vec![SqlParam::Text(target.clone())];
                params.extend(chunk.iter().cloned().map(SqlParam::Text));
                records.extend(query_events(conn, &text, params)?);
            }
            Ok(records)
        })
        .await
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }
}

#[async_trait]
impl Writable for SqliteBackend {
    fn supports(&self, _policy: OnConflict) -> bool {
        true
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        let target = target.to_string();
        let mut rows = Vec::with_capacity(batch.len());
        for statement in batch {
            let record = StoredRecord::from_statement(statement.clone())?;
            rows.push((
                record.key,
                sql::nanos(&record.timestamp),
                statement.authority().map(|a| a.canonical()),
                statement.verb_id().unwrap_or_default().to_string(),
                serde_json::to_string(statement)?,
            ));
        }

        let insert = match policy {
            OnConflict::Fail => "INSERT",
            OnConflict::Ignore => "INSERT OR IGNORE",
            OnConflict::Overwrite => "INSERT OR REPLACE",
        };
        let text = format!(
            "{insert} INTO statements \
             (target, event_id, emission_time, authority, verb_id, event, stored_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        );

        self.run(move |conn| {
            let stored_at = chrono::Utc::now().timestamp_millis();
            let tx = conn.transaction()?;
            let mut outcome = BatchOutcome::default();
            {
                let mut stmt = tx.prepare_cached(&text)?;
                for (key, emission_time, authority, verb_id, event) in &rows {
                    let changed = match stmt.execute(params![
                        target,
                        key.to_string(),
                        emission_time,
                        authority,
                        verb_id,
                        event,
                        stored_at,
                    ]) {
                        Ok(changed) => changed,
                        Err(e) if policy == OnConflict::Fail && is_constraint_violation(&e) => {
                            // Dropping the transaction rolls the batch back.
                            return Err(StoreError::BatchRejected {
                                keys: rows.iter().map(|row| row.0).collect(),
                                reason: format!("identity key {key} already exists"),
                            });
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if changed == 0 {
                        outcome.skipped += 1;
                    } else {
                        outcome.written += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}

#[async_trait]
impl Listable for SqliteBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        let prefix = prefix.unwrap_or_default().to_string();
        let names: Vec<String> = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT DISTINCT target FROM statements \
                     WHERE substr(target, 1, length(?1)) = ?1 ORDER BY target",
                )?;
                let names = stmt
                    .query_map([&prefix], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await?;

        let targets = names.into_iter().map(|name| {
            Target::new(name).map_err(|e| StoreError::InvalidData(e.to_string()))
        });
        Ok(stream::iter(targets).boxed())
    }
}
