//! Filesystem backend: one JSON-lines file per target.
//!
//! `<root>/<target>.jsonl` holds one statement per line, appended in write
//! order. There is no index, so reads scan the whole file and sort the
//! matched set in memory (`native_sort = false`). Appends cannot replace a
//! line, so `Overwrite` is not supported.
//!
//! The parsed file is kept per target and reused while the file's length
//! and modification time are unchanged, so the chunks of one read stream
//! parse it once.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use lrs_gateway_core::{IdentityKey, ReadQuery, Statement, Target};

use crate::backend::{
    BackendProfile, BackendStatus, BatchOutcome, DataBackend, Listable, OnConflict,
    StoredRecord, TargetStream, Writable,
};
use crate::error::{Result, StoreError};
use crate::settings::FsSettings;
use crate::translate::predicate;

const EXTENSION: &str = "jsonl";

type Records = Arc<Vec<StoredRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

struct Snapshot {
    stamp: FileStamp,
    records: Records,
}

/// Parsed target files by path.
#[derive(Default)]
struct ParseCache(Mutex<HashMap<PathBuf, Snapshot>>);

impl ParseCache {
    /// Records of `path`, parsing it only when it changed since last time.
    fn load(&self, path: &Path) -> Result<Records> {
        let stamp = match fs::metadata(path) {
            Ok(meta) => FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget(path);
                return Ok(Arc::new(Vec::new()));
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(snapshot) = self.lock().get(path) {
            if snapshot.stamp == stamp {
                return Ok(Arc::clone(&snapshot.records));
            }
        }

        let records = Arc::new(load(path)?);
        debug!(path = %path.display(), records = records.len(), "parsed target file");
        self.lock().insert(
            path.to_path_buf(),
            Snapshot {
                stamp,
                records: Arc::clone(&records),
            },
        );
        Ok(records)
    }

    fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Snapshot>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FsBackend {
    root: PathBuf,
    profile: BackendProfile,
    /// Serializes appends.
    write_lock: Arc<Mutex<()>>,
    cache: Arc<ParseCache>,
}

impl FsBackend {
    /// Open a root directory, creating it if needed.
    pub fn open(settings: &FsSettings) -> Result<Self> {
        fs::create_dir_all(&settings.root)?;
        Ok(Self {
            root: settings.root.clone(),
            profile: settings.profile(),
            write_lock: Arc::new(Mutex::new(())),
            cache: Arc::new(ParseCache::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, target: &Target) -> PathBuf {
        self.root.join(format!("{target}.{EXTENSION}"))
    }

    async fn blocking<F, T>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Internal(format!("spawn_blocking failed: {e}")))?
    }
}

/// Load every record in a target file. A missing file is an empty target.
fn load(path: &Path) -> Result<Vec<StoredRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(StoredRecord::from_json(&line)?);
    }
    Ok(records)
}

#[async_trait]
impl DataBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn status(&self, _target: &Target) -> BackendStatus {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => BackendStatus::Ok,
            _ => BackendStatus::Unreachable,
        }
    }

    async fn read_chunk(
        &self,
        target: &Target,
        query: &ReadQuery,
        size: usize,
    ) -> Result<Vec<StoredRecord>> {
        let path = self.file_for(target);
        let cache = Arc::clone(&self.cache);
        let predicates = predicate::lower(query, size);
        Self::blocking(move || Ok(predicates.apply_ref(cache.load(&path)?.iter()))).await
    }

    async fn read_by_ids(&self, target: &Target, ids: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        let path = self.file_for(target);
        let cache = Arc::clone(&self.cache);
        let wanted: HashSet<IdentityKey> = ids.iter().copied().collect();
        Self::blocking(move || {
            Ok(cache
                .load(&path)?
                .iter()
                .filter(|record| wanted.contains(&record.key))
                .cloned()
                .collect())
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
impl Writable for FsBackend {
    fn supports(&self, policy: OnConflict) -> bool {
        policy != OnConflict::Overwrite
    }

    async fn write_batch(
        &self,
        target: &Target,
        batch: &[Statement],
        policy: OnConflict,
    ) -> Result<BatchOutcome> {
        if !self.supports(policy) {
            return Err(StoreError::UnsupportedConflictPolicy {
                backend: self.name().to_string(),
                policy,
            });
        }
        let path = self.file_for(target);
        let lock = Arc::clone(&self.write_lock);
        let cache = Arc::clone(&self.cache);
        let batch = batch
            .iter()
            .map(|statement| -> Result<(IdentityKey, String)> {
                Ok((statement.require_id()?, serde_json::to_string(statement)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut existing: HashSet<IdentityKey> =
                cache.load(&path)?.iter().map(|record| record.key).collect();

            if policy == OnConflict::Fail {
                let mut seen = HashSet::new();
                if batch
                    .iter()
                    .any(|(key, _)| existing.contains(key) || !seen.insert(*key))
                {
                    return Err(StoreError::BatchRejected {
                        keys: batch.iter().map(|(key, _)| *key).collect(),
                        reason: "identity key already exists".to_string(),
                    });
                }
            }

            let mut outcome = BatchOutcome::default();
            let mut buf = String::new();
            for (key, line) in &batch {
                if !existing.insert(*key) {
                    outcome.skipped += 1;
                    continue;
                }
                buf.push_str(line);
                buf.push('\n');
                outcome.written += 1;
            }

            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            cache.forget(&path);
            file.write_all(buf.as_bytes())?;
            file.sync_data()?;
            debug!(path = %path.display(), written = outcome.written, "appended batch");
            Ok(outcome)
        })
        .await
    }
}

#[async_trait]
impl Listable for FsBackend {
    async fn list(&self, prefix: Option<&str>) -> Result<TargetStream> {
        let root = self.root.clone();
        let prefix = prefix.unwrap_or_default().to_string();
        let mut names = Self::blocking(move || {
            let mut names = Vec::new();
            for entry in fs::read_dir(&root)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if stem.starts_with(&prefix) {
                        names.push(stem.to_string());
                    }
                }
            }
            Ok(names)
        })
        .await?;
        names.sort();

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
    use futures::TryStreamExt;
    use serde_json::json;

    fn backend(dir: &tempfile::TempDir) -> FsBackend {
        FsBackend::open(&FsSettings {
            root: dir.path().join("lrs"),
            ..FsSettings::default()
        })
        .unwrap()
    }

    fn statement(second: u32) -> Statement {
        Statement::from_value(json!({
            "id": IdentityKey::generate().to_string(),
            "actor": { "mbox": "mailto:learner@example.com" },
            "verb": { "id": "http://adlnet.gov/expapi/verbs/experienced" },
            "object": { "id": "http://example.com/page" },
            "timestamp": format!("2024-03-01T10:00:{second:02}Z")
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fs_sorts_client_side() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let target = Target::new("statements").unwrap();
        // Written out of timestamp order.
        let batch = vec![statement(5), statement(1), statement(3)];
        backend
            .write_batch(&target, &batch, OnConflict::Fail)
            .await
            .unwrap();

        let records = backend
            .read_chunk(&target, &ReadQuery::default(), 2)
            .await
            .unwrap();
        assert_eq!(records[0].statement, batch[0]);
        assert_eq!(records[1].statement, batch[2]);
    }

    #[tokio::test]
    async fn test_fs_rejects_overwrite_and_skips_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let target = Target::new("statements").unwrap();
        assert!(!backend.supports(OnConflict::Overwrite));

        let s = statement(0);
        backend
            .write_batch(&target, &[s.clone()], OnConflict::Ignore)
            .await
            .unwrap();
        let outcome = backend
            .write_batch(&target, &[s.clone(), statement(1)], OnConflict::Ignore)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { written: 1, skipped: 1 });

        let found = backend.read_by_ids(&target, &[s.id().unwrap()]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    fn snapshot(backend: &FsBackend, target: &Target) -> Option<Records> {
        let path = backend.file_for(target);
        backend.cache.lock().get(&path).map(|s| Arc::clone(&s.records))
    }

    #[tokio::test]
    async fn test_fs_reuses_parsed_file_until_it_changes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let target = Target::new("statements").unwrap();
        backend
            .write_batch(&target, &[statement(1), statement(2), statement(3)], OnConflict::Fail)
            .await
            .unwrap();

        let first = backend
            .read_chunk(&target, &ReadQuery::default(), 2)
            .await
            .unwrap();
        let parsed = snapshot(&backend, &target).unwrap();
        let next = ReadQuery::default().after(Some(first[1].position()));
        let rest = backend.read_chunk(&target, &next, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(Arc::ptr_eq(&parsed, &snapshot(&backend, &target).unwrap()));

        // Another writer appending to the file.
        let mut file = OpenOptions::new()
            .append(true)
            .open(backend.file_for(&target))
            .unwrap();
        writeln!(file, "{}", serde_json::to_string(&statement(4)).unwrap()).unwrap();
        drop(file);

        let all = backend
            .read_chunk(&target, &ReadQuery::default(), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(!Arc::ptr_eq(&parsed, &snapshot(&backend, &target).unwrap()));
    }

    #[tokio::test]
    async fn test_fs_list_targets() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        for name in ["b_target", "a_target"] {
            backend
                .write_batch(&Target::new(name).unwrap(), &[statement(0)], OnConflict::Ignore)
                .await
                .unwrap();
        }
        let listed: Vec<Target> = backend.list(None).await.unwrap().try_collect().await.unwrap();
        assert_eq!(
            listed,
            vec![Target::new("a_target").unwrap(), Target::new("b_target").unwrap()]
        );
        assert_eq!(
            backend.status(&Target::default()).await,
            BackendStatus::Ok
        );
    }
}
