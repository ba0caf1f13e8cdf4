//! The statement store.
//!
//! Statement semantics on top of any data backend:
//!
//! - **Immutability**: a write never changes a stored statement. Reusing an
//!   id with the same content is a no-op; with different content it is a
//!   conflict and nothing from the submission is persisted.
//! - **Void overlay**: voiding statements never delete. Filtered reads hide
//!   voided statements, id reads still return them, voided-id reads return
//!   a statement only once it is voided.
//! - **Authority**: every write is stamped with the writer's authority.
//!   Reads can be confined to the caller's authority.
//! - **Pagination**: keyset cursors taken from the last record a page read.
//!
//! The write path is `validate → resolve identity → check conflicts →
//! stamp → persist → forward`. Forwarding starts after persistence and its
//! outcome never changes the write result.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::TryStreamExt;
use serde_json::Value;
use tracing::{debug, info};

use lrs_gateway_core::{
    validate_query, Authority, Cursor, IdentityKey, Page, Principal, ReadQuery, RecordValidator,
    Scope, Statement, StatementQuery, StructuralValidator, Target, ValidationError,
};
use lrs_gateway_forward::{
    DispatchHandle, ForwardTransport, ForwardingDispatcher, ForwardingTarget, HttpTransport,
    PartialForwardingFailure,
};
use lrs_gateway_store::{
    BackendExt, BackendRegistry, BackendStatus, DataBackend, NativeQuery, ReadOptions,
    StoreError, TranslatorRegistry,
};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

/// Outcome of a successful write.
#[derive(Debug)]
pub struct WriteResult {
    /// Ids of every submitted statement, in submission order.
    pub ids: Vec<IdentityKey>,
    /// Statements newly persisted.
    pub written: usize,
    /// Submitted statements already stored with the same content.
    pub duplicates: usize,
    /// Forwarding of the newly persisted statements.
    pub forwarding: DispatchHandle,
}

/// Statement semantics over one data backend.
pub struct StatementStore {
    backend: Arc<dyn DataBackend>,
    validator: Arc<dyn RecordValidator>,
    dispatcher: Arc<ForwardingDispatcher>,
    translators: TranslatorRegistry,
    config: GatewayConfig,
    default_target: Target,
}

impl StatementStore {
    /// Build a store over `backend`, forwarding over HTTP to the configured
    /// targets.
    ///
    /// Fails when the configuration is invalid or the backend cannot
    /// express the configured conflict policy.
    pub fn new(backend: Arc<dyn DataBackend>, config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        if let Some(writable) = backend.as_writable() {
            if !writable.supports(config.write.on_conflict) {
                return Err(StoreError::UnsupportedConflictPolicy {
                    backend: backend.name().to_string(),
                    policy: config.write.on_conflict,
                }
                .into());
            }
        }

        let dispatcher = Self::build_dispatcher(&config, Arc::new(HttpTransport::new()));
        info!(
            backend = backend.name(),
            forwarding_targets = dispatcher.targets().len(),
            restrict_by_authority = config.restrict_by_authority,
            restrict_by_scopes = config.restrict_by_scopes,
            "statement store ready"
        );
        Ok(Self {
            backend,
            validator: Arc::new(StructuralValidator),
            dispatcher: Arc::new(dispatcher),
            translators: TranslatorRegistry::builtin(),
            default_target: config.target()?,
            config,
        })
    }

    /// Resolve `config.backend` from the built-in adapters.
    pub fn open(config: GatewayConfig) -> Result<Self> {
        let registry = BackendRegistry::with_builtin(config.backends.clone());
        Self::open_with(config, &registry)
    }

    /// Resolve `config.backend` from `registry`.
    pub fn open_with(config: GatewayConfig, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.resolve(&config.backend)?;
        Self::new(backend, config)
    }

    pub fn with_validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Forward to the configured targets through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn ForwardTransport>) -> Self {
        self.dispatcher = Arc::new(Self::build_dispatcher(&self.config, transport));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<ForwardingDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    fn build_dispatcher(
        config: &GatewayConfig,
        transport: Arc<dyn ForwardTransport>,
    ) -> ForwardingDispatcher {
        let targets = ForwardingTarget::from_entries(config.forwarding.iter().cloned());
        ForwardingDispatcher::new(targets, transport, config.dispatch.clone())
    }

    pub fn backend(&self) -> &Arc<dyn DataBackend> {
        &self.backend
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn default_target(&self) -> &Target {
        &self.default_target
    }

    pub fn dispatcher(&self) -> &ForwardingDispatcher {
        &self.dispatcher
    }

    /// Forwarding targets that recently exhausted their retries.
    pub fn recent_forwarding_failures(&self) -> Vec<PartialForwardingFailure> {
        self.dispatcher.recent_failures()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and store a batch of raw statements.
    ///
    /// All or nothing with respect to validation and conflicts: a rejected
    /// record or a conflicting id fails the whole submission before
    /// anything is persisted.
    pub async fn write(
        &self,
        principal: &Principal,
        records: Vec<Value>,
        target: &Target,
    ) -> Result<WriteResult> {
        self.require_scope(principal, Scope::StatementsWrite)?;
        let mut submitted = Vec::with_capacity(records.len());
        for (index, raw) in records.into_iter().enumerate() {
            let statement = self.validate(index, raw)?;
            let key = statement.id().unwrap_or_else(IdentityKey::generate);
            submitted.push(statement.with_id(key));
        }
        self.persist(principal, submitted, target).await
    }

    /// Store one statement under `key`.
    ///
    /// The statement's own `id`, when present, must equal `key`.
    pub async fn put(
        &self,
        principal: &Principal,
        key: IdentityKey,
        raw: Value,
        target: &Target,
    ) -> Result<WriteResult> {
        self.require_scope(principal, Scope::StatementsWrite)?;
        let statement = self.validate(0, raw)?;
        if let Some(found) = statement.id() {
            if found != key {
                return Err(ValidationError::IdentityMismatch {
                    expected: key.to_string(),
                    found: found.to_string(),
                }
                .into());
            }
        }
        self.persist(principal, vec![statement.with_id(key)], target)
            .await
    }

    fn validate(&self, index: usize, raw: Value) -> Result<Statement> {
        self.validator
            .validate(raw)
            .map_err(|reason| GatewayError::Rejected {
                index,
                reason: reason.0,
            })
    }

    async fn persist(
        &self,
        principal: &Principal,
        submitted: Vec<Statement>,
        target: &Target,
    ) -> Result<WriteResult> {
        let ids = submitted
            .iter()
            .map(Statement::require_id)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Collapse repeated ids inside the submission.
        let mut unique: Vec<Statement> = Vec::with_capacity(submitted.len());
        let mut position: HashMap<IdentityKey, usize> = HashMap::new();
        let mut conflicts = BTreeSet::new();
        let mut duplicates = 0;
        for (statement, key) in submitted.into_iter().zip(ids.iter().copied()) {
            match position.get(&key) {
                Some(&i) if unique[i].same_content(&statement) => duplicates += 1,
                Some(_) => {
                    conflicts.insert(key);
                }
                None => {
                    position.insert(key, unique.len());
                    unique.push(statement);
                }
            }
        }

        // Compare against what is already stored.
        let keys: Vec<IdentityKey> = unique.iter().filter_map(Statement::id).collect();
        let existing = self
            .lookup(target, &keys)
            .await
            .map_err(|e| not_persisted(e, &keys))?;
        let mut fresh = Vec::with_capacity(unique.len());
        for statement in unique {
            let key = statement.require_id()?;
            match existing.get(&key) {
                Some(stored) if stored.same_content(&statement) => duplicates += 1,
                Some(_) => {
                    conflicts.insert(key);
                }
                None => fresh.push(statement),
            }
        }
        if !conflicts.is_empty() {
            debug!(target = %target, conflicts = conflicts.len(), "write refused");
            return Err(GatewayError::Conflict {
                keys: conflicts.into_iter().collect(),
            });
        }

        // Duplicates are already stored.
        let fresh_keys: Vec<IdentityKey> = fresh.iter().filter_map(Statement::id).collect();
        self.check_voids(target, &fresh, &existing)
            .await
            .map_err(|e| not_persisted(e, &fresh_keys))?;

        if fresh.is_empty() {
            return Ok(WriteResult {
                ids,
                written: 0,
                duplicates,
                forwarding: DispatchHandle::default(),
            });
        }

        let now = Utc::now();
        let stamped: Vec<Statement> = fresh
            .into_iter()
            .map(|statement| {
                statement
                    .with_authority(&principal.authority)
                    .with_stored(now)
                    .with_default_timestamp(now)
            })
            .collect();

        let report = self
            .backend
            .write(target, stamped.clone(), self.config.write.options())
            .await
            .map_err(|e| not_persisted(e, &fresh_keys))?;
        info!(
            target = %target,
            written = report.written,
            duplicates = duplicates + report.skipped,
            principal = %principal.id,
            "statements stored"
        );

        let forwarding = self.dispatcher.dispatch(stamped);
        Ok(WriteResult {
            ids,
            written: report.written,
            duplicates: duplicates + report.skipped,
            forwarding,
        })
    }

    /// A voiding statement may not target another voiding statement.
    async fn check_voids(
        &self,
        target: &Target,
        fresh: &[Statement],
        existing: &HashMap<IdentityKey, Statement>,
    ) -> std::result::Result<(), StoreError> {
        let submitted: HashMap<IdentityKey, &Statement> = fresh
            .iter()
            .filter_map(|s| s.id().map(|key| (key, s)))
            .chain(existing.iter().map(|(key, s)| (*key, s)))
            .collect();

        let mut unresolved = Vec::new();
        for statement in fresh.iter().filter(|s| s.is_voiding()) {
            let Some(voided) = statement.voided_target() else {
                continue;
            };
            match submitted.get(&voided) {
                Some(referenced) if referenced.is_voiding() => {
                    return Err(voiding_void(statement).into());
                }
                Some(_) => {}
                None => unresolved.push((voided, statement)),
            }
        }
        if unresolved.is_empty() {
            return Ok(());
        }

        let keys: Vec<IdentityKey> = unresolved.iter().map(|(key, _)| *key).collect();
        let stored = self.lookup(target, &keys).await?;
        for (voided, statement) in unresolved {
            if stored.get(&voided).is_some_and(Statement::is_voiding) {
                return Err(voiding_void(statement).into());
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Answer a query with one page of statements.
    pub async fn read(
        &self,
        principal: &Principal,
        query: &StatementQuery,
        target: &Target,
    ) -> Result<Page> {
        self.require_scope(principal, Scope::StatementsReadMine)?;
        validate_query(query)?;
        let authority = self.read_authority(principal, query);

        if let Some(key) = query.statement_id {
            let found = self.visible(target, key, authority.as_ref()).await?;
            return Ok(Page::new(found.into_iter().collect(), None));
        }
        if let Some(key) = query.voided_statement_id {
            let found = match self.visible(target, key, authority.as_ref()).await? {
                Some(statement) => self
                    .voided_among(target, &[key])
                    .await?
                    .contains(&key)
                    .then_some(statement),
                None => None,
            };
            return Ok(Page::new(found.into_iter().collect(), None));
        }

        let limit = self.config.read.page_size(query.limit);
        let after = query.cursor.as_ref().map(Cursor::decode).transpose()?;
        let read_query = ReadQuery::from_query(query)
            .with_authority(authority)
            .after(after);

        let records = self
            .backend
            .read_all(target, read_query, self.config.read.options(limit))
            .await?;

        // The cursor follows the last record read, voided or not.
        let cursor = match records.last() {
            Some(last) if records.len() == limit => Some(
                Cursor::encode(&last.position())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            _ => None,
        };

        let keys: Vec<IdentityKey> = records.iter().map(|r| r.key).collect();
        let voided = self.voided_among(target, &keys).await?;
        let statements: Vec<Statement> = records
            .into_iter()
            .filter(|record| !voided.contains(&record.key))
            .map(|record| record.statement)
            .collect();
        debug!(
            target = %target,
            returned = statements.len(),
            hidden = voided.len(),
            more = cursor.is_some(),
            "read page"
        );
        Ok(Page::new(statements, cursor))
    }

    /// The native query a read would run, for diagnostics.
    pub fn explain(&self, principal: &Principal, query: &StatementQuery) -> Result<NativeQuery> {
        self.require_scope(principal, Scope::StatementsReadMine)?;
        validate_query(query)?;
        let authority = self.read_authority(principal, query);

        let (read_query, size) = match query.statement_id.or(query.voided_statement_id) {
            Some(key) => (ReadQuery::by_id(key).with_authority(authority), 1),
            None => {
                let after = query.cursor.as_ref().map(Cursor::decode).transpose()?;
                let read_query = ReadQuery::from_query(query)
                    .with_authority(authority)
                    .after(after);
                (read_query, self.config.read.page_size(query.limit))
            }
        };
        let name = self.backend.name();
        self.translators
            .translate(name, &read_query, size)
            .ok_or_else(|| {
                GatewayError::Configuration(format!("no query translator for backend {name}"))
            })
    }

    /// Targets whose name starts with `prefix`.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<Target>> {
        let listable = self
            .backend
            .as_listable()
            .ok_or_else(|| StoreError::NotListable(self.backend.name().to_string()))?;
        let targets: Vec<Target> = listable.list(prefix).await?.try_collect().await?;
        Ok(targets)
    }

    pub async fn status(&self, target: &Target) -> BackendStatus {
        self.backend.status(target).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn require_scope(&self, principal: &Principal, scope: Scope) -> Result<()> {
        if !self.config.restrict_by_scopes || principal.has_scope(scope) {
            return Ok(());
        }
        Err(GatewayError::Forbidden(format!(
            "{} lacks scope {scope}",
            principal.id
        )))
    }

    /// The authority a read is confined to, if any.
    fn read_authority(&self, principal: &Principal, query: &StatementQuery) -> Option<Authority> {
        let restricted = (self.config.restrict_by_authority || self.config.restrict_by_scopes)
            && !principal.reads_unrestricted();
        (query.mine || restricted).then(|| principal.authority.clone())
    }

    /// Fetch stored statements by id, chunked and under the backend timeout.
    async fn lookup(
        &self,
        target: &Target,
        keys: &[IdentityKey],
    ) -> std::result::Result<HashMap<IdentityKey, Statement>, StoreError> {
        let profile = self.backend.profile();
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(profile.read_chunk_size.max(1)) {
            let records =
                tokio::time::timeout(profile.timeout, self.backend.read_by_ids(target, chunk))
                    .await
                    .map_err(|_| StoreError::Timeout {
                        backend: self.backend.name().to_string(),
                        operation: "read by ids",
                        after: profile.timeout,
                    })??;
            found.extend(records.into_iter().map(|r| (r.key, r.statement)));
        }
        Ok(found)
    }

    /// One statement by id, if stored and visible under `authority`.
    async fn visible(
        &self,
        target: &Target,
        key: IdentityKey,
        authority: Option<&Authority>,
    ) -> Result<Option<Statement>> {
        let mut found = self.lookup(target, &[key]).await?;
        Ok(found
            .remove(&key)
            .filter(|statement| authority.map_or(true, |a| authored_by(statement, a))))
    }

    /// Which of `keys` are targeted by a stored voiding statement.
    ///
    /// Voids count regardless of who wrote them. Only voids naming one of
    /// `keys` are read.
    async fn voided_among(
        &self,
        target: &Target,
        keys: &[IdentityKey],
    ) -> Result<HashSet<IdentityKey>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let options = ReadOptions {
            chunk_size: self.config.read.chunk_size,
            prefetch: self.config.read.prefetch,
            limit: None,
        };
        let voided: HashSet<IdentityKey> = self
            .backend
            .read(target, ReadQuery::voiding(keys.iter().copied()), options)
            .try_filter_map(|record| async move { Ok(record.statement.voided_target()) })
            .try_collect()
            .await?;
        Ok(voided)
    }
}

impl std::fmt::Debug for StatementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementStore")
            .field("backend", &self.backend.name())
            .field("default_target", &self.default_target)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn authored_by(statement: &Statement, authority: &Authority) -> bool {
    statement
        .get("authority")
        .map_or(false, |agent| authority.ifi().matches(agent))
}

/// A write that failed before every submitted record was stored.
///
/// Validation failures keep their own error; anything else reports the
/// records it left unpersisted.
fn not_persisted(err: StoreError, unpersisted: &[IdentityKey]) -> GatewayError {
    match err {
        StoreError::Validation(e) => GatewayError::Validation(e),
        err @ StoreError::WriteAborted { .. } => err.into(),
        source => GatewayError::WriteFailed {
            persisted: 0,
            unpersisted: unpersisted.to_vec(),
            source,
        },
    }
}

fn voiding_void(statement: &Statement) -> ValidationError {
    ValidationError::VoidingVoid(
        statement
            .id()
            .map(|key| key.to_string())
            .unwrap_or_default(),
    )
}
