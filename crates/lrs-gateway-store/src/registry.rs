//! Named backend factories with lazy, cached construction.
//!
//! Adapters are registered explicitly at init time. Registration only
//! records a factory; the adapter is built on the first `resolve` of its
//! name and the same `Arc` is handed out afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::backend::{Capabilities, DataBackend};
use crate::clickhouse::ClickHouseBackend;
use crate::error::{Result, StoreError};
use crate::es::EsBackend;
use crate::fs::FsBackend;
use crate::memory::MemoryBackend;
use crate::settings::BackendSettings;
use crate::sqlite::SqliteBackend;

/// Builds an adapter from the shared settings.
pub type BackendFactory =
    Arc<dyn Fn(&BackendSettings) -> Result<Arc<dyn DataBackend>> + Send + Sync>;

pub struct BackendRegistry {
    settings: BackendSettings,
    factories: BTreeMap<String, BackendFactory>,
    resolved: Mutex<HashMap<String, Arc<dyn DataBackend>>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            factories: BTreeMap::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// A registry with the built-in adapters: `memory`, `sqlite`, `fs`,
    /// `es` and `clickhouse`.
    pub fn with_builtin(settings: BackendSettings) -> Self {
        let mut registry = Self::new(settings);
        registry.register("memory", |s: &BackendSettings| {
            Ok(Arc::new(MemoryBackend::with_settings(&s.memory)) as Arc<dyn DataBackend>)
        });
        registry.register("sqlite", |s: &BackendSettings| {
            Ok(Arc::new(SqliteBackend::from_settings(&s.sqlite)?) as Arc<dyn DataBackend>)
        });
        registry.register("fs", |s: &BackendSettings| {
            Ok(Arc::new(FsBackend::open(&s.fs)?) as Arc<dyn DataBackend>)
        });
        registry.register("es", |s: &BackendSettings| {
            Ok(Arc::new(EsBackend::new(&s.es)?) as Arc<dyn DataBackend>)
        });
        registry.register("clickhouse", |s: &BackendSettings| {
            Ok(Arc::new(ClickHouseBackend::new(&s.clickhouse)?) as Arc<dyn DataBackend>)
        });
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    ///
    /// Nothing is constructed until the name is resolved.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&BackendSettings) -> Result<Arc<dyn DataBackend>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(backend = %name, "registered backend factory");
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
        self.factories.insert(name, Arc::new(factory));
        self
    }

    /// Register an already constructed adapter.
    pub fn register_instance(&mut self, name: impl Into<String>, backend: Arc<dyn DataBackend>) -> &mut Self {
        self.register(name, move |_: &BackendSettings| Ok(Arc::clone(&backend)))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// The adapter registered under `name`, constructing it on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DataBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StoreError::UnknownBackend(name.to_string()))?;

        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(backend) = resolved.get(name) {
            return Ok(Arc::clone(backend));
        }
        let backend = factory(&self.settings)?;
        info!(backend = %name, capabilities = ?backend.capabilities(), "backend resolved");
        resolved.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Does the adapter registered under `name` accept writes?
    pub fn writable(&self, name: &str) -> Result<bool> {
        Ok(self.capabilities(name)?.writable)
    }

    /// Does the adapter registered under `name` list targets?
    pub fn listable(&self, name: &str) -> Result<bool> {
        Ok(self.capabilities(name)?.listable)
    }

    fn capabilities(&self, name: &str) -> Result<Capabilities> {
        Ok(self.resolve(name)?.capabilities())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin(BackendSettings::default())
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}
