//! Backend registry
//!
//! Maps backend names to constructors. The table is built once at startup
//! with the built-in backends and can be extended before the server is
//! assembled; lookups of unknown names fail, which `main` treats as fatal.

use crate::backends::fanout::FanoutMonitor;
use crate::backends::file_store::FileStore;
use crate::backends::http::{HttpMonitor, HttpScanner};
use crate::backends::log_monitor::LogMonitor;
use crate::backends::memory_store::MemoryStore;
use crate::backends::{BackendConfig, Backends, Monitor, Scan, Store};
use crate::config::ServerConfig;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

type ScanConstructor = Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn Scan>> + Send + Sync>;
type MonitorConstructor = Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn Monitor>> + Send + Sync>;
type StoreConstructor = Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn Store>> + Send + Sync>;

// Registry entry containing constructor and metadata
#[derive(Clone)]
struct RegistryEntry<C> {
    constructor: C,
    description: String,
}

/// Kind of collaborator a registry entry constructs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Scanner,
    Monitor,
    Store,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Scanner => "scanner",
            BackendKind::Monitor => "monitor",
            BackendKind::Store => "store",
        }
    }
}

/// Name to constructor lookup for scanners, monitors and stores
#[derive(Default)]
pub struct BackendRegistry {
    scanners: BTreeMap<String, RegistryEntry<ScanConstructor>>,
    monitors: BTreeMap<String, RegistryEntry<MonitorConstructor>>,
    stores: BTreeMap<String, RegistryEntry<StoreConstructor>>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the backends shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        if let Err(e) = registry.initialize_builtin_backends() {
            warn!(error = %e, "Failed to register built-in backends");
        }
        registry
    }

    fn initialize_builtin_backends(&mut self) -> Result<()> {
        self.register_store(
            "memory",
            "In-process store, contents are lost on restart",
            Arc::new(|_config| Ok(Arc::new(MemoryStore::new()) as Arc<dyn Store>)),
        )?;
        self.register_store(
            "file",
            "JSON documents below the directory given as endpoint",
            Arc::new(|config| Ok(Arc::new(FileStore::new(&config.endpoint)?) as Arc<dyn Store>)),
        )?;
        self.register_scanner(
            "http",
            "Scanner reached over JSON/HTTP (POST <endpoint>/scan)",
            Arc::new(|config| Ok(Arc::new(HttpScanner::new(config)?) as Arc<dyn Scan>)),
        )?;
        self.register_monitor(
            "http",
            "Monitor reached over JSON/HTTP (POST <endpoint>/push and /resolve)",
            Arc::new(|config| Ok(Arc::new(HttpMonitor::new(config)?) as Arc<dyn Monitor>)),
        )?;
        self.register_monitor(
            "log",
            "Emits pushes and resolutions as structured log events",
            Arc::new(|config| Ok(Arc::new(LogMonitor::new(config)) as Arc<dyn Monitor>)),
        )
    }

    /// Register a scanner constructor under `key`
    pub fn register_scanner(
        &mut self,
        key: &str,
        description: &str,
        constructor: ScanConstructor,
    ) -> Result<()> {
        insert_entry(&mut self.scanners, BackendKind::Scanner, key, description, constructor)
    }

    /// Register a monitor constructor under `key`
    pub fn register_monitor(
        &mut self,
        key: &str,
        description: &str,
        constructor: MonitorConstructor,
    ) -> Result<()> {
        insert_entry(&mut self.monitors, BackendKind::Monitor, key, description, constructor)
    }

    /// Register a store constructor under `key`
    pub fn register_store(
        &mut self,
        key: &str,
        description: &str,
        constructor: StoreConstructor,
    ) -> Result<()> {
        insert_entry(&mut self.stores, BackendKind::Store, key, description, constructor)
    }

    /// Construct the scanner named by `config.kind`
    pub fn new_scanner(&self, config: &BackendConfig) -> Result<Arc<dyn Scan>> {
        let entry = lookup(&self.scanners, BackendKind::Scanner, &config.kind)?;
        (entry.constructor)(config)
    }

    /// Construct the monitor named by `config.kind`
    pub fn new_monitor(&self, config: &BackendConfig) -> Result<Arc<dyn Monitor>> {
        let entry = lookup(&self.monitors, BackendKind::Monitor, &config.kind)?;
        (entry.constructor)(config)
    }

    /// Construct the store named by `config.kind`
    pub fn new_store(&self, config: &BackendConfig) -> Result<Arc<dyn Store>> {
        let entry = lookup(&self.stores, BackendKind::Store, &config.kind)?;
        (entry.constructor)(config)
    }

    /// Build every collaborator the server configuration asks for
    pub fn build(&self, config: &ServerConfig) -> Result<Backends> {
        let store = self.new_store(&config.store)?;
        let scanner = self.new_scanner(&config.scanner.backend)?;

        let monitors = config
            .monitors
            .iter()
            .map(|monitor| self.new_monitor(monitor))
            .collect::<Result<Vec<_>>>()?;
        let monitor: Arc<dyn Monitor> = match monitors.len() {
            0 => return Err(anyhow!("at least one monitor backend must be configured")),
            1 => Arc::clone(&monitors[0]),
            _ => Arc::new(FanoutMonitor::new(monitors)),
        };

        Ok(Backends {
            scanner,
            monitor,
            store,
        })
    }

    /// Registered backends as `(kind, key, description)`, sorted by kind then key
    pub fn describe(&self) -> Vec<(BackendKind, String, String)> {
        let scanners = self
            .scanners
            .iter()
            .map(|(k, e)| (BackendKind::Scanner, k.clone(), e.description.clone()));
        let monitors = self
            .monitors
            .iter()
            .map(|(k, e)| (BackendKind::Monitor, k.clone(), e.description.clone()));
        let stores = self
            .stores
            .iter()
            .map(|(k, e)| (BackendKind::Store, k.clone(), e.description.clone()));
        scanners.chain(monitors).chain(stores).collect()
    }
}

fn insert_entry<C>(
    table: &mut BTreeMap<String, RegistryEntry<C>>,
    kind: BackendKind,
    key: &str,
    description: &str,
    constructor: C,
) -> Result<()> {
    if table.contains_key(key) {
        return Err(anyhow!(
            "{} backend '{}' has already been registered",
            kind.as_str(),
            key
        ));
    }
    table.insert(
        key.to_string(),
        RegistryEntry {
            constructor,
            description: description.to_string(),
        },
    );
    Ok(())
}

fn lookup<'a, C>(
    table: &'a BTreeMap<String, RegistryEntry<C>>,
    kind: BackendKind,
    key: &str,
) -> Result<&'a RegistryEntry<C>> {
    table
        .get(key)
        .ok_or_else(|| anyhow!("unknown {} backend '{}'", kind.as_str(), key))
}
