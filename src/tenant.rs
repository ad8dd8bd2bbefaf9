use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Turns a database name into the file stem of its WAL. Only ASCII
/// alphanumerics, `_` and `-` survive, so the name cannot escape `data_dir`.
fn tenant_key(database: &str) -> io::Result<String> {
    if database.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let key: String = database
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if key.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(key)
}

/// One engine per database name, loaded on first use and kept for the life
/// of the process. Each engine owns a WAL file and a compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, engine_config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// The engine for `database`, replaying its WAL if this is the first
    /// connection to it. Names that sanitize to the same key share an engine.
    pub fn get_or_create(&self, database: &str) -> io::Result<Arc<Engine>> {
        let key = tenant_key(database)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(Arc::clone(engine.value()));
        }
        // Counted before taking the entry: len() would wait on the shard lock it holds.
        if self.tenant_count() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(key) {
            Entry::Occupied(loaded) => return Ok(Arc::clone(loaded.get())),
            Entry::Vacant(slot) => {
                let engine = self.load(slot.key())?;
                slot.insert(Arc::clone(&engine));
                engine
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenant_count() as f64);
        Ok(engine)
    }

    fn load(&self, key: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.engine_config,
        )?);
        tracing::info!(tenant = %key, providers = engine.state.len(), "tenant loaded");

        tokio::spawn(compactor::run_compactor(
            Arc::clone(&engine),
            self.compact_threshold,
        ));
        Ok(engine)
    }
}
