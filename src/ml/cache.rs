//! Process-lifetime cache of artifact bundles.
//!
//! Reads go through an `RwLock` read guard only. A miss takes the load mutex,
//! re-checks the map and loads at most once per key.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::model::{ArtifactBundle, ModelFamily};
use super::persistence::{ArtifactError, ArtifactSource};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub family: ModelFamily,
    pub location: String,
    pub version: String,
}

impl ArtifactKey {
    pub fn new(family: ModelFamily, location: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            family,
            location: location.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.family, self.location, self.version)
    }
}

pub struct ArtifactCache {
    source: Box<dyn ArtifactSource>,
    entries: RwLock<HashMap<ArtifactKey, Arc<ArtifactBundle>>>,
    load_lock: Mutex<()>,
    loads: AtomicUsize,
}

impl ArtifactCache {
    pub fn new(source: impl ArtifactSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            entries: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    fn lookup(&self, key: &ArtifactKey) -> Option<Arc<ArtifactBundle>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Cached bundle for `key`, loading it from the source on first use.
    pub fn get_or_load(&self, key: &ArtifactKey) -> Result<Arc<ArtifactBundle>, ArtifactError> {
        if let Some(bundle) = self.lookup(key) {
            return Ok(bundle);
        }

        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bundle) = self.lookup(key) {
            return Ok(bundle);
        }

        tracing::info!(key = %key, "Loading artifact bundle");
        self.loads.fetch_add(1, Ordering::Relaxed);
        let bundle = Arc::new(self.source.load(key)?);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Arc::clone(&bundle));
        Ok(bundle)
    }

    /// Seed the cache with an already-built bundle.
    pub fn insert(&self, key: ArtifactKey, bundle: ArtifactBundle) -> Arc<ArtifactBundle> {
        let bundle = Arc::new(bundle);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&bundle));
        bundle
    }

    /// Already-loaded bundle for `key`; never touches the source.
    pub fn get(&self, key: &ArtifactKey) -> Option<Arc<ArtifactBundle>> {
        self.lookup(key)
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of loads issued to the source so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .read()
            .map(|e| e.len())
            .unwrap_or_default();
        f.debug_struct("ArtifactCache")
            .field("entries", &len)
            .field("loads", &self.load_count())
            .finish()
    }
}
