// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::Future;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use protocol::{Category, ModelList};
use store::JsonStore;

use crate::backend::RegistryBackend;
use crate::entry::{normalize_name, seed_document, Registry, DEFAULT_CUSTOM_LIMIT};
use crate::error::RegistryError;
use crate::migrate::migrate;
use crate::notify::{Notifier, SubscriberId};

/// Tunables for a [`RegistryService`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// How many custom models are included in client-facing lists.
    pub custom_limit: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            custom_limit: DEFAULT_CUSTOM_LIMIT,
        }
    }
}

/// Result of a successful add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// `true` if the model was inserted, `false` if its usage was bumped.
    pub is_new: bool,
    /// Client projection of the registry right after the mutation.
    pub models: ModelList,
}

/// Last loaded registry, the store stamp it was loaded from and the
/// version it was published under.
struct CacheEntry {
    snapshot: Registry,
    source_mtime: Option<SystemTime>,
    version: u64,
}

struct Inner {
    backend: Box<dyn RegistryBackend>,
    options: RegistryOptions,
    cache: RwLock<Option<CacheEntry>>,
    /// Serialises every read-modify-write-persist sequence, and reloads
    /// (which may persist a seed or a migration).
    write_lock: Mutex<()>,
    /// Taken before `write_lock` is released so notifications go out in
    /// the order mutations completed.
    notify_gate: Mutex<()>,
    version: AtomicU64,
    notifier: Notifier,
    closed: AtomicBool,
}

/// The model registry: persisted, cached, versioned and observable.
///
/// Cloning is cheap and every clone shares the same state. A service is
/// meant to be opened once per store and injected into whatever hosts it
/// (HTTP gateway, connection hub, CLI).
#[derive(Clone)]
pub struct RegistryService {
    inner: Arc<Inner>,
}

impl RegistryService {
    /// Open a registry backed by the JSON file at `path`.
    ///
    /// Nothing is read until the first access; a missing file is seeded then.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        Self::open_with(path, RegistryOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(
        path: P,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        let store = JsonStore::at_path(path)?;
        Ok(Self::with_backend(store, options))
    }

    pub fn with_backend<B: RegistryBackend>(backend: B, options: RegistryOptions) -> Self {
        info!("opening model registry at {}", backend.describe());
        Self {
            inner: Arc::new(Inner {
                backend: Box::new(backend),
                options,
                cache: RwLock::new(None),
                write_lock: Mutex::new(()),
                notify_gate: Mutex::new(()),
                version: AtomicU64::new(0),
                notifier: Notifier::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stop accepting operations and drop every subscriber.
    ///
    /// Pending mutations that already hold the lock complete normally.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(
                "closing model registry at {}",
                self.inner.backend.describe()
            );
            self.inner.notifier.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    /// Current change counter. Starts at 0 for every process.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ModelList) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    pub fn subscribe_deferred<F, Fut>(&self, callback: F) -> SubscriberId
    where
        F: Fn(ModelList) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.notifier.subscribe_deferred(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.notifier.len()
    }

    /// Latest persisted registry, with both orderings in place.
    pub async fn snapshot(&self) -> Result<Registry, RegistryError> {
        Ok(self.versioned_snapshot().await?.0)
    }

    /// Latest registry paired with the version it was published under.
    ///
    /// Both halves come from one cache entry, so the version always
    /// describes exactly the returned data.
    pub async fn versioned_snapshot(&self) -> Result<(Registry, u64), RegistryError> {
        self.ensure_open()?;
        if let Some(hit) = self.cached_if_fresh().await? {
            return Ok(hit);
        }
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_loaded().await
    }

    /// Client projection: all official names, top custom names, version.
    pub async fn list_models(&self) -> Result<ModelList, RegistryError> {
        let (snapshot, version) = self.versioned_snapshot().await?;
        Ok(snapshot.to_model_list(self.inner.options.custom_limit, version))
    }

    pub async fn official_models(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.snapshot().await?.official_names())
    }

    /// The `limit` most used custom models.
    pub async fn custom_models(&self, limit: usize) -> Result<Vec<String>, RegistryError> {
        Ok(self.snapshot().await?.top_custom(limit))
    }

    /// Record a usage of `name` in `category`; returns whether it was new.
    pub async fn add_or_bump(&self, category: Category, name: &str) -> Result<bool, RegistryError> {
        Ok(self.add_model(name, category).await?.is_new)
    }

    /// Record a usage of `name` in `category`.
    ///
    /// The name is validated before any lock is taken. The whole
    /// load → mutate → persist sequence runs under the mutation lock;
    /// subscribers are notified after it is released. On a storage failure
    /// nothing observable changes: no cache update, no version bump, no
    /// notification.
    pub async fn add_model(
        &self,
        name: &str,
        category: Category,
    ) -> Result<AddOutcome, RegistryError> {
        let name = normalize_name(name)?;
        self.ensure_open()?;

        let guard = self.inner.write_lock.lock().await;
        let (mut registry, _) = self.ensure_loaded().await?;
        let is_new = registry.record_usage(category, &name);
        let version = self.persist(&mut registry, true).await?;
        let models = registry.to_model_list(self.inner.options.custom_limit, version);

        let gate = self.inner.notify_gate.lock().await;
        drop(guard);

        info!(
            "registry: {} {} model {} (version {})",
            if is_new { "added" } else { "bumped" },
            category,
            name,
            version
        );
        self.inner.notifier.notify(&models);
        drop(gate);

        Ok(AddOutcome { is_new, models })
    }

    /// Forget the cached snapshot; the next access reloads from the store.
    pub async fn invalidate(&self) {
        *self.inner.cache.write().await = None;
    }

    async fn cached_if_fresh(&self) -> Result<Option<(Registry, u64)>, RegistryError> {
        let current = self.inner.backend.modified()?;
        let cache = self.inner.cache.read().await;
        match cache.as_ref() {
            Some(entry) if current.is_some() && entry.source_mtime == current => {
                Ok(Some((entry.snapshot.clone(), entry.version)))
            }
            _ => Ok(None),
        }
    }

    /// Return the current registry, reloading it if the cache is empty or
    /// the store changed underneath it. Callers must hold `write_lock`.
    ///
    /// Seeding and migration write-backs are persisted without a version
    /// bump; only mutations made through [`add_model`](Self::add_model)
    /// count as changes.
    async fn ensure_loaded(&self) -> Result<(Registry, u64), RegistryError> {
        if let Some(hit) = self.cached_if_fresh().await? {
            return Ok(hit);
        }

        // Stamp first: if the file changes after this point the next check
        // sees a different stamp and reloads again.
        let mtime = self.inner.backend.modified()?;
        let raw = self.inner.backend.load()?;

        let Some(raw) = raw else {
            info!(
                "registry store {} is empty; seeding defaults",
                self.inner.backend.describe()
            );
            let (mut seeded, _) = migrate(seed_document())?;
            let version = self.persist(&mut seeded, false).await?;
            return Ok((seeded, version));
        };

        let (mut registry, changed) = migrate(raw)?;
        if changed {
            info!(
                "registry store {} used the legacy name-only format; migrating",
                self.inner.backend.describe()
            );
            let version = self.persist(&mut registry, false).await?;
            return Ok((registry, version));
        }

        registry.restore_order();
        debug!(
            "registry reloaded from {} ({} official, {} custom)",
            self.inner.backend.describe(),
            registry.official.len(),
            registry.custom.len()
        );
        let mut cache = self.inner.cache.write().await;
        let version = self.version();
        *cache = Some(CacheEntry {
            snapshot: registry.clone(),
            source_mtime: mtime,
            version,
        });
        Ok((registry, version))
    }

    /// Sort, save, then publish the new state to the cache. With `bump` the
    /// version is incremented under the same cache write, so no reader can
    /// see the new version with the old data or the reverse.
    ///
    /// Nothing after the save runs if the save fails.
    async fn persist(&self, registry: &mut Registry, bump: bool) -> Result<u64, RegistryError> {
        registry.restore_order();
        self.inner.backend.save(registry)?;

        let mtime = match self.inner.backend.modified() {
            Ok(mtime) => mtime,
            Err(e) => {
                // The document is on disk; without a stamp the cache is
                // simply never considered fresh and reloads next time.
                warn!("registry saved but mtime unavailable: {:#}", e);
                None
            }
        };

        let mut cache = self.inner.cache.write().await;
        let version = if bump {
            self.inner.version.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.version()
        };
        *cache = Some(CacheEntry {
            snapshot: registry.clone(),
            source_mtime: mtime,
            version,
        });
        Ok(version)
    }
}
