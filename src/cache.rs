//! Per-source driver instances
//!
//! Each storage source gets exactly one live driver, built on first use:
//! the backend comes from the registry, is wrapped in a [`SecureDriver`]
//! bound to the permission engine and initialized with the source's
//! configuration. Lookups after that are lock-free.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::driver::{DriverRegistry, SecureDriver, StorageDriver};
use crate::error::{FileHubError, Result};
use crate::model::StorageSource;
use crate::permission::PermissionEngine;
use crate::store::SourceRepository;

pub struct DriverCache {
    sources: Arc<dyn SourceRepository>,
    registry: Arc<DriverRegistry>,
    engine: Arc<PermissionEngine>,
    drivers: DashMap<String, Arc<dyn StorageDriver>>,
    /// Serializes construction so each source is built at most once
    build_lock: Mutex<()>,
}

impl DriverCache {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        registry: Arc<DriverRegistry>,
        engine: Arc<PermissionEngine>,
    ) -> Self {
        Self {
            sources,
            registry,
            engine,
            drivers: DashMap::new(),
            build_lock: Mutex::new(()),
        }
    }

    /// Get the secured driver for a source key, building it on first use
    pub async fn get_driver(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Arc<dyn StorageDriver>> {
        if let Some(driver) = self.drivers.get(key) {
            return Ok(Arc::clone(driver.value()));
        }

        let _guard = self.build_lock.lock().await;

        // Another caller may have finished while we waited
        if let Some(driver) = self.drivers.get(key) {
            return Ok(Arc::clone(driver.value()));
        }

        let source = self.resolve_source(key).await?;
        let driver = self.build(ctx, &source).await?;
        self.drivers.insert(key.to_string(), Arc::clone(&driver));
        info!(
            "Initialized driver '{}' for source '{}' ({})",
            driver.name(),
            source.key,
            source.name
        );
        Ok(driver)
    }

    /// Drop and close the driver for a key, if one is cached
    pub async fn evict(&self, key: &str) -> Result<()> {
        let Some((_, driver)) = self.drivers.remove(key) else {
            return Ok(());
        };
        debug!("Evicting driver for source '{}'", key);
        driver.close().await
    }

    /// Close every cached driver; the first error is returned after all were tried
    pub async fn close_all(&self) -> Result<()> {
        let keys: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;
        for key in keys {
            if let Some((_, driver)) = self.drivers.remove(&key) {
                if let Err(e) = driver.close().await {
                    warn!("Failed to close driver for source '{}': {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Look a source up by key, falling back to a numeric id
    async fn resolve_source(&self, key: &str) -> Result<StorageSource> {
        if let Some(source) = self.sources.find_by_key(key).await? {
            return Ok(source);
        }
        if let Ok(id) = key.parse() {
            if let Some(source) = self.sources.find_by_id(id).await? {
                return Ok(source);
            }
        }
        Err(FileHubError::SourceNotFound(key.to_string()))
    }

    async fn build(
        &self,
        ctx: &RequestContext,
        source: &StorageSource,
    ) -> Result<Arc<dyn StorageDriver>> {
        let backend = self.registry.create(&source.driver)?;
        let checker = self.engine.checker_for(source.id);
        let mut driver = SecureDriver::new(backend, checker);

        if let Err(e) = driver.init(ctx, &source.config).await {
            warn!("Failed to initialize source '{}': {}", source.key, e);
            // Release whatever a partial init acquired
            if let Err(close_err) = driver.close().await {
                warn!(
                    "Failed to release partially initialized source '{}': {}",
                    source.key, close_err
                );
            }
            return Err(e);
        }
        Ok(Arc::new(driver))
    }
}
