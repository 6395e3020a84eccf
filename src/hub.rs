//! Process-level wiring and lifecycle

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::DriverCache;
use crate::config::Config;
use crate::context::{Principal, RequestContext};
use crate::dav::DavBridge;
use crate::driver::{DriverRegistry, StorageDriver};
use crate::error::{FileHubError, Result};
use crate::model::StorageSource;
use crate::permission::PermissionEngine;
use crate::store::{SourceRepository, StaticStore, UserRepository};

/// Owns the store, permission engine, driver cache and WebDAV bridge
pub struct FileHub {
    store: Arc<StaticStore>,
    engine: Arc<PermissionEngine>,
    drivers: Arc<DriverCache>,
    dav: DavBridge,
    request_timeout: Option<Duration>,
}

impl FileHub {
    /// Build from configuration with the built-in backends
    pub fn from_config(config: &Config) -> Self {
        Self::with_registry(config, DriverRegistry::with_builtins())
    }

    pub fn with_registry(config: &Config, registry: DriverRegistry) -> Self {
        let store = Arc::new(StaticStore::from_config(config));
        let engine = Arc::new(PermissionEngine::new(
            store.clone(),
            store.clone(),
            config.access.prefix_match,
        ));
        let drivers = Arc::new(DriverCache::new(
            store.clone(),
            Arc::new(registry),
            engine.clone(),
        ));
        let dav = DavBridge::new(drivers.clone(), config.dav.lock_timeout);

        info!(
            "filehub ready: {} source(s), {} user(s), {:?} prefix matching",
            config.sources.len(),
            config.users.len(),
            config.access.prefix_match
        );

        Self {
            store,
            engine,
            drivers,
            dav,
            request_timeout: config.requests.timeout,
        }
    }

    /// Request context for a known, active user
    ///
    /// Applies the configured request timeout.
    pub async fn login(&self, username: &str) -> Result<RequestContext> {
        let user = self
            .store
            .find_by_username(username)
            .await?
            .filter(|u| u.active)
            .ok_or_else(|| FileHubError::NotFound(format!("user '{}'", username)))?;

        let ctx = RequestContext::for_principal(Principal::new(user.id, user.username, user.role));
        Ok(match self.request_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        })
    }

    pub async fn sources(&self) -> Result<Vec<StorageSource>> {
        self.store.find_all().await
    }

    /// Secured driver for a source key
    pub async fn driver(&self, ctx: &RequestContext, key: &str) -> Result<Arc<dyn StorageDriver>> {
        self.drivers.get_driver(ctx, key).await
    }

    pub fn store(&self) -> &Arc<StaticStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<PermissionEngine> {
        &self.engine
    }

    pub fn drivers(&self) -> &Arc<DriverCache> {
        &self.drivers
    }

    pub fn dav(&self) -> &DavBridge {
        &self.dav
    }

    /// Close every live driver
    pub async fn shutdown(&self) -> Result<()> {
        info!("Closing {} driver(s)", self.drivers.len());
        self.drivers.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
requests:
  timeout: 30s
sources:
  - id: 1
    key: docs
    type: local
    config:
      root_path: /tmp/filehub-hub-test
users:
  - id: 1
    username: alice
    role: admin
  - id: 2
    username: mallory
    active: false
"#;

    #[tokio::test]
    async fn test_login() {
        let config = Config::from_str(CONFIG).unwrap();
        let hub = FileHub::from_config(&config);

        let ctx = hub.login("alice").await.unwrap();
        let principal = ctx.principal().unwrap();
        assert_eq!(principal.user_id, 1);
        assert!(principal.role.is_admin());

        assert!(hub.login("mallory").await.unwrap_err().is_not_found());
        assert!(hub.login("nobody").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sources_listed() {
        let config = Config::from_str(CONFIG).unwrap();
        let hub = FileHub::from_config(&config);
        let sources = hub.sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].key, "docs");
        assert!(hub.drivers().is_empty());
        hub.shutdown().await.unwrap();
    }
}
