//! Driver registry: type name -> constructor

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::local::LocalDriver;
use super::s3::S3Driver;
use super::sftp::SftpDriver;
use super::StorageDriver;
use crate::error::{FileHubError, Result};

/// Builds a new, uninitialized driver instance
pub type DriverConstructor = Arc<dyn Fn() -> Box<dyn StorageDriver> + Send + Sync>;

/// Thread-safe map of backend type names to constructors
#[derive(Default)]
pub struct DriverRegistry {
    constructors: RwLock<HashMap<String, DriverConstructor>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }

    /// Register a constructor, replacing any previous one under `name`
    ///
    /// # Panics
    /// If `name` is empty.
    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn StorageDriver> + Send + Sync + 'static,
    {
        assert!(!name.is_empty(), "driver type name must not be empty");
        let previous = self
            .constructors
            .write()
            .insert(name.to_string(), Arc::new(constructor));
        if previous.is_some() {
            debug!("Replaced driver constructor for type '{}'", name);
        } else {
            debug!("Registered driver type '{}'", name);
        }
    }

    /// Create a new uninitialized driver of the given type
    pub fn create(&self, name: &str) -> Result<Box<dyn StorageDriver>> {
        // Clone out so the constructor runs without holding the lock
        let constructor = self
            .constructors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FileHubError::UnknownDriver(name.to_string()))?;
        Ok(constructor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered type names, sorted
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Register the backends compiled into this crate
pub fn register_builtins(registry: &DriverRegistry) {
    registry.register("local", || Box::new(LocalDriver::new()));
    registry.register("sftp", || Box::new(SftpDriver::new()));
    registry.register("s3", || Box::new(S3Driver::new()));
}
