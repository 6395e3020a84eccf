//! Repositories the core reads sources, users and ACL rules from
//!
//! The traits are the seam to whatever persists these records. `StaticStore`
//! is the in-memory implementation built from the configuration file.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::Config;
use crate::error::Result;
use crate::model::{SourceId, StorageSource, User, UserId, UserPermission};

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn find_by_key(&self, key: &str) -> Result<Option<StorageSource>>;

    async fn find_by_id(&self, id: SourceId) -> Result<Option<StorageSource>>;

    async fn find_all(&self) -> Result<Vec<StorageSource>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    /// All rules for a (user, source) pair, in registration order
    async fn find_by_user_and_source(
        &self,
        user_id: UserId,
        source_id: SourceId,
    ) -> Result<Vec<UserPermission>>;
}

#[derive(Default)]
struct Tables {
    sources: Vec<StorageSource>,
    users: HashMap<UserId, User>,
    permissions: Vec<UserPermission>,
}

/// In-memory store implementing all three repositories
#[derive(Default)]
pub struct StaticStore {
    tables: RwLock<Tables>,
}

impl StaticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        for source in &config.sources {
            store.upsert_source(source.clone());
        }
        for user in &config.users {
            store.upsert_user(user.clone());
        }
        for rule in &config.permissions {
            store.add_permission(rule.clone());
        }
        store
    }

    /// Insert a source, replacing one with the same id
    pub fn upsert_source(&self, source: StorageSource) {
        let mut tables = self.tables.write();
        match tables.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source,
            None => tables.sources.push(source),
        }
    }

    pub fn upsert_user(&self, user: User) {
        self.tables.write().users.insert(user.id, user);
    }

    /// Append a rule; earlier rules win ties on equal prefix length
    pub fn add_permission(&self, rule: UserPermission) {
        self.tables.write().permissions.push(rule);
    }

    /// Remove every rule for a (user, source) pair
    pub fn clear_permissions(&self, user_id: UserId, source_id: SourceId) {
        self.tables
            .write()
            .permissions
            .retain(|p| !(p.user_id == user_id && p.source_id == source_id));
    }
}

#[async_trait]
impl SourceRepository for StaticStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<StorageSource>> {
        Ok(self
            .tables
            .read()
            .sources
            .iter()
            .find(|s| s.key == key)
            .cloned())
    }

    async fn find_by_id(&self, id: SourceId) -> Result<Option<StorageSource>> {
        Ok(self
            .tables
            .read()
            .sources
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn find_all(&self) -> Result<Vec<StorageSource>> {
        Ok(self.tables.read().sources.clone())
    }
}

#[async_trait]
impl UserRepository for StaticStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .tables
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables.read().users.get(&id).cloned())
    }
}

#[async_trait]
impl PermissionRepository for StaticStore {
    async fn find_by_user_and_source(
        &self,
        user_id: UserId,
        source_id: SourceId,
    ) -> Result<Vec<UserPermission>> {
        Ok(self
            .tables
            .read()
            .permissions
            .iter()
            .filter(|p| p.user_id == user_id && p.source_id == source_id)
            .cloned()
            .collect())
    }
}
