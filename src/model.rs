//! Records owned by the configuration and identity collaborators

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::error::{FileHubError, Result};

pub type SourceId = u64;
pub type UserId = u64;

/// User role. Only `admin` carries special meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl From<String> for Role {
    fn from(tag: String) -> Self {
        if tag.eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::User
        }
    }
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::User => f.write_str("user"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Opaque to the core; verified by the identity collaborator
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
}

/// A configured instance of a backend type
#[derive(Debug, Clone)]
pub struct StorageSource {
    pub id: SourceId,
    pub key: String,
    pub name: String,
    /// Registry type tag, e.g. "local" or "sftp"
    pub driver: String,
    pub config: DriverConfig,
}

/// One ACL rule scoping a user's access within a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPermission {
    pub user_id: UserId,
    pub source_id: SourceId,
    pub path_prefix: String,
    pub allow_read: bool,
    pub allow_write: bool,
}

/// Scalar value in a driver configuration bag
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(x) => write!(f, "{}", x),
            ConfigValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

/// Backend-specific configuration bag (string -> scalar)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct DriverConfig(BTreeMap<String, ConfigValue>);

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ConfigValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// String value for a key; empty strings count as absent
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(ConfigValue::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn require_str(&self, driver: &str, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| {
            FileHubError::Config(format!("{} driver requires '{}' in config", driver, key))
        })
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Port value given either as a number or a numeric string
    pub fn get_port(&self, key: &str) -> Result<Option<u16>> {
        let invalid = || FileHubError::Config(format!("invalid port value for '{}'", key));
        match self.0.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(i)) => u16::try_from(*i).map(Some).map_err(|_| invalid()),
            Some(ConfigValue::String(s)) if s.is_empty() => Ok(None),
            Some(ConfigValue::String(s)) => s.parse::<u16>().map(Some).map_err(|_| invalid()),
            Some(_) => Err(invalid()),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }
}
