//! Configuration parsing and structures

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;
use crate::model::{DriverConfig, Role, SourceId, StorageSource, User, UserId, UserPermission};
use crate::permission::PrefixMatch;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Access-control settings
    #[serde(default)]
    pub access: AccessConfig,

    /// Per-request settings
    #[serde(default)]
    pub requests: RequestsConfig,

    /// WebDAV bridge settings
    #[serde(default)]
    pub dav: DavConfig,

    /// Storage sources
    #[serde(default)]
    pub sources: Vec<RawSource>,

    /// Users known to the identity store
    #[serde(default)]
    pub users: Vec<RawUser>,

    /// ACL rules, referring to users by name and sources by key
    #[serde(default)]
    pub permissions: Vec<RawPermission>,
}

/// Storage source entry
#[derive(Debug, Clone, Deserialize)]
pub struct RawSource {
    pub id: SourceId,

    /// URL-safe key, e.g. `docs` in `/webdav/docs/`
    pub key: String,

    /// Display name (defaults to the key)
    pub name: Option<String>,

    /// Driver type tag (`local`, `sftp`, `s3`)
    #[serde(rename = "type")]
    pub driver: String,

    /// Driver-specific settings
    #[serde(default)]
    pub config: DriverConfig,
}

/// User entry
#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    pub id: UserId,
    pub username: String,

    #[serde(default)]
    pub password_hash: String,

    #[serde(default)]
    pub role: Role,

    #[serde(default = "default_true")]
    pub active: bool,
}

/// ACL rule entry
#[derive(Debug, Clone, Deserialize)]
pub struct RawPermission {
    /// Username the rule applies to
    pub user: String,

    /// Source key the rule applies to
    pub source: String,

    /// Path prefix inside the source
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub read: bool,

    #[serde(default)]
    pub write: bool,
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    "/".to_string()
}

// =============================================================================
// Shared sections
// =============================================================================

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Access-control configuration
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AccessConfig {
    /// How rule prefixes are compared with request paths
    #[serde(default)]
    pub prefix_match: PrefixMatch,
}

/// Request configuration
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RequestsConfig {
    /// Deadline applied to each operation (none by default)
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// WebDAV bridge configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DavConfig {
    /// Lifetime of a lock when the client does not ask for one
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
        }
    }
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub access: AccessConfig,
    pub requests: RequestsConfig,
    pub dav: DavConfig,
    pub sources: Vec<StorageSource>,
    pub users: Vec<User>,
    pub permissions: Vec<UserPermission>,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config, turning names into ids
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            access,
            requests,
            dav,
            sources,
            users,
            permissions,
        } = self;

        let sources = Self::resolve_sources(sources)?;
        let users = Self::resolve_users(users)?;
        let permissions = Self::resolve_permissions(permissions, &sources, &users)?;

        Ok(Config {
            logging,
            access,
            requests,
            dav,
            sources,
            users,
            permissions,
        })
    }

    fn resolve_sources(raw: Vec<RawSource>) -> Result<Vec<StorageSource>, ConfigError> {
        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        let mut resolved = Vec::with_capacity(raw.len());

        for source in raw {
            if source.key.is_empty() || source.key.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Source {}: key {:?} must be non-empty and contain no '/'",
                    source.id, source.key
                )));
            }
            if source.driver.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Source '{}': type cannot be empty",
                    source.key
                )));
            }
            if !ids.insert(source.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate source id: {}",
                    source.id
                )));
            }
            if !keys.insert(source.key.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate source key: {}",
                    source.key
                )));
            }

            resolved.push(StorageSource {
                id: source.id,
                name: source.name.unwrap_or_else(|| source.key.clone()),
                key: source.key,
                driver: source.driver,
                config: source.config,
            });
        }

        Ok(resolved)
    }

    fn resolve_users(raw: Vec<RawUser>) -> Result<Vec<User>, ConfigError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut resolved = Vec::with_capacity(raw.len());

        for user in raw {
            if user.username.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "User {}: username cannot be empty",
                    user.id
                )));
            }
            if !ids.insert(user.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate user id: {}",
                    user.id
                )));
            }
            if !names.insert(user.username.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate username: {}",
                    user.username
                )));
            }

            resolved.push(User {
                id: user.id,
                username: user.username,
                password_hash: user.password_hash,
                role: user.role,
                active: user.active,
            });
        }

        Ok(resolved)
    }

    fn resolve_permissions(
        raw: Vec<RawPermission>,
        sources: &[StorageSource],
        users: &[User],
    ) -> Result<Vec<UserPermission>, ConfigError> {
        raw.into_iter()
            .map(|rule| {
                let user = users
                    .iter()
                    .find(|u| u.username == rule.user)
                    .ok_or_else(|| {
                        ConfigError::ValidationError(format!(
                            "Permission refers to unknown user '{}'",
                            rule.user
                        ))
                    })?;
                let source = sources
                    .iter()
                    .find(|s| s.key == rule.source)
                    .ok_or_else(|| {
                        ConfigError::ValidationError(format!(
                            "Permission for '{}' refers to unknown source '{}'",
                            rule.user, rule.source
                        ))
                    })?;

                Ok(UserPermission {
                    user_id: user.id,
                    source_id: source.id,
                    path_prefix: rule.prefix,
                    allow_read: rule.read,
                    allow_write: rule.write,
                })
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` first
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one storage source is required".to_string(),
            ));
        }
        if self.dav.lock_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "dav.lock_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn source(&self, key: &str) -> Option<&StorageSource> {
        self.sources.iter().find(|s| s.key == key)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Missing environment variables: {0}")]
    MissingEnv(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::FileHubError {
    fn from(err: ConfigError) -> Self {
        crate::error::FileHubError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
logging:
  level: debug

access:
  prefix_match: literal

requests:
  timeout: 30s

dav:
  lock_timeout: 10m

sources:
  - id: 1
    key: docs
    name: Team documents
    type: local
    config:
      root_path: /srv/docs
  - id: 2
    key: nas
    type: sftp
    config:
      host: nas.internal
      port: 2222
      user: files
      password: secret
      share_name: /export

users:
  - id: 1
    username: admin
    role: admin
  - id: 2
    username: bob
    active: false

permissions:
  - user: bob
    source: docs
    read: true
  - user: bob
    source: docs
    prefix: /work
    read: true
    write: true
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.access.prefix_match, PrefixMatch::Literal);
        assert_eq!(config.requests.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.dav.lock_timeout, Duration::from_secs(600));

        assert_eq!(config.sources.len(), 2);
        let docs = config.source("docs").unwrap();
        assert_eq!(docs.name, "Team documents");
        assert_eq!(docs.driver, "local");
        assert_eq!(docs.config.get_str("root_path"), Some("/srv/docs"));

        let nas = config.source("nas").unwrap();
        assert_eq!(nas.name, "nas");
        assert_eq!(nas.config.get_port("port").unwrap(), Some(2222));

        assert!(config.users[0].role.is_admin());
        assert!(config.users[0].active);
        assert!(!config.users[1].active);

        assert_eq!(config.permissions.len(), 2);
        assert_eq!(config.permissions[0].path_prefix, "/");
        assert_eq!(config.permissions[0].user_id, 2);
        assert_eq!(config.permissions[0].source_id, 1);
        assert!(!config.permissions[0].allow_write);
        assert_eq!(config.permissions[1].path_prefix, "/work");
        assert!(config.permissions[1].allow_write);
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
sources:
  - id: 1
    key: tmp
    type: local
    config:
      root_path: /tmp/x
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.access.prefix_match, PrefixMatch::Segment);
        assert_eq!(config.requests.timeout, None);
        assert_eq!(config.dav.lock_timeout, Duration::from_secs(3600));
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_duplicate_source_key() {
        let yaml = r#"
sources:
  - { id: 1, key: docs, type: local }
  - { id: 2, key: docs, type: local }
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate source key"), "{}", err);
    }

    #[test]
    fn test_duplicate_username() {
        let yaml = r#"
users:
  - { id: 1, username: bob }
  - { id: 2, username: bob }
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate username"), "{}", err);
    }

    #[test]
    fn test_invalid_source_key() {
        let yaml = r#"
sources:
  - { id: 1, key: "a/b", type: local }
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_references() {
        let unknown_user = r#"
sources:
  - { id: 1, key: docs, type: local }
permissions:
  - { user: ghost, source: docs, read: true }
"#;
        let err = Config::from_str(unknown_user).unwrap_err();
        assert!(err.to_string().contains("unknown user 'ghost'"), "{}", err);

        let unknown_source = r#"
users:
  - { id: 1, username: bob }
permissions:
  - { user: bob, source: nowhere, read: true }
"#;
        let err = Config::from_str(unknown_source).unwrap_err();
        assert!(err.to_string().contains("unknown source 'nowhere'"), "{}", err);
    }

    #[test]
    fn test_validate_requires_sources() {
        let config = Config::from_str("users: []").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_substitution_before_parse() {
        std::env::set_var("FILEHUB_TEST_SFTP_PASSWORD", "from-env");
        let yaml = r#"
sources:
  - id: 1
    key: nas
    type: sftp
    config:
      password: ${FILEHUB_TEST_SFTP_PASSWORD}
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(
            config.sources[0].config.get_str("password"),
            Some("from-env")
        );
        std::env::remove_var("FILEHUB_TEST_SFTP_PASSWORD");
    }
}
