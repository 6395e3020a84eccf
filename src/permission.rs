//! Path-prefix access control
//!
//! A user's access to a source is a list of rules, each granting read
//! and/or write below a path prefix. The longest matching prefix decides.
//! No matching rule means no access, and admins bypass the rules entirely.
//!
//! User records and rule lists are cached per key and loaded at most once
//! under concurrent first access; the `invalidate_*` methods drop entries
//! after the underlying records changed.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::context::{Principal, RequestContext};
use crate::driver::{resolve_path, PermissionChecker};
use crate::error::{Action, FileHubError, Result};
use crate::model::{SourceId, User, UserId, UserPermission};
use crate::store::{PermissionRepository, UserRepository};

/// How a rule prefix is compared with a request path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixMatch {
    /// Match on whole path segments: `/work` covers `/work/a` but not `/working`
    #[default]
    Segment,
    /// Plain string prefix: `/work` also covers `/working`
    Literal,
}

impl PrefixMatch {
    /// Normalized prefix length when `prefix` covers `path`
    fn matched_len(self, prefix: &str, path: &str) -> Option<usize> {
        match self {
            PrefixMatch::Literal => {
                let prefix = with_leading_slash(prefix);
                with_leading_slash(path)
                    .starts_with(prefix.as_str())
                    .then_some(prefix.len())
            }
            PrefixMatch::Segment => {
                let prefix = normalize(prefix);
                let path = normalize(path);
                let covers = prefix == "/"
                    || path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'));
                covers.then_some(prefix.len())
            }
        }
    }
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Leading slash, no empty or `.` segments, no trailing slash
fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Pick the rule with the longest matching prefix; ties go to the first one
fn best_match<'a>(
    rules: &'a [UserPermission],
    path: &str,
    mode: PrefixMatch,
) -> Option<&'a UserPermission> {
    let mut best: Option<(&UserPermission, usize)> = None;
    for rule in rules {
        if let Some(len) = mode.matched_len(&rule.path_prefix, path) {
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((rule, len));
            }
        }
    }
    best.map(|(rule, _)| rule)
}

pub struct PermissionEngine {
    users: Arc<dyn UserRepository>,
    rules: Arc<dyn PermissionRepository>,
    mode: PrefixMatch,
    user_cache: DashMap<String, Arc<OnceCell<User>>>,
    rule_cache: DashMap<(UserId, SourceId), Arc<OnceCell<Arc<Vec<UserPermission>>>>>,
}

impl PermissionEngine {
    pub fn new(
        users: Arc<dyn UserRepository>,
        rules: Arc<dyn PermissionRepository>,
        mode: PrefixMatch,
    ) -> Self {
        Self {
            users,
            rules,
            mode,
            user_cache: DashMap::new(),
            rule_cache: DashMap::new(),
        }
    }

    pub fn mode(&self) -> PrefixMatch {
        self.mode
    }

    /// Whether `principal` may perform `action` on `path` in a source
    pub async fn check_permission(
        &self,
        principal: &Principal,
        source_id: SourceId,
        path: &str,
        action: Action,
    ) -> bool {
        let Some(user) = self.resolve_user(&principal.username).await else {
            return false;
        };
        if !user.active {
            debug!("Denied {} on {}: user '{}' is inactive", action, path, user.username);
            return false;
        }
        if user.role.is_admin() {
            trace!("Allowed {} on {}: '{}' is admin", action, path, user.username);
            return true;
        }

        let Ok(path) = resolve_path(path) else {
            debug!("Denied {} on {}: path climbs above the root", action, path);
            return false;
        };
        let path = path.as_str();

        let Some(rules) = self.load_rules(user.id, source_id).await else {
            return false;
        };

        let Some(rule) = best_match(&rules, path, self.mode) else {
            debug!(
                "Denied {} on {} for '{}': no matching rule in source {}",
                action, path, user.username, source_id
            );
            return false;
        };

        let allowed = match action {
            Action::Write => rule.allow_write,
            Action::Read => rule.allow_read,
        };
        trace!(
            "{} {} on {} for '{}' by rule {:?}",
            if allowed { "Allowed" } else { "Denied" },
            action,
            path,
            user.username,
            rule.path_prefix
        );
        allowed
    }

    /// Checker for one source that reads the principal from each call's context
    pub fn checker_for(self: &Arc<Self>, source_id: SourceId) -> PermissionChecker {
        let engine = Arc::clone(self);
        Arc::new(
            move |ctx: &RequestContext, path: &str, action: Action| -> BoxFuture<'static, Result<bool>> {
                let engine = Arc::clone(&engine);
                let principal = ctx.principal().cloned();
                let path = path.to_string();
                Box::pin(async move {
                    let principal = principal.ok_or(FileHubError::Unauthenticated)?;
                    Ok(engine
                        .check_permission(&principal, source_id, &path, action)
                        .await)
                })
            },
        )
    }

    /// Forget the cached record of one user
    pub fn invalidate_user(&self, username: &str) {
        self.user_cache.remove(username);
    }

    /// Forget the cached rules of one (user, source) pair
    pub fn invalidate_rules(&self, user_id: UserId, source_id: SourceId) {
        self.rule_cache.remove(&(user_id, source_id));
    }

    pub fn clear(&self) {
        self.user_cache.clear();
        self.rule_cache.clear();
    }

    async fn resolve_user(&self, username: &str) -> Option<User> {
        let cell = self
            .user_cache
            .entry(username.to_string())
            .or_default()
            .clone();

        // Unknown users and lookup failures are not cached
        let loaded = cell
            .get_or_try_init(|| async {
                match self.users.find_by_username(username).await {
                    Ok(Some(user)) => Ok(user),
                    Ok(None) => Err(None),
                    Err(e) => Err(Some(e)),
                }
            })
            .await;

        match loaded {
            Ok(user) => Some(user.clone()),
            Err(None) => {
                debug!("Denied: unknown user '{}'", username);
                None
            }
            Err(Some(e)) => {
                warn!("Denied: user lookup for '{}' failed: {}", username, e);
                None
            }
        }
    }

    async fn load_rules(
        &self,
        user_id: UserId,
        source_id: SourceId,
    ) -> Option<Arc<Vec<UserPermission>>> {
        let cell = self
            .rule_cache
            .entry((user_id, source_id))
            .or_default()
            .clone();

        // An empty rule list is a valid, cached answer
        let loaded = cell
            .get_or_try_init(|| async {
                self.rules
                    .find_by_user_and_source(user_id, source_id)
                    .await
                    .map(Arc::new)
            })
            .await;

        match loaded {
            Ok(rules) => Some(Arc::clone(rules)),
            Err(e) => {
                warn!(
                    "Denied: rule lookup for user {} in source {} failed: {}",
                    user_id, source_id, e
                );
                None
            }
        }
    }
}
