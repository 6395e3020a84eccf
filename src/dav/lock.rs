//! In-memory WebDAV lock manager
//!
//! All locks are exclusive write locks. A lock on a path conflicts with a
//! lock on the same path, with an infinite-depth lock on any ancestor, and
//! (when the new lock has infinite depth) with any lock below it. Expired
//! locks are dropped lazily on the next call.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::driver::resolve_path;
use crate::error::{FileHubError, Result};

/// What a client asked to lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDetails {
    /// Locked resource, as a virtual path
    pub root: String,
    /// Requested lifetime; `None` uses the table default
    pub duration: Option<Duration>,
    /// Owner element as sent by the client, stored verbatim
    pub owner_xml: String,
    /// Depth 0 lock covering only `root` itself
    pub zero_depth: bool,
}

impl LockDetails {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            duration: None,
            owner_xml: String::new(),
            zero_depth: false,
        }
    }

    pub fn zero_depth(mut self) -> Self {
        self.zero_depth = true;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_owner(mut self, owner_xml: impl Into<String>) -> Self {
        self.owner_xml = owner_xml.into();
        self
    }
}

#[derive(Debug)]
struct ActiveLock {
    details: LockDetails,
    expires: Instant,
}

impl ActiveLock {
    /// Whether this lock applies to `path`
    fn covers(&self, path: &str) -> bool {
        let root = self.details.root.as_str();
        path == root || (!self.details.zero_depth && is_descendant(path, root))
    }
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub struct LockTable {
    locks: Mutex<HashMap<String, ActiveLock>>,
    default_timeout: Duration,
}

impl LockTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Take a new lock, returning its token
    pub fn create(&self, now: Instant, mut details: LockDetails) -> Result<String> {
        details.root = resolve_path(&details.root)?;
        let mut locks = self.locks.lock();
        prune(&mut locks, now);

        let conflict = locks.values().any(|held| {
            held.covers(&details.root)
                || (!details.zero_depth && is_descendant(&held.details.root, &details.root))
        });
        if conflict {
            debug!("Lock on {} conflicts with an existing lock", details.root);
            return Err(FileHubError::Locked(details.root));
        }

        let token = format!("opaquelocktoken:{}", Uuid::new_v4());
        let expires = now + details.duration.unwrap_or(self.default_timeout);
        trace!("Locked {} as {}", details.root, token);
        locks.insert(token.clone(), ActiveLock { details, expires });
        Ok(token)
    }

    /// Extend a held lock
    pub fn refresh(&self, now: Instant, token: &str, duration: Option<Duration>) -> Result<LockDetails> {
        let mut locks = self.locks.lock();
        prune(&mut locks, now);

        let held = locks.get_mut(token).ok_or_else(|| no_such_lock(token))?;
        if duration.is_some() {
            held.details.duration = duration;
        }
        held.expires = now + held.details.duration.unwrap_or(self.default_timeout);
        Ok(held.details.clone())
    }

    pub fn unlock(&self, now: Instant, token: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        prune(&mut locks, now);

        let held = locks.remove(token).ok_or_else(|| no_such_lock(token))?;
        trace!("Unlocked {}", held.details.root);
        Ok(())
    }

    /// Check that `tokens` cover every lock applying to `path`
    pub fn confirm(&self, now: Instant, path: &str, tokens: &[&str]) -> Result<()> {
        let path = resolve_path(path)?;
        let mut locks = self.locks.lock();
        prune(&mut locks, now);

        let blocked = locks
            .iter()
            .any(|(token, held)| held.covers(&path) && !tokens.contains(&token.as_str()));
        if blocked {
            return Err(FileHubError::Locked(path));
        }
        Ok(())
    }

    /// Number of unexpired locks
    pub fn active(&self, now: Instant) -> usize {
        let mut locks = self.locks.lock();
        prune(&mut locks, now);
        locks.len()
    }
}

fn prune(locks: &mut HashMap<String, ActiveLock>, now: Instant) {
    locks.retain(|_, held| held.expires > now);
}

fn no_such_lock(token: &str) -> FileHubError {
    FileHubError::NotFound(format!("lock {}", token))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_token_format() {
        let table = LockTable::new(HOUR);
        let token = table.create(Instant::now(), LockDetails::new("/a")).unwrap();
        let uuid = token.strip_prefix("opaquelocktoken:").unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
    }

    #[test]
    fn test_conflicts() {
        let table = LockTable::new(HOUR);
        let now = Instant::now();
        table.create(now, LockDetails::new("/docs")).unwrap();

        // Same path, descendant of an infinite lock, and ancestor with infinite depth
        for root in ["/docs", "/docs/a.txt", "/"] {
            let err = table.create(now, LockDetails::new(root)).unwrap_err();
            assert!(matches!(err, FileHubError::Locked(_)), "{}", root);
        }

        // Siblings and zero-depth ancestors are fine
        table.create(now, LockDetails::new("/docsx")).unwrap();
        table.create(now, LockDetails::new("/").zero_depth()).unwrap();
        assert_eq!(table.active(now), 3);
    }

    #[test]
    fn test_zero_depth_lock_leaves_children_free() {
        let table = LockTable::new(HOUR);
        let now = Instant::now();
        table.create(now, LockDetails::new("/dir").zero_depth()).unwrap();
        table.create(now, LockDetails::new("/dir/child")).unwrap();
        assert!(table.create(now, LockDetails::new("/dir")).is_err());
    }

    #[test]
    fn test_paths_are_normalized() {
        let table = LockTable::new(HOUR);
        let now = Instant::now();
        table.create(now, LockDetails::new("docs/")).unwrap();
        assert!(table.create(now, LockDetails::new("/docs")).is_err());
        assert!(table.create(now, LockDetails::new("/other/../docs/a")).is_err());
        assert!(table
            .create(now, LockDetails::new("/../x"))
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn test_expiry_and_refresh() {
        let table = LockTable::new(HOUR);
        let start = Instant::now();
        let token = table
            .create(start, LockDetails::new("/a").with_duration(Duration::from_secs(10)))
            .unwrap();

        let details = table
            .refresh(start + Duration::from_secs(5), &token, None)
            .unwrap();
        assert_eq!(details.root, "/a");

        // Refreshed at 5s, so still held at 12s
        assert_eq!(table.active(start + Duration::from_secs(12)), 1);
        assert_eq!(table.active(start + Duration::from_secs(15)), 0);

        let err = table
            .refresh(start + Duration::from_secs(16), &token, None)
            .unwrap_err();
        assert!(err.is_not_found());
        table
            .create(start + Duration::from_secs(16), LockDetails::new("/a"))
            .unwrap();
    }

    #[test]
    fn test_unlock() {
        let table = LockTable::new(HOUR);
        let now = Instant::now();
        let token = table.create(now, LockDetails::new("/a")).unwrap();
        table.unlock(now, &token).unwrap();
        assert!(table.unlock(now, &token).is_err());
        table.create(now, LockDetails::new("/a")).unwrap();
    }

    #[test]
    fn test_confirm() {
        let table = LockTable::new(HOUR);
        let now = Instant::now();
        let token = table
            .create(now, LockDetails::new("/docs").with_owner("<owner>bob</owner>"))
            .unwrap();

        assert!(table.confirm(now, "/other", &[]).is_ok());
        assert!(table.confirm(now, "/docs/a.txt", &[]).is_err());
        assert!(table.confirm(now, "/docs/a.txt", &[token.as_str()]).is_ok());
        assert!(table.confirm(now, "/docs", &["opaquelocktoken:wrong"]).is_err());
    }
}
