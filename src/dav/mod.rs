//! WebDAV filesystem surface over storage drivers
//!
//! Sources are served under `/webdav/<key>/`. [`DavBridge`] rewrites
//! request paths to the driver's virtual paths and owns one [`LockTable`]
//! per source; [`DavFs`] is the filesystem view a WebDAV handler drives.

pub mod lock;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::cache::DriverCache;
use crate::context::RequestContext;
use crate::driver::{resolve_path, FileInfo, OpenFlags, StorageDriver, VfsFile};
use crate::error::Result;

pub use lock::{LockDetails, LockTable};

/// Mount point of all sources
pub const DAV_ROOT: &str = "/webdav";

pub struct DavBridge {
    drivers: Arc<DriverCache>,
    lock_tables: DashMap<String, Arc<LockTable>>,
    lock_timeout: Duration,
}

impl DavBridge {
    pub fn new(drivers: Arc<DriverCache>, lock_timeout: Duration) -> Self {
        Self {
            drivers,
            lock_tables: DashMap::new(),
            lock_timeout,
        }
    }

    /// URL prefix of a source, always with a trailing slash
    pub fn prefix(key: &str) -> String {
        format!("{}/{}/", DAV_ROOT, key)
    }

    /// Add the trailing slash to a request for the source root itself
    ///
    /// Some clients request `/webdav/<key>` without the slash, which would
    /// otherwise not match the prefix.
    pub fn normalize_request_path(path: &str, key: &str) -> String {
        let bare = format!("{}/{}", DAV_ROOT, key);
        if path == bare {
            format!("{}/", path)
        } else {
            path.to_string()
        }
    }

    /// Rewrite a request path under the source's prefix to a virtual path
    ///
    /// Returns `None` when the path lies outside the source, including
    /// paths whose `..` segments climb above the source root.
    pub fn strip_prefix(path: &str, key: &str) -> Option<String> {
        let path = Self::normalize_request_path(path, key);
        let rest = path.strip_prefix(Self::prefix(key).as_str())?;
        resolve_path(rest).ok()
    }

    /// The lock table of a source, created on first use
    pub fn lock_table(&self, key: &str) -> Arc<LockTable> {
        if let Some(table) = self.lock_tables.get(key) {
            return Arc::clone(table.value());
        }

        // Racing creators may both build a table; the first insert wins
        let fresh = Arc::new(LockTable::new(self.lock_timeout));
        let table = self
            .lock_tables
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Created lock table for source '{}'", key);
                fresh
            });
        Arc::clone(table.value())
    }

    /// Filesystem view of a source for one request
    pub async fn filesystem(&self, ctx: &RequestContext, key: &str) -> Result<DavFs> {
        let driver = self.drivers.get_driver(ctx, key).await?;
        Ok(DavFs {
            key: key.to_string(),
            driver,
            locks: self.lock_table(key),
        })
    }
}

/// One source as seen by a WebDAV handler
///
/// Paths are virtual paths, already stripped of the source prefix.
pub struct DavFs {
    key: String,
    driver: Arc<dyn StorageDriver>,
    locks: Arc<LockTable>,
}

impl DavFs {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub async fn mkdir(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.driver.mkdir(ctx, name).await
    }

    pub async fn open_file(
        &self,
        ctx: &RequestContext,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn VfsFile>> {
        self.driver.open_file(ctx, name, flags, mode).await
    }

    pub async fn remove_all(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.driver.delete(ctx, name).await
    }

    pub async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()> {
        self.driver.rename(ctx, from, to).await
    }

    pub async fn stat(&self, ctx: &RequestContext, name: &str) -> Result<FileInfo> {
        self.driver.stat(ctx, name).await
    }

    pub async fn read_dir(&self, ctx: &RequestContext, name: &str) -> Result<Vec<FileInfo>> {
        self.driver.list(ctx, name).await
    }
}
