//! Authorizing decorator
//!
//! This wraps any driver and asks an injected checker before each call.
//! It keeps no state beyond the wrapped driver and the checker, so one
//! instance is shared by the requests of every principal.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::{resolve_path, FileInfo, OpenFlags, ReadStream, StorageDriver, VfsFile};
use crate::context::RequestContext;
use crate::error::{Action, FileHubError, Result};
use crate::model::DriverConfig;

/// Decides whether the principal in a context may perform an action on a
/// path. `Ok(false)` is a normal denial; `Err` is an infrastructure failure
/// and is propagated as-is.
pub type PermissionChecker =
    Arc<dyn Fn(&RequestContext, &str, Action) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Driver that authorizes every call before delegating
pub struct SecureDriver {
    inner: Box<dyn StorageDriver>,
    checker: PermissionChecker,
}

impl SecureDriver {
    pub fn new(inner: Box<dyn StorageDriver>, checker: PermissionChecker) -> Self {
        Self { inner, checker }
    }

    /// Check `action` on the resolved form of `path` and return that form
    ///
    /// The wrapped driver receives the same resolved path, so `..` segments
    /// cannot steer an operation outside the prefix that was authorized.
    async fn authorize(&self, ctx: &RequestContext, path: &str, action: Action) -> Result<String> {
        let resolved = resolve_path(path).map_err(|e| {
            warn!("Rejected path traversal attempt: {:?}", path);
            e
        })?;
        if (self.checker)(ctx, &resolved, action).await? {
            return Ok(resolved);
        }
        debug!(
            "Denied {} on {} for {:?}",
            action,
            resolved,
            ctx.principal().map(|p| p.username.as_str())
        );
        Err(FileHubError::PermissionDenied {
            path: resolved,
            action,
        })
    }
}

#[async_trait]
impl StorageDriver for SecureDriver {
    fn name(&self) -> String {
        format!("secure-{}", self.inner.name())
    }

    async fn init(&mut self, ctx: &RequestContext, config: &DriverConfig) -> Result<()> {
        self.inner.init(ctx, config).await
    }

    async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<FileInfo>> {
        let path = self.authorize(ctx, path, Action::Read).await?;
        self.inner.list(ctx, &path).await
    }

    async fn open(&self, ctx: &RequestContext, path: &str) -> Result<ReadStream> {
        let path = self.authorize(ctx, path, Action::Read).await?;
        self.inner.open(ctx, &path).await
    }

    async fn open_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn VfsFile>> {
        let action = if flags.is_write() {
            Action::Write
        } else {
            Action::Read
        };
        let path = self.authorize(ctx, path, action).await?;
        self.inner.open_file(ctx, &path, flags, mode).await
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: Option<u64>,
    ) -> Result<u64> {
        let path = self.authorize(ctx, path, Action::Write).await?;
        self.inner.create(ctx, &path, reader, size).await
    }

    async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let path = self.authorize(ctx, path, Action::Write).await?;
        self.inner.mkdir(ctx, &path).await
    }

    async fn stat(&self, ctx: &RequestContext, path: &str) -> Result<FileInfo> {
        let path = self.authorize(ctx, path, Action::Read).await?;
        self.inner.stat(ctx, &path).await
    }

    async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let path = self.authorize(ctx, path, Action::Write).await?;
        self.inner.delete(ctx, &path).await
    }

    async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()> {
        let from = self.authorize(ctx, from, Action::Write).await?;
        let to = self.authorize(ctx, to, Action::Write).await?;
        self.inner.rename(ctx, &from, &to).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
