pub mod handle;
pub mod local;
pub mod registry;
pub mod s3;
pub mod secure;
pub mod sftp;

use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::context::RequestContext;
use crate::error::{FileHubError, Result};
use crate::model::DriverConfig;

pub use handle::DirectoryHandle;
pub use registry::{register_builtins, DriverConstructor, DriverRegistry};
pub use secure::{PermissionChecker, SecureDriver};

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Name of the marker file the default `mkdir` writes
pub const DIR_PLACEHOLDER: &str = ".dir_placeholder";

/// Metadata for a file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: SystemTime,
}

impl FileInfo {
    pub fn file(name: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            modified,
        }
    }

    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            size: 0,
            is_dir: true,
            modified,
        }
    }
}

/// Open flags for [`StorageDriver::open_file`], mirroring `OpenOptions`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub create_new: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Whether any flag can modify the target
    pub fn is_write(&self) -> bool {
        self.write || self.append || self.create || self.truncate || self.create_new
    }
}

/// Readable stream returned by [`StorageDriver::open`]
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Handle returned by [`StorageDriver::open_file`]
///
/// Files support seekable reads and writes; directory handles support
/// `read_dir`. Writes are only guaranteed durable after `close`.
#[async_trait]
pub trait VfsFile: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {
    /// Read up to `count` directory entries (0 = all remaining)
    async fn read_dir(&mut self, count: usize) -> Result<Vec<FileInfo>>;

    async fn stat(&mut self) -> Result<FileInfo>;

    /// Flush and release the handle
    async fn close(&mut self) -> Result<()>;
}

/// Core driver trait for storage backends
///
/// All paths are virtual, `/`-separated and rooted at the storage source.
/// Drivers are created uninitialized by the registry and receive their
/// configuration through `init`.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver name, e.g. "local"
    fn name(&self) -> String;

    /// Initialize from the source's configuration bag
    async fn init(&mut self, ctx: &RequestContext, config: &DriverConfig) -> Result<()>;

    /// List directory contents
    async fn list(&self, ctx: &RequestContext, path: &str) -> Result<Vec<FileInfo>>;

    /// Open a file for streaming reads
    async fn open(&self, ctx: &RequestContext, path: &str) -> Result<ReadStream>;

    /// Open a seekable handle for reading, writing or listing
    async fn open_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn VfsFile>>;

    /// Create or replace a file from a stream
    ///
    /// # Arguments
    /// * `reader` - Content source
    /// * `size` - Expected size if known
    ///
    /// # Returns
    /// Number of bytes written
    async fn create(
        &self,
        ctx: &RequestContext,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: Option<u64>,
    ) -> Result<u64>;

    /// Create a directory
    ///
    /// Default implementation writes a placeholder file inside the new
    /// directory through `create`.
    async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let marker = join_path(path, DIR_PLACEHOLDER);
        let mut empty = tokio::io::empty();
        self.create(ctx, &marker, &mut empty, Some(0)).await?;
        Ok(())
    }

    /// Get metadata for a path
    async fn stat(&self, ctx: &RequestContext, path: &str) -> Result<FileInfo>;

    /// Remove a file, or a directory with all its contents
    async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()>;

    /// Rename/move within the same source
    async fn rename(&self, ctx: &RequestContext, from: &str, to: &str) -> Result<()>;

    /// Release held resources; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Resolve a virtual path to `/a/b` form
///
/// `.` and empty segments are dropped and `..` removes the previous
/// segment. A path that climbs above the root is refused with
/// `AccessDenied`, never clamped.
pub fn resolve_path(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FileHubError::AccessDenied(format!(
                        "path traversal attempt: {}",
                        path
                    )));
                }
            }
            part => segments.push(part),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Join a child name onto a virtual directory path
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last segment of a virtual path ("" for the root)
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_write_classification() {
        assert!(!OpenFlags::read_only().is_write());
        assert!(OpenFlags::write_only().is_write());
        assert!(OpenFlags::read_write().is_write());
        assert!(OpenFlags::read_only().create(true).is_write());
        assert!(OpenFlags::read_only().truncate(true).is_write());
        assert!(OpenFlags::read_only().append(true).is_write());
        assert!(OpenFlags::read_only().create_new(true).is_write());
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("").unwrap(), "/");
        assert_eq!(resolve_path("/").unwrap(), "/");
        assert_eq!(resolve_path("a/b").unwrap(), "/a/b");
        assert_eq!(resolve_path("//a/./b/").unwrap(), "/a/b");
        assert_eq!(resolve_path("a\\b").unwrap(), "/a/b");
        assert_eq!(resolve_path("/a/../b").unwrap(), "/b");
        assert_eq!(resolve_path("/work/../other.txt").unwrap(), "/other.txt");
        assert_eq!(resolve_path("/a/b/../..").unwrap(), "/");
    }

    #[test]
    fn test_resolve_path_refuses_escapes() {
        for path in ["..", "/../x", "a/../../x", "/work/../../etc/passwd", "..\\x"] {
            let err = resolve_path(path).unwrap_err();
            assert!(matches!(err, FileHubError::AccessDenied(_)), "{}", path);
        }
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/docs/", "x"), "/docs/x");
        assert_eq!(join_path("docs", "/x"), "docs/x");
        assert_eq!(base_name("/docs/report.txt"), "report.txt");
        assert_eq!(base_name("/docs/"), "docs");
        assert_eq!(base_name("/"), "");
    }
}
